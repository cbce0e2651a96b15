// Copyright 2025 rbgp Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::bgp::msg::{read_bgp_message, BgpMessage};
use crate::bgp::utils::ParserError;
use crate::log::trace;
use crate::net::local_ipv4;
use std::net::{IpAddr, Ipv4Addr};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(super) type ReadResult = Result<BgpMessage, ParserError>;

/// Live transport for one session.
///
/// Inbound framing runs on its own task and hands complete messages to the
/// peer task, so a slow peer never blocks timers. The reader stops after the
/// first error and is aborted when the connection is dropped.
pub(super) struct TcpConnection {
    tx: OwnedWriteHalf,
    pub msg_rx: mpsc::UnboundedReceiver<ReadResult>,
    pub local_ip: Option<Ipv4Addr>,
    reader: JoinHandle<()>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream, peer_ip: IpAddr) -> Self {
        let local_ip = local_ipv4(&stream);
        let (mut rx, tx) = stream.into_split();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            loop {
                let result = read_bgp_message(&mut rx).await;
                let failed = result.is_err();
                if msg_tx.send(result).is_err() || failed {
                    trace!(%peer_ip, "reader task exiting");
                    return;
                }
            }
        });

        TcpConnection {
            tx,
            msg_rx,
            local_ip,
            reader,
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.tx.write_all(bytes).await
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
