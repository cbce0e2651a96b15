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

//! Common test utilities for BGP server testing

#![allow(dead_code)]

use rbgp::bgp::msg::{read_bgp_message, BgpMessage, Message, MessageType, BGP_MARKER};
use rbgp::bgp::msg_keepalive::KeepaliveMessage;
use rbgp::bgp::msg_notification::NotificationMessage;
use rbgp::bgp::msg_open::OpenMessage;
use rbgp::bgp::msg_update::{AsPathSegment, Origin, PathAttrValue, PathAttribute, UpdateMessage};
use rbgp::config::{Config, PeerConfig};
use rbgp::net::Ipv4Net;
use rbgp::peer::BgpState;
use rbgp::server::BgpServer;
use rbgp::server_ops::{MgmtHandle, PeerSummary};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing_subscriber::EnvFilter;

/// Initialize tracing for tests. Uses RUST_LOG, defaulting to debug for rbgp.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_test_logging() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "rbgp=debug".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

/// Running server plus the handle used to query it. The server task is
/// aborted on drop.
pub struct TestServer {
    pub handle: MgmtHandle,
    pub bgp_port: u16,
    pub address: IpAddr,
    pub config: Config,
    task: JoinHandle<std::io::Result<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    pub async fn peer(&self, addr: &str) -> PeerSummary {
        self.handle.get_peer(addr).await.unwrap()
    }

    pub async fn peer_state(&self, addr: &str) -> Option<BgpState> {
        self.handle.get_peer(addr).await.ok().map(|p| p.state)
    }

    /// Best-path prefixes currently in the Loc-RIB.
    pub async fn best_prefixes(&self) -> Vec<Ipv4Net> {
        self.handle
            .get_loc_rib_best()
            .await
            .unwrap()
            .into_iter()
            .map(|route| route.prefix)
            .collect()
    }
}

pub fn test_config(asn: u16) -> Config {
    Config::new(asn, "127.0.0.1:0", Ipv4Addr::new(1, 1, 1, 1), 90)
}

/// Passive peer entry; the fake peer always dials in.
pub fn passive_peer(address: &str, remote_asn: u16) -> PeerConfig {
    PeerConfig {
        passive_mode: true,
        ..PeerConfig::new(address, remote_asn)
    }
}

/// Start a server and wait until its listener is bound.
pub async fn start_test_server(mut config: Config) -> TestServer {
    init_test_logging();

    // Default 30s retry is too slow for tests
    config.connect_retry_secs = 1;

    let address: IpAddr = config.listen_sockaddr().unwrap().ip();
    let server = BgpServer::new(config.clone()).expect("valid server config");
    let handle = server.mgmt_handle();
    let task = tokio::spawn(server.run());

    let mut bgp_port = 0;
    for _ in 0..50 {
        if let Ok(Some(addr)) = handle.get_server_info().await.map(|info| info.listen_addr) {
            bgp_port = addr.port();
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    assert!(bgp_port > 0, "Failed to get BGP port from server");

    TestServer {
        handle,
        bgp_port,
        address,
        config,
        task,
    }
}

/// Setup a test server (AS65001) with a passive eBGP peer 127.0.0.2 (AS65002).
pub async fn setup_server_with_passive_peer() -> TestServer {
    let mut config = test_config(65001);
    config.peers.push(passive_peer("127.0.0.2", 65002));
    start_test_server(config).await
}

/// Setup a test server with a FakePeer already Established.
pub async fn setup_server_and_fake_peer() -> (TestServer, FakePeer) {
    let server = setup_server_with_passive_peer().await;
    let peer =
        FakePeer::connect_and_handshake("127.0.0.2", &server, 65002, Ipv4Addr::new(2, 2, 2, 2))
            .await;
    poll_peer_state(&server, "127.0.0.2", BgpState::Established).await;
    (server, peer)
}

/// Generic polling helper that retries until a condition is met
pub async fn poll_until_with_timeout<F, Fut>(check: F, timeout_message: &str, max_iterations: usize)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..max_iterations {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }

    panic!("{}", timeout_message);
}

/// Generic polling helper that retries until a condition is met (default 10s timeout)
pub async fn poll_until<F, Fut>(check: F, timeout_message: &str)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    poll_until_with_timeout(check, timeout_message, 100).await;
}

pub async fn poll_peer_state(server: &TestServer, addr: &str, state: BgpState) {
    poll_until(
        || async { server.peer_state(addr).await == Some(state) },
        &format!("Timeout waiting for {} to reach {}", addr, state),
    )
    .await;
}

/// Fake BGP peer for driving the server with hand-built messages.
/// Use a long hold timer (e.g., 300s) to avoid needing KEEPALIVE management.
pub struct FakePeer {
    pub stream: TcpStream,
    pub address: String,
}

impl FakePeer {
    /// Connect TCP only, bound to local_ip.
    pub async fn connect(local_ip: &str, server: &TestServer) -> Self {
        let local_addr: SocketAddr = format!("{}:0", local_ip).parse().unwrap();
        let server_addr = SocketAddr::new(server.address, server.bgp_port);

        let socket = TcpSocket::new_v4().unwrap();
        socket.set_reuseaddr(true).unwrap();
        socket.bind(local_addr).unwrap();
        let stream = socket.connect(server_addr).await.unwrap();

        FakePeer {
            stream,
            address: local_ip.to_string(),
        }
    }

    /// Connect and complete the OPEN/KEEPALIVE exchange with hold time 300.
    pub async fn connect_and_handshake(
        local_ip: &str,
        server: &TestServer,
        asn: u16,
        router_id: Ipv4Addr,
    ) -> Self {
        Self::connect_and_handshake_with_hold(local_ip, server, asn, router_id, 300).await
    }

    pub async fn connect_and_handshake_with_hold(
        local_ip: &str,
        server: &TestServer,
        asn: u16,
        router_id: Ipv4Addr,
        hold_time: u16,
    ) -> Self {
        let mut peer = Self::connect(local_ip, server).await;
        let _server_open = peer.read_open().await;
        peer.send_open(asn, router_id, hold_time).await;
        peer.send_keepalive().await;
        peer.read_keepalive().await;
        peer
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("Failed to send raw bytes");
    }

    pub async fn send_open(&mut self, asn: u16, router_id: Ipv4Addr, hold_time: u16) {
        let open = OpenMessage::new(asn, hold_time, u32::from(router_id));
        self.send_raw(&open.serialize()).await;
    }

    pub async fn send_keepalive(&mut self) {
        self.send_raw(&KeepaliveMessage {}.serialize()).await;
    }

    pub async fn send_update(&mut self, update: UpdateMessage) {
        self.send_raw(&update.serialize()).await;
    }

    /// Read the next message with a 5s timeout.
    pub async fn read_message(&mut self) -> BgpMessage {
        match timeout(Duration::from_secs(5), read_bgp_message(&mut self.stream)).await {
            Ok(result) => result.expect("Failed to read message"),
            Err(_) => panic!("Timeout waiting for message"),
        }
    }

    pub async fn read_open(&mut self) -> OpenMessage {
        match self.read_message().await {
            BgpMessage::Open(open) => open,
            msg => panic!("Expected OPEN, got {:?}", msg),
        }
    }

    pub async fn read_keepalive(&mut self) {
        let msg = self.read_message().await;
        assert!(matches!(msg, BgpMessage::Keepalive(_)), "got {:?}", msg);
    }

    /// Read a NOTIFICATION, skipping KEEPALIVEs.
    pub async fn read_notification(&mut self) -> NotificationMessage {
        loop {
            match self.read_message().await {
                BgpMessage::Notification(notif) => return notif,
                BgpMessage::Keepalive(_) => continue,
                msg => panic!("Expected NOTIFICATION, got {:?}", msg),
            }
        }
    }

    /// Read an UPDATE, skipping KEEPALIVEs.
    pub async fn read_update(&mut self) -> UpdateMessage {
        loop {
            match self.read_message().await {
                BgpMessage::Update(update) => return update,
                BgpMessage::Keepalive(_) => continue,
                msg => panic!("Expected UPDATE, got {:?}", msg),
            }
        }
    }
}

/// UPDATE announcing prefixes with ORIGIN IGP and the given AS_PATH and next hop.
pub fn build_announce(
    prefixes: Vec<Ipv4Net>,
    as_path: Vec<u16>,
    next_hop: Ipv4Addr,
    extra: Vec<PathAttrValue>,
) -> UpdateMessage {
    let mut attrs = vec![
        PathAttribute::new(PathAttrValue::Origin(Origin::IGP)),
        PathAttribute::new(PathAttrValue::AsPath(vec![AsPathSegment::sequence(as_path)])),
        PathAttribute::new(PathAttrValue::NextHop(next_hop)),
    ];
    attrs.extend(extra.into_iter().map(PathAttribute::new));
    UpdateMessage::new(attrs, prefixes)
}

// Build raw BGP message from components
pub fn build_raw_message(msg_type: MessageType, body: &[u8]) -> Vec<u8> {
    let mut msg = BGP_MARKER.to_vec();
    let len = (19 + body.len()) as u16;
    msg.extend_from_slice(&len.to_be_bytes());
    msg.push(msg_type.as_u8());
    msg.extend_from_slice(body);
    msg
}

pub fn prefix(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}
