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

use super::msg::{Message, MessageType};
use super::msg_notification::{BgpError, MessageHeaderError};
use super::utils::ParserError;

pub const AFI_IPV4: u16 = 1;
pub const SAFI_UNICAST: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRefreshMessage {
    pub afi: u16,
    pub safi: u8,
}

impl RouteRefreshMessage {
    pub fn new(afi: u16, safi: u8) -> Self {
        RouteRefreshMessage { afi, safi }
    }

    pub fn ipv4_unicast() -> Self {
        Self::new(AFI_IPV4, SAFI_UNICAST)
    }

    pub fn is_ipv4_unicast(&self) -> bool {
        self.afi == AFI_IPV4 && self.safi == SAFI_UNICAST
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParserError> {
        if bytes.len() != 4 {
            return Err(ParserError::BgpError {
                error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
                data: ((bytes.len() + 19) as u16).to_be_bytes().to_vec(),
            });
        }

        // Byte 2 is reserved and ignored on receipt
        Ok(RouteRefreshMessage {
            afi: u16::from_be_bytes([bytes[0], bytes[1]]),
            safi: bytes[3],
        })
    }
}

impl Message for RouteRefreshMessage {
    fn kind(&self) -> MessageType {
        MessageType::RouteRefresh
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4);
        bytes.extend_from_slice(&self.afi.to_be_bytes());
        bytes.push(0);
        bytes.push(self.safi);
        bytes
    }
}
