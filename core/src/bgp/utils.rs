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

use super::msg_notification::{BgpError, UpdateMessageError};
use crate::log::warn;
use crate::net::Ipv4Net;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;

#[derive(Debug, PartialEq)]
pub enum ParserError {
    IoError(String),
    BgpError { error: BgpError, data: Vec<u8> },
}

impl ParserError {
    pub(crate) fn update(err: UpdateMessageError, data: Vec<u8>) -> Self {
        ParserError::BgpError {
            error: BgpError::UpdateMessageError(err),
            data,
        }
    }
}

impl Display for ParserError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ParserError::IoError(s) => write!(f, "IO error: {}", s),
            ParserError::BgpError { error, .. } => write!(f, "BGP error: {:?}", error),
        }
    }
}

impl Error for ParserError {}

impl From<std::io::Error> for ParserError {
    fn from(err: std::io::Error) -> Self {
        ParserError::IoError(err.to_string())
    }
}

pub fn parse_nlri_list(bytes: &[u8]) -> Result<Vec<Ipv4Net>, ParserError> {
    let mut cursor = 0;
    let mut nlri_list: Vec<Ipv4Net> = Vec::new();

    while cursor < bytes.len() {
        let prefix_length = bytes[cursor];
        cursor += 1;

        // Check prefix length before calculating byte_len to avoid buffer overflow
        if prefix_length > 32 {
            return Err(ParserError::update(
                UpdateMessageError::InvalidNetworkField,
                Vec::new(),
            ));
        }

        let byte_len: usize = (prefix_length as usize).div_ceil(8);

        if cursor + byte_len > bytes.len() {
            return Err(ParserError::update(
                UpdateMessageError::InvalidNetworkField,
                Vec::new(),
            ));
        }

        let mut ip_buffer = [0; 4];
        ip_buffer[..byte_len].copy_from_slice(&bytes[cursor..cursor + byte_len]);
        cursor += byte_len;

        let Some(net) = Ipv4Net::new(Ipv4Addr::from(ip_buffer), prefix_length) else {
            continue;
        };

        // Semantic check: skip multicast prefixes (224.0.0.0/4)
        if net.is_multicast() {
            warn!(prefix = %net, "ignoring multicast NLRI prefix");
            continue;
        }

        nlri_list.push(net);
    }

    Ok(nlri_list)
}

pub fn write_nlri_list(nlri_list: &[Ipv4Net]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for net in nlri_list {
        bytes.push(net.prefix_length);
        bytes.extend_from_slice(&net.address.octets()[..net.wire_len()]);
    }
    bytes
}

pub fn read_u32(bytes: &[u8]) -> Result<u32, ParserError> {
    match bytes.len() {
        4 => Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        _ => Err(ParserError::update(
            UpdateMessageError::AttributeLengthError,
            Vec::new(),
        )),
    }
}

/// Validates if an IPv4 address is a valid unicast host address.
/// Returns false for 0.0.0.0, 255.255.255.255, or multicast (224.0.0.0/4).
pub fn is_valid_unicast_ipv4(ip: u32) -> bool {
    !(ip == 0 || ip == 0xFFFFFFFF || (ip & 0xF0000000) == 0xE0000000)
}
