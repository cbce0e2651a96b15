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
use super::msg_notification::{BgpError, OpenMessageError};
use super::msg_route_refresh::{AFI_IPV4, SAFI_UNICAST};
use super::utils::{is_valid_unicast_ipv4, ParserError};

pub const BGP_VERSION: u8 = 4;

const PARAM_TYPE_CAPABILITIES: u8 = 2;

/// Capability codes, IANA "Capability Codes" registry.
const CAP_MULTIPROTOCOL: u8 = 1;
const CAP_ROUTE_REFRESH: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Multiprotocol { afi: u16, safi: u8 },
    RouteRefresh,
    Unknown { code: u8, value: Vec<u8> },
}

impl Capability {
    fn from_wire(code: u8, value: &[u8]) -> Self {
        match (code, value.len()) {
            (CAP_MULTIPROTOCOL, 4) => Capability::Multiprotocol {
                afi: u16::from_be_bytes([value[0], value[1]]),
                safi: value[3],
            },
            (CAP_ROUTE_REFRESH, 0) => Capability::RouteRefresh,
            _ => Capability::Unknown {
                code,
                value: value.to_vec(),
            },
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Capability::Multiprotocol { afi, safi } => {
                let mut bytes = vec![CAP_MULTIPROTOCOL, 4];
                bytes.extend_from_slice(&afi.to_be_bytes());
                bytes.push(0);
                bytes.push(*safi);
                bytes
            }
            Capability::RouteRefresh => vec![CAP_ROUTE_REFRESH, 0],
            Capability::Unknown { code, value } => {
                let mut bytes = vec![*code, value.len() as u8];
                bytes.extend_from_slice(value);
                bytes
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub bgp_identifier: u32,
    pub capabilities: Vec<Capability>,
    /// Optional parameter types other than capabilities, kept for validation.
    pub unsupported_params: Vec<u8>,
}

fn malformed_open() -> ParserError {
    // Unspecific subcode
    ParserError::BgpError {
        error: BgpError::OpenMessageError(OpenMessageError::Unknown(0)),
        data: Vec::new(),
    }
}

fn read_optional_parameters(
    bytes: &[u8],
    capabilities: &mut Vec<Capability>,
    unsupported: &mut Vec<u8>,
) -> Result<(), ParserError> {
    let mut cursor = 0;

    while cursor < bytes.len() {
        if cursor + 2 > bytes.len() {
            return Err(malformed_open());
        }
        let param_type = bytes[cursor];
        let param_len = bytes[cursor + 1] as usize;
        cursor += 2;

        if cursor + param_len > bytes.len() {
            return Err(malformed_open());
        }
        let value = &bytes[cursor..cursor + param_len];
        cursor += param_len;

        if param_type != PARAM_TYPE_CAPABILITIES {
            unsupported.push(param_type);
            continue;
        }

        // A capabilities parameter may carry several capabilities back to back
        let mut cap_cursor = 0;
        while cap_cursor < value.len() {
            if cap_cursor + 2 > value.len() {
                return Err(malformed_open());
            }
            let code = value[cap_cursor];
            let len = value[cap_cursor + 1] as usize;
            cap_cursor += 2;
            if cap_cursor + len > value.len() {
                return Err(malformed_open());
            }
            capabilities.push(Capability::from_wire(
                code,
                &value[cap_cursor..cap_cursor + len],
            ));
            cap_cursor += len;
        }
    }

    Ok(())
}

fn validate_version(version: u8) -> Result<(), ParserError> {
    if version != BGP_VERSION {
        // Data carries the largest locally supported version
        return Err(ParserError::BgpError {
            error: BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber),
            data: (BGP_VERSION as u16).to_be_bytes().to_vec(),
        });
    }
    Ok(())
}

/// Hold time of one or two seconds MUST be rejected.
fn validate_hold_time(hold_time: u16) -> Result<(), ParserError> {
    if hold_time == 1 || hold_time == 2 {
        return Err(ParserError::BgpError {
            error: BgpError::OpenMessageError(OpenMessageError::UnacceptableHoldTime),
            data: Vec::new(),
        });
    }
    Ok(())
}

fn validate_bgp_identifier(bgp_identifier: u32) -> Result<(), ParserError> {
    if !is_valid_unicast_ipv4(bgp_identifier) {
        return Err(ParserError::BgpError {
            error: BgpError::OpenMessageError(OpenMessageError::BadBgpIdentifier),
            data: Vec::new(),
        });
    }
    Ok(())
}

impl OpenMessage {
    /// Creates an OPEN advertising IPv4 unicast and route refresh.
    pub fn new(asn: u16, hold_time: u16, bgp_identifier: u32) -> Self {
        OpenMessage {
            version: BGP_VERSION,
            asn,
            hold_time,
            bgp_identifier,
            capabilities: vec![
                Capability::Multiprotocol {
                    afi: AFI_IPV4,
                    safi: SAFI_UNICAST,
                },
                Capability::RouteRefresh,
            ],
            unsupported_params: vec![],
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParserError> {
        if bytes.len() < 10 {
            return Err(malformed_open());
        }

        let version = bytes[0];
        let asn = u16::from_be_bytes([bytes[1], bytes[2]]);
        let hold_time = u16::from_be_bytes([bytes[3], bytes[4]]);
        let bgp_identifier = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);

        let optional_params_len = bytes[9] as usize;
        if optional_params_len != bytes.len() - 10 {
            return Err(malformed_open());
        }

        validate_version(version)?;
        validate_hold_time(hold_time)?;
        validate_bgp_identifier(bgp_identifier)?;

        let mut capabilities = Vec::new();
        let mut unsupported_params = Vec::new();
        read_optional_parameters(&bytes[10..], &mut capabilities, &mut unsupported_params)?;

        Ok(OpenMessage {
            version,
            asn,
            hold_time,
            bgp_identifier,
            capabilities,
            unsupported_params,
        })
    }

    /// True when the peer did not list multiprotocol families (IPv4 unicast
    /// is implied) or listed IPv4 unicast explicitly.
    pub fn supports_ipv4_unicast(&self) -> bool {
        let families: Vec<(u16, u8)> = self
            .capabilities
            .iter()
            .filter_map(|cap| match cap {
                Capability::Multiprotocol { afi, safi } => Some((*afi, *safi)),
                _ => None,
            })
            .collect();
        families.is_empty() || families.contains(&(AFI_IPV4, SAFI_UNICAST))
    }

    pub fn supports_route_refresh(&self) -> bool {
        self.capabilities.contains(&Capability::RouteRefresh)
    }
}

impl Message for OpenMessage {
    fn kind(&self) -> MessageType {
        MessageType::Open
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut params = Vec::new();
        if !self.capabilities.is_empty() {
            let caps: Vec<u8> = self
                .capabilities
                .iter()
                .flat_map(|cap| cap.to_bytes())
                .collect();
            params.push(PARAM_TYPE_CAPABILITIES);
            params.push(caps.len() as u8);
            params.extend_from_slice(&caps);
        }

        let mut bytes = Vec::with_capacity(10 + params.len());
        bytes.push(self.version);
        bytes.extend_from_slice(&self.asn.to_be_bytes());
        bytes.extend_from_slice(&self.hold_time.to_be_bytes());
        bytes.extend_from_slice(&self.bgp_identifier.to_be_bytes());
        bytes.push(params.len() as u8);
        bytes.extend_from_slice(&params);
        bytes
    }
}
