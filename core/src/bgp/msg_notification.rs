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

use crate::log::warn;

use super::msg::{Message, MessageType};
use super::utils::ParserError;

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum MessageHeaderError {
    ConnectionNotSynchronized = 1,
    BadMessageLength = 2,
    BadMessageType = 3,
    Unknown(u8),
}

impl From<u8> for MessageHeaderError {
    fn from(value: u8) -> Self {
        match value {
            1 => MessageHeaderError::ConnectionNotSynchronized,
            2 => MessageHeaderError::BadMessageLength,
            3 => MessageHeaderError::BadMessageType,
            val => MessageHeaderError::Unknown(val),
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum OpenMessageError {
    UnsupportedVersionNumber = 1,
    BadPeerAs = 2,
    BadBgpIdentifier = 3,
    UnsupportedOptionalParameter = 4,
    UnacceptableHoldTime = 6,
    UnsupportedCapability = 7,
    Unknown(u8),
}

impl From<u8> for OpenMessageError {
    fn from(value: u8) -> Self {
        match value {
            1 => OpenMessageError::UnsupportedVersionNumber,
            2 => OpenMessageError::BadPeerAs,
            3 => OpenMessageError::BadBgpIdentifier,
            4 => OpenMessageError::UnsupportedOptionalParameter,
            6 => OpenMessageError::UnacceptableHoldTime,
            7 => OpenMessageError::UnsupportedCapability,
            val => OpenMessageError::Unknown(val),
        }
    }
}

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum UpdateMessageError {
    MalformedAttributeList = 1,
    UnrecognizedWellKnownAttribute = 2,
    MissingWellKnownAttribute = 3,
    AttributeFlagsError = 4,
    AttributeLengthError = 5,
    InvalidOriginAttribute = 6,
    // 7 is deprecated (was AS Routing Loop)
    InvalidNextHopAttribute = 8,
    OptionalAttributeError = 9,
    InvalidNetworkField = 10,
    MalformedASPath = 11,
    Unknown(u8),
}

impl From<u8> for UpdateMessageError {
    fn from(value: u8) -> Self {
        match value {
            1 => UpdateMessageError::MalformedAttributeList,
            2 => UpdateMessageError::UnrecognizedWellKnownAttribute,
            3 => UpdateMessageError::MissingWellKnownAttribute,
            4 => UpdateMessageError::AttributeFlagsError,
            5 => UpdateMessageError::AttributeLengthError,
            6 => UpdateMessageError::InvalidOriginAttribute,
            8 => UpdateMessageError::InvalidNextHopAttribute,
            9 => UpdateMessageError::OptionalAttributeError,
            10 => UpdateMessageError::InvalidNetworkField,
            11 => UpdateMessageError::MalformedASPath,
            val => UpdateMessageError::Unknown(val),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BgpError {
    MessageHeaderError(MessageHeaderError),
    OpenMessageError(OpenMessageError),
    UpdateMessageError(UpdateMessageError),
    HoldTimerExpired,
    FiniteStateMachineError,
    Cease(CeaseSubcode),
    Unknown,
}

/// Cease NOTIFICATION subcodes (RFC 4486)
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CeaseSubcode {
    MaxPrefixesReached = 1,
    AdministrativeShutdown = 2,
    PeerDeconfigured = 3,
    AdministrativeReset = 4,
    ConnectionRejected = 5,
    OtherConfigurationChange = 6,
    ConnectionCollisionResolution = 7,
    OutOfResources = 8,
    Unknown(u8),
}

impl From<u8> for CeaseSubcode {
    fn from(value: u8) -> Self {
        match value {
            1 => CeaseSubcode::MaxPrefixesReached,
            2 => CeaseSubcode::AdministrativeShutdown,
            3 => CeaseSubcode::PeerDeconfigured,
            4 => CeaseSubcode::AdministrativeReset,
            5 => CeaseSubcode::ConnectionRejected,
            6 => CeaseSubcode::OtherConfigurationChange,
            7 => CeaseSubcode::ConnectionCollisionResolution,
            8 => CeaseSubcode::OutOfResources,
            val => CeaseSubcode::Unknown(val),
        }
    }
}

impl CeaseSubcode {
    fn as_u8(&self) -> u8 {
        match self {
            CeaseSubcode::MaxPrefixesReached => 1,
            CeaseSubcode::AdministrativeShutdown => 2,
            CeaseSubcode::PeerDeconfigured => 3,
            CeaseSubcode::AdministrativeReset => 4,
            CeaseSubcode::ConnectionRejected => 5,
            CeaseSubcode::OtherConfigurationChange => 6,
            CeaseSubcode::ConnectionCollisionResolution => 7,
            CeaseSubcode::OutOfResources => 8,
            CeaseSubcode::Unknown(val) => *val,
        }
    }
}

impl BgpError {
    fn new(err_code: u8, err_sub_code: u8) -> BgpError {
        let err = match err_code {
            1 => BgpError::MessageHeaderError(MessageHeaderError::from(err_sub_code)),
            2 => BgpError::OpenMessageError(OpenMessageError::from(err_sub_code)),
            3 => BgpError::UpdateMessageError(UpdateMessageError::from(err_sub_code)),
            4 => BgpError::HoldTimerExpired,
            5 => BgpError::FiniteStateMachineError,
            6 => BgpError::Cease(CeaseSubcode::from(err_sub_code)),
            _ => {
                warn!(code = err_code, "received NOTIFICATION with unknown error code");
                return BgpError::Unknown;
            }
        };
        if matches!(
            err,
            BgpError::MessageHeaderError(MessageHeaderError::Unknown(_))
                | BgpError::OpenMessageError(OpenMessageError::Unknown(_))
                | BgpError::UpdateMessageError(UpdateMessageError::Unknown(_))
        ) {
            warn!(
                code = err_code,
                subcode = err_sub_code,
                "received NOTIFICATION with unknown subcode"
            );
        }
        err
    }

    pub fn error_code(&self) -> u8 {
        match self {
            BgpError::MessageHeaderError(_) => 1,
            BgpError::OpenMessageError(_) => 2,
            BgpError::UpdateMessageError(_) => 3,
            BgpError::HoldTimerExpired => 4,
            BgpError::FiniteStateMachineError => 5,
            BgpError::Cease(_) => 6,
            BgpError::Unknown => 0,
        }
    }

    pub fn error_subcode(&self) -> u8 {
        match self {
            BgpError::MessageHeaderError(err) => match err {
                MessageHeaderError::ConnectionNotSynchronized => 1,
                MessageHeaderError::BadMessageLength => 2,
                MessageHeaderError::BadMessageType => 3,
                MessageHeaderError::Unknown(val) => *val,
            },
            BgpError::OpenMessageError(err) => match err {
                OpenMessageError::UnsupportedVersionNumber => 1,
                OpenMessageError::BadPeerAs => 2,
                OpenMessageError::BadBgpIdentifier => 3,
                OpenMessageError::UnsupportedOptionalParameter => 4,
                OpenMessageError::UnacceptableHoldTime => 6,
                OpenMessageError::UnsupportedCapability => 7,
                OpenMessageError::Unknown(val) => *val,
            },
            BgpError::UpdateMessageError(err) => match err {
                UpdateMessageError::MalformedAttributeList => 1,
                UpdateMessageError::UnrecognizedWellKnownAttribute => 2,
                UpdateMessageError::MissingWellKnownAttribute => 3,
                UpdateMessageError::AttributeFlagsError => 4,
                UpdateMessageError::AttributeLengthError => 5,
                UpdateMessageError::InvalidOriginAttribute => 6,
                UpdateMessageError::InvalidNextHopAttribute => 8,
                UpdateMessageError::OptionalAttributeError => 9,
                UpdateMessageError::InvalidNetworkField => 10,
                UpdateMessageError::MalformedASPath => 11,
                UpdateMessageError::Unknown(val) => *val,
            },
            BgpError::Cease(subcode) => subcode.as_u8(),
            _ => 0,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NotificationMessage {
    error: BgpError,
    data: Vec<u8>,
}

impl NotificationMessage {
    pub fn new(error: BgpError, data: Vec<u8>) -> Self {
        NotificationMessage { error, data }
    }

    pub fn from_parser_error(error: &ParserError) -> Option<Self> {
        match error {
            ParserError::BgpError { error, data } => {
                Some(NotificationMessage::new(error.clone(), data.clone()))
            }
            _ => None,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        // Errors in a NOTIFICATION cannot be reported back, so log and keep the raw bytes.
        if bytes.len() < 2 {
            warn!(len = bytes.len(), "received malformed NOTIFICATION message");
            return NotificationMessage {
                error: BgpError::Unknown,
                data: bytes,
            };
        }

        let bgp_error = BgpError::new(bytes[0], bytes[1]);
        NotificationMessage {
            error: bgp_error,
            data: bytes[2..].to_vec(),
        }
    }

    pub fn error(&self) -> &BgpError {
        &self.error
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_version_error(&self) -> bool {
        matches!(
            self.error,
            BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber)
        )
    }
}

impl std::fmt::Display for NotificationMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (code {}, subcode {})",
            self.error,
            self.error.error_code(),
            self.error.error_subcode()
        )
    }
}

impl Message for NotificationMessage {
    fn kind(&self) -> MessageType {
        MessageType::Notification
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(self.error.error_code());
        bytes.push(self.error.error_subcode());
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! test_bgp_error_new {
        ($name: ident, $err_code: expr, $err_sub_code: expr, expected $expected:expr) => {
            #[test]
            fn $name() {
                let error = BgpError::new($err_code, $err_sub_code);
                assert_eq!(error, $expected);
                if error != BgpError::Unknown {
                    assert_eq!(error.error_code(), $err_code);
                }
            }
        };
    }

    test_bgp_error_new!(
        bgp_error_new_msg_header_1, 1, 1,
        expected BgpError::MessageHeaderError(MessageHeaderError::ConnectionNotSynchronized)
    );
    test_bgp_error_new!(
        bgp_error_new_open_message_1, 2, 1,
        expected BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber)
    );
    test_bgp_error_new!(
        bgp_error_new_open_unsupported_capability, 2, 7,
        expected BgpError::OpenMessageError(OpenMessageError::UnsupportedCapability)
    );
    test_bgp_error_new!(
        bgp_error_new_update_message_11, 3, 11,
        expected BgpError::UpdateMessageError(UpdateMessageError::MalformedASPath)
    );
    test_bgp_error_new!(
        bgp_error_new_hold_timer, 4, 0,
        expected BgpError::HoldTimerExpired
    );
    test_bgp_error_new!(
        bgp_error_new_fsm, 5, 0,
        expected BgpError::FiniteStateMachineError
    );
    test_bgp_error_new!(
        bgp_error_new_cease_peer_deconfigured, 6, 3,
        expected BgpError::Cease(CeaseSubcode::PeerDeconfigured)
    );
    test_bgp_error_new!(
        bgp_error_new_unknown, 99, 0,
        expected BgpError::Unknown
    );

    #[test]
    fn test_notification_message_from_bytes() {
        let input = vec![
            0x03, // Error code
            0x02, // Error subcode
            0x00, 0xff, // Attribute type
            0x01, // Attribute length
            0x02, // Attribute Value
        ];
        let result = NotificationMessage::from_bytes(input);

        assert_eq!(
            result,
            NotificationMessage {
                error: BgpError::UpdateMessageError(
                    UpdateMessageError::UnrecognizedWellKnownAttribute
                ),
                data: vec![0x00, 0xff, 0x01, 0x02],
            }
        )
    }

    #[test]
    fn test_notification_message_to_bytes() {
        let notif = NotificationMessage::new(
            BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
            vec![0x00, 0x12],
        );
        assert_eq!(notif.to_bytes(), vec![1, 2, 0x00, 0x12]);

        let serialized = NotificationMessage::new(BgpError::HoldTimerExpired, vec![]).serialize();
        assert_eq!(serialized.len(), 21);
        assert_eq!(&serialized[19..], &[4, 0]);
    }

    #[test]
    fn test_from_parser_error() {
        let parser_error = ParserError::BgpError {
            error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageType),
            data: vec![99],
        };
        let notif = NotificationMessage::from_parser_error(&parser_error).unwrap();
        assert_eq!(
            notif.error(),
            &BgpError::MessageHeaderError(MessageHeaderError::BadMessageType)
        );
        assert_eq!(notif.data(), &[99]);

        let io_error = ParserError::IoError("connection reset".to_string());
        assert!(NotificationMessage::from_parser_error(&io_error).is_none());
    }

    #[test]
    fn test_from_bytes_malformed() {
        let result = NotificationMessage::from_bytes(vec![0x01]);
        assert_eq!(result.error(), &BgpError::Unknown);
        assert_eq!(result.data(), &[0x01]);

        let result = NotificationMessage::from_bytes(vec![1, 99]);
        assert_eq!(
            result.error(),
            &BgpError::MessageHeaderError(MessageHeaderError::Unknown(99))
        );
    }

    #[test]
    fn test_is_version_error() {
        let notif = NotificationMessage::new(
            BgpError::OpenMessageError(OpenMessageError::UnsupportedVersionNumber),
            vec![],
        );
        assert!(notif.is_version_error());

        let notif = NotificationMessage::new(
            BgpError::OpenMessageError(OpenMessageError::BadPeerAs),
            vec![],
        );
        assert!(!notif.is_version_error());

        let notif = NotificationMessage::new(BgpError::HoldTimerExpired, vec![]);
        assert!(!notif.is_version_error());
    }
}
