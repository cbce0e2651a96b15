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

use super::msg_keepalive::KeepaliveMessage;
use super::msg_notification::{BgpError, MessageHeaderError, NotificationMessage};
use super::msg_open::OpenMessage;
use super::msg_route_refresh::RouteRefreshMessage;
use super::msg_update::UpdateMessage;
use super::utils::ParserError;
use tokio::io::AsyncReadExt;

pub const BGP_HEADER_SIZE_BYTES: usize = 19;
pub const MAX_MESSAGE_SIZE: u16 = 4096;

// BGP header marker (16 bytes of 0xFF)
pub const BGP_MARKER: [u8; 16] = [0xff; 16];

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Trait for BGP message types that can serialize themselves
pub trait Message {
    /// Returns the message type identifier
    fn kind(&self) -> MessageType;

    /// Serializes the message body (without BGP header)
    fn to_bytes(&self) -> Vec<u8>;

    /// Serializes the complete BGP message with header
    fn serialize(&self) -> Vec<u8> {
        let body = self.to_bytes();
        let mut message = Vec::with_capacity(BGP_HEADER_SIZE_BYTES + body.len());

        message.extend_from_slice(&BGP_MARKER);

        let length = BGP_HEADER_SIZE_BYTES as u16 + body.len() as u16;
        message.extend_from_slice(&length.to_be_bytes());
        message.push(self.kind().as_u8());
        message.extend_from_slice(&body);

        message
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ParserError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Update),
            3 => Ok(MessageType::Notification),
            4 => Ok(MessageType::Keepalive),
            5 => Ok(MessageType::RouteRefresh),
            _ => Err(ParserError::BgpError {
                error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageType),
                data: vec![value],
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum BgpMessage {
    Open(OpenMessage),
    Update(UpdateMessage),
    Keepalive(KeepaliveMessage),
    Notification(NotificationMessage),
    RouteRefresh(RouteRefreshMessage),
}

impl BgpMessage {
    /// Serialize the BGP message to bytes with BGP header
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::Open(m) => m.serialize(),
            Self::Update(m) => m.serialize(),
            Self::Keepalive(m) => m.serialize(),
            Self::Notification(m) => m.serialize(),
            Self::RouteRefresh(m) => m.serialize(),
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Self::Open(m) => m.kind(),
            Self::Update(m) => m.kind(),
            Self::Keepalive(m) => m.kind(),
            Self::Notification(m) => m.kind(),
            Self::RouteRefresh(m) => m.kind(),
        }
    }

    pub fn from_bytes(message_type_val: u8, bytes: Vec<u8>) -> Result<Self, ParserError> {
        let message_type = MessageType::try_from(message_type_val)?;

        match message_type {
            MessageType::Open => Ok(BgpMessage::Open(OpenMessage::from_bytes(bytes)?)),
            MessageType::Update => Ok(BgpMessage::Update(UpdateMessage::from_bytes(bytes)?)),
            MessageType::Keepalive => Ok(BgpMessage::Keepalive(KeepaliveMessage {})),
            MessageType::Notification => Ok(BgpMessage::Notification(
                NotificationMessage::from_bytes(bytes),
            )),
            MessageType::RouteRefresh => Ok(BgpMessage::RouteRefresh(
                RouteRefreshMessage::from_bytes(bytes)?,
            )),
        }
    }
}

/// Read complete BGP message (header + body) as raw bytes without parsing.
/// Returns the complete message including the 19-byte header.
///
/// The header (marker, length, type) is validated; the body is not parsed.
pub async fn read_bgp_message_bytes<R: AsyncReadExt + Unpin>(
    mut stream: R,
) -> Result<Vec<u8>, ParserError> {
    let mut header_buffer = [0u8; BGP_HEADER_SIZE_BYTES];

    stream.read_exact(&mut header_buffer).await?;

    validate_marker(&header_buffer)?;

    let message_length = u16::from_be_bytes([header_buffer[16], header_buffer[17]]);
    let message_type = header_buffer[18];

    validate_length(message_length, message_type)?;
    validate_message_type(message_type)?;

    let mut message = header_buffer.to_vec();
    let body_length = message_length as usize - BGP_HEADER_SIZE_BYTES;

    if body_length > 0 {
        let mut body_buffer = vec![0u8; body_length];
        stream.read_exact(&mut body_buffer).await?;
        message.extend_from_slice(&body_buffer);
    }

    Ok(message)
}

/// Read and parse one framed BGP message.
pub async fn read_bgp_message<R: AsyncReadExt + Unpin>(
    stream: R,
) -> Result<BgpMessage, ParserError> {
    let bytes = read_bgp_message_bytes(stream).await?;
    let message_type = bytes[18];
    let body = bytes[BGP_HEADER_SIZE_BYTES..].to_vec();
    BgpMessage::from_bytes(message_type, body)
}

fn validate_marker(header: &[u8]) -> Result<(), ParserError> {
    if header[0..16] != BGP_MARKER {
        return Err(ParserError::BgpError {
            error: BgpError::MessageHeaderError(MessageHeaderError::ConnectionNotSynchronized),
            data: Vec::new(),
        });
    }
    Ok(())
}

fn bad_length(message_length: u16) -> ParserError {
    ParserError::BgpError {
        error: BgpError::MessageHeaderError(MessageHeaderError::BadMessageLength),
        data: message_length.to_be_bytes().to_vec(),
    }
}

fn validate_length(message_length: u16, message_type: u8) -> Result<(), ParserError> {
    if !(BGP_HEADER_SIZE_BYTES as u16..=MAX_MESSAGE_SIZE).contains(&message_length) {
        return Err(bad_length(message_length));
    }

    let valid = match MessageType::try_from(message_type) {
        Ok(MessageType::Keepalive) => message_length == BGP_HEADER_SIZE_BYTES as u16,
        // code + subcode
        Ok(MessageType::Notification) => message_length >= 21,
        // afi + reserved + safi
        Ok(MessageType::RouteRefresh) => message_length == 23,
        // version, asn, hold time, identifier, optional parameter length
        Ok(MessageType::Open) => message_length >= 29,
        // withdrawn length + attributes length
        Ok(MessageType::Update) => message_length >= 23,
        Err(_) => true,
    };
    if !valid {
        return Err(bad_length(message_length));
    }

    Ok(())
}

fn validate_message_type(message_type: u8) -> Result<(), ParserError> {
    MessageType::try_from(message_type).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MOCK_OPEN_MESSAGE: &[u8] = &[
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x00, 0x1d, // Message length (29 bytes)
        0x01, // Message type (Open)
        0x04, // Version
        0x04, 0xd2, // ASN
        0x00, 0x0a, // Hold time
        0x0a, 0x0a, 0x0a, 0x0a, // BGP identifier
        0x00, // Optional parameters length
    ];

    fn expect_header_error(result: Result<BgpMessage, ParserError>) -> (MessageHeaderError, Vec<u8>) {
        match result {
            Err(ParserError::BgpError {
                error: BgpError::MessageHeaderError(err),
                data,
            }) => (err, data),
            other => panic!("Expected header error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_open_message() {
        let stream = Cursor::new(MOCK_OPEN_MESSAGE);

        match read_bgp_message(stream).await.unwrap() {
            BgpMessage::Open(open_message) => {
                assert_eq!(open_message.version, 4);
                assert_eq!(open_message.asn, 1234);
                assert_eq!(open_message.hold_time, 10);
                assert_eq!(open_message.bgp_identifier, 168430090);
                assert!(open_message.capabilities.is_empty());
            }
            _ => panic!("Expected BgpMessage::Open"),
        }
    }

    #[tokio::test]
    async fn test_read_keepalive_message() {
        let bytes = KeepaliveMessage {}.serialize();
        let msg = read_bgp_message(Cursor::new(bytes)).await.unwrap();
        assert_eq!(msg, BgpMessage::Keepalive(KeepaliveMessage {}));
        assert_eq!(msg.kind(), MessageType::Keepalive);
    }

    #[tokio::test]
    async fn test_read_message_invalid_marker() {
        let mut msg = MOCK_OPEN_MESSAGE.to_vec();
        msg[0] = 0x00;
        let (err, data) = expect_header_error(read_bgp_message(Cursor::new(msg)).await);
        assert_eq!(err, MessageHeaderError::ConnectionNotSynchronized);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_read_message_bad_lengths() {
        let cases: Vec<(&str, u16, u8)> = vec![
            ("too small", 18, 1),
            ("too large", 4097, 1),
            ("keepalive with body", 20, 4),
            ("short notification", 20, 3),
            ("route refresh wrong size", 24, 5),
        ];
        for (name, length, msg_type) in cases {
            let mut msg = MOCK_OPEN_MESSAGE.to_vec();
            msg[16..18].copy_from_slice(&length.to_be_bytes());
            msg[18] = msg_type;
            let (err, data) = expect_header_error(read_bgp_message(Cursor::new(msg)).await);
            assert_eq!(err, MessageHeaderError::BadMessageLength, "{}", name);
            assert_eq!(data, length.to_be_bytes().to_vec(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_read_message_invalid_type() {
        let mut msg = MOCK_OPEN_MESSAGE.to_vec();
        msg[18] = 99;
        let (err, data) = expect_header_error(read_bgp_message(Cursor::new(msg)).await);
        assert_eq!(err, MessageHeaderError::BadMessageType);
        assert_eq!(data, vec![99]);
    }

    #[tokio::test]
    async fn test_read_message_truncated_is_io_error() {
        let msg = MOCK_OPEN_MESSAGE[..25].to_vec();
        match read_bgp_message(Cursor::new(msg)).await {
            Err(ParserError::IoError(_)) => {}
            other => panic!("Expected IoError, got {:?}", other),
        }
    }
}
