//! Protocol message definitions
//!
//! Defines the header, message type codes and the message envelope
//! exchanged between NodeLink nodes.

use std::collections::HashMap;
use std::fmt;

use super::{Value, DEFAULT_CRC_CODE};

/// Message kinds understood by the protocol core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Application request
    ServiceReq,
    /// Application response
    ServiceResp,
    /// Application one-way message
    OneWay,
    /// Login request, sent by the client right after connecting
    LoginReq,
    /// Login response carrying the login result byte
    LoginResp,
    /// Heartbeat request from the client
    HeartbeatReq,
    /// Heartbeat reply from the server
    HeartbeatResp,
    /// A code this build does not know; forwarded untouched
    Unknown(u8),
}

impl MessageType {
    /// Get the wire code for this type
    pub fn code(&self) -> u8 {
        match self {
            MessageType::ServiceReq => 0,
            MessageType::ServiceResp => 1,
            MessageType::OneWay => 2,
            MessageType::LoginReq => 3,
            MessageType::LoginResp => 4,
            MessageType::HeartbeatReq => 5,
            MessageType::HeartbeatResp => 6,
            MessageType::Unknown(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => MessageType::ServiceReq,
            1 => MessageType::ServiceResp,
            2 => MessageType::OneWay,
            3 => MessageType::LoginReq,
            4 => MessageType::LoginResp,
            5 => MessageType::HeartbeatReq,
            6 => MessageType::HeartbeatResp,
            other => MessageType::Unknown(other),
        }
    }
}

/// Frame header
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Integrity/version tag, carried verbatim
    pub crc_code: i32,
    /// Bytes following the length field; filled in by the codec
    pub length: i32,
    /// Correlates requests with responses, 0 when unused
    pub session_id: i64,
    pub message_type: MessageType,
    /// Opaque priority hint
    pub priority: u8,
    pub attachments: HashMap<String, Value>,
}

impl Header {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            ..Default::default()
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            crc_code: DEFAULT_CRC_CODE,
            length: 0,
            session_id: 0,
            message_type: MessageType::ServiceReq,
            priority: 0,
            attachments: HashMap::new(),
        }
    }
}

/// A header plus an optional body
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub body: Option<Value>,
}

/// Login result byte for an accepted login
pub const LOGIN_ACCEPTED: i8 = 0;

/// Login result byte for a rejected login
pub const LOGIN_REJECTED: i8 = -1;

impl Message {
    pub fn new(message_type: MessageType, body: Option<Value>) -> Self {
        Self {
            header: Header::new(message_type),
            body,
        }
    }

    /// Login request; identity comes from the source address, so no body
    pub fn login_req() -> Self {
        Self::new(MessageType::LoginReq, None)
    }

    pub fn login_resp(result: i8) -> Self {
        Self::new(MessageType::LoginResp, Some(Value::Byte(result)))
    }

    pub fn heartbeat_req() -> Self {
        Self::new(MessageType::HeartbeatReq, None)
    }

    pub fn heartbeat_resp() -> Self {
        Self::new(MessageType::HeartbeatResp, None)
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// Result byte of a login response, if this is one with a byte body
    pub fn login_result(&self) -> Option<i8> {
        if self.message_type() != MessageType::LoginResp {
            return None;
        }
        self.body.as_ref().and_then(Value::as_byte)
    }

    pub fn with_session_id(mut self, session_id: i64) -> Self {
        self.header.session_id = session_id;
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.header.attachments.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message [type={:?}, session={}, priority={}, attachments={}, body={:?}]",
            self.header.message_type,
            self.header.session_id,
            self.header.priority,
            self.header.attachments.len(),
            self.body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_codes() {
        for code in 0..=u8::MAX {
            assert_eq!(MessageType::from_code(code).code(), code);
        }
        assert_eq!(MessageType::LoginReq.code(), 3);
        assert_eq!(MessageType::HeartbeatResp.code(), 6);
        assert_eq!(MessageType::from_code(0x7F), MessageType::Unknown(0x7F));
    }

    #[test]
    fn test_login_result() {
        assert_eq!(Message::login_resp(LOGIN_ACCEPTED).login_result(), Some(0));
        assert_eq!(Message::login_resp(LOGIN_REJECTED).login_result(), Some(-1));
        assert_eq!(Message::login_req().login_result(), None);

        let odd = Message::new(MessageType::LoginResp, Some(Value::from("ok")));
        assert_eq!(odd.login_result(), None);
    }

    #[test]
    fn test_default_header() {
        let header = Header::new(MessageType::HeartbeatReq);
        assert_eq!(header.crc_code, DEFAULT_CRC_CODE);
        assert_eq!(header.session_id, 0);
        assert!(header.attachments.is_empty());
    }
}
