use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of an RPC message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Expects a response
    Request,
    /// One-way notification
    Notify,
    /// Fire-and-forget publication
    Publish,
    /// Reply to a request
    Response,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Notify => "notify",
            MessageKind::Publish => "publish",
            MessageKind::Response => "response",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload encoding selected per call
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    /// Compact binary encoding
    #[default]
    Binary,
    /// Textual JSON encoding
    Json,
}

impl CodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeType::Binary => "binary",
            CodeType::Json => "json",
        }
    }
}

impl fmt::Display for CodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope carried by every RPC operation.
///
/// `payload` holds the serialized domain message; it is decoded a second
/// time by application code once the handler for `msg_id` is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    pub msg_id: i32,
    pub payload: Bytes,
}

impl Envelope {
    pub fn new(kind: MessageKind, msg_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            msg_id,
            payload: payload.into(),
        }
    }

    pub fn request(msg_id: i32, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Request, msg_id, payload)
    }

    pub fn publish(msg_id: i32, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Publish, msg_id, payload)
    }

    pub fn response(msg_id: i32, payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Response, msg_id, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&MessageKind::Notify).unwrap();
        assert_eq!(json, "\"notify\"");
        let kind: MessageKind = serde_json::from_str("\"response\"").unwrap();
        assert_eq!(kind, MessageKind::Response);
    }

    #[test]
    fn test_code_type_default_is_binary() {
        assert_eq!(CodeType::default(), CodeType::Binary);
        assert_eq!(CodeType::Json.to_string(), "json");
    }

    #[test]
    fn test_constructors_set_kind() {
        assert_eq!(Envelope::request(1, vec![1u8]).kind, MessageKind::Request);
        assert_eq!(Envelope::publish(2, Bytes::new()).kind, MessageKind::Publish);
        assert_eq!(Envelope::response(3, Bytes::new()).msg_id, 3);
    }
}
