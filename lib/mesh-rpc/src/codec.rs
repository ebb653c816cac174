//! Envelope codec with pluggable payload serializers

use crate::{Result, RpcError};
use bytes::Bytes;
use mesh_api::{CodeType, Envelope, MessageKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

/// Serializer used for both the envelope framing and the domain payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Serializer {
    Bincode,
    Json,
}

impl Serializer {
    pub fn to_vec<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Serializer::Bincode => Ok(bincode::serialize(value)?),
            Serializer::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn from_slice<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Serializer::Bincode => Ok(bincode::deserialize(data)?),
            Serializer::Json => Ok(serde_json::from_slice(data)?),
        }
    }
}

#[derive(Serialize)]
struct BinaryFrameOut<'a> {
    kind: MessageKind,
    msg_id: i32,
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct BinaryFrameIn {
    kind: MessageKind,
    msg_id: i32,
    payload: Vec<u8>,
}

// The JSON frame embeds the payload as a JSON value rather than an
// escaped byte array, so the wire form stays readable.
#[derive(Serialize)]
struct JsonFrameOut<'a> {
    kind: MessageKind,
    msg_id: i32,
    payload: &'a RawValue,
}

#[derive(Deserialize)]
struct JsonFrameIn<'a> {
    kind: MessageKind,
    msg_id: i32,
    #[serde(borrow)]
    payload: &'a RawValue,
}

/// Codec encodes envelopes and the payloads they carry.
///
/// The envelope is decoded once by the transport; the payload is decoded
/// again by the handler for its message id with [`Codec::decode_msg`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Codec {
    serializer: Serializer,
}

impl Codec {
    pub fn new(serializer: Serializer) -> Self {
        Self { serializer }
    }

    pub fn binary() -> Self {
        Self::new(Serializer::Bincode)
    }

    pub fn json() -> Self {
        Self::new(Serializer::Json)
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes> {
        let data = match self.serializer {
            Serializer::Bincode => bincode::serialize(&BinaryFrameOut {
                kind: envelope.kind,
                msg_id: envelope.msg_id,
                payload: &envelope.payload,
            })?,
            Serializer::Json => {
                let payload: &RawValue = serde_json::from_slice(&envelope.payload)
                    .map_err(|e| RpcError::Codec(format!("payload is not JSON: {}", e)))?;
                serde_json::to_vec(&JsonFrameOut {
                    kind: envelope.kind,
                    msg_id: envelope.msg_id,
                    payload,
                })?
            }
        };
        Ok(Bytes::from(data))
    }

    pub fn decode(&self, data: &[u8]) -> Result<Envelope> {
        match self.serializer {
            Serializer::Bincode => {
                let frame: BinaryFrameIn = bincode::deserialize(data)?;
                Ok(Envelope::new(frame.kind, frame.msg_id, frame.payload))
            }
            Serializer::Json => {
                let frame: JsonFrameIn<'_> = serde_json::from_slice(data)?;
                Ok(Envelope::new(
                    frame.kind,
                    frame.msg_id,
                    Bytes::copy_from_slice(frame.payload.get().as_bytes()),
                ))
            }
        }
    }

    /// Decode an envelope payload into the domain type
    pub fn decode_msg<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        self.serializer.from_slice(payload)
    }

    /// Serialize a domain value into an envelope payload
    pub fn encode_msg<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(self.serializer.to_vec(value)?))
    }

    /// Serialize `value` as the raw payload of a reply envelope
    pub fn response<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        self.encode_msg(value)
    }

    /// Build a complete encoded response envelope for `msg_id`
    pub fn response_to<T: Serialize + ?Sized>(&self, msg_id: i32, value: &T) -> Result<Bytes> {
        self.encode(&Envelope::response(msg_id, self.response(value)?))
    }
}

/// One codec per code type
#[derive(Clone, Debug, Default)]
pub struct CodecRegistry {
    codecs: HashMap<CodeType, Codec>,
}

impl CodecRegistry {
    /// Registry with no codecs
    pub fn empty() -> Self {
        Self::default()
    }

    /// Binary for [`CodeType::Binary`], JSON for [`CodeType::Json`]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(CodeType::Binary, Codec::binary());
        registry.register(CodeType::Json, Codec::json());
        registry
    }

    pub fn register(&mut self, code_type: CodeType, codec: Codec) {
        self.codecs.insert(code_type, codec);
    }

    pub fn get(&self, code_type: CodeType) -> Result<Codec> {
        self.codecs
            .get(&code_type)
            .copied()
            .ok_or_else(|| RpcError::Configuration(format!("no codec registered for {}", code_type)))
    }
}
