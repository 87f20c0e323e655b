//! # Serializer
//!
//! The payload encoding of a session. The rest of the runtime only ever sees
//! bytes; this is the single place that turns messages into bytes and back.
//!
//! MessagePack goes through `rmp_serde::to_vec_named` so structs travel as maps
//! and peers in other languages can read them by field name.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Marshalling failures, tagged with the format that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    Encode { format: &'static str, message: String },
    Decode { format: &'static str, message: String },
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode { format, message } => write!(f, "{} encode failed: {}", format, message),
            Self::Decode { format, message } => write!(f, "{} decode failed: {}", format, message),
        }
    }
}

impl std::error::Error for SerializeError {}

/// Payload encodings. Both peers of a session must use the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Serializer {
    #[default]
    Json,
    MsgPack,
}

impl Serializer {
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        }
    }

    pub fn marshal<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes, SerializeError> {
        let encoded = match self {
            Self::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
            Self::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| e.to_string()),
        };
        encoded
            .map(Bytes::from)
            .map_err(|message| SerializeError::Encode { format: self.name(), message })
    }

    pub fn unmarshal<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, SerializeError> {
        let decoded = match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
            Self::MsgPack => rmp_serde::from_slice(bytes).map_err(|e| e.to_string()),
        };
        decoded.map_err(|message| SerializeError::Decode { format: self.name(), message })
    }
}

impl std::str::FromStr for Serializer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::MsgPack),
            other => Err(format!("unknown serializer '{}'", other)),
        }
    }
}
