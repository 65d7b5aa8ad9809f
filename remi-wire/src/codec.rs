use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::WireError;

/// Serialization format for user objects carried inside invocation frames.
///
/// The invocation protocol only mandates how encoded payloads compose with
/// the framing (length-prefixed inside a sharing scope); the format itself
/// is selected per session and checked during the handshake, so both peers
/// always agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectCodec {
    /// Compact binary encoding. The default.
    Bincode,
    /// Self-describing JSON, convenient when inspecting traffic by hand.
    Json,
}

impl ObjectCodec {
    /// The byte identifying this codec during the session handshake.
    pub fn wire_id(self) -> u8 {
        match self {
            ObjectCodec::Bincode => 1,
            ObjectCodec::Json => 2,
        }
    }

    /// Reverse of [`ObjectCodec::wire_id`].
    pub fn from_wire_id(id: u8) -> Option<ObjectCodec> {
        match id {
            1 => Some(ObjectCodec::Bincode),
            2 => Some(ObjectCodec::Json),
            _ => None,
        }
    }

    /// Encode a value to a self-contained payload.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>, WireError> {
        let result = match self {
            ObjectCodec::Bincode => bincode::serialize(value).map_err(|e| e.to_string()),
            ObjectCodec::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
        };
        result.map_err(|reason| WireError::NonSerializable {
            type_name: std::any::type_name::<T>(),
            reason,
        })
    }

    /// Decode a payload produced by [`ObjectCodec::encode`]. A payload that
    /// does not parse is a corrupted stream: the peer speaks the same codec
    /// by handshake.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, WireError> {
        let result = match self {
            ObjectCodec::Bincode => bincode::deserialize(bytes).map_err(|e| e.to_string()),
            ObjectCodec::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        };
        result.map_err(|reason| {
            WireError::Corrupted(format!(
                "cannot decode {}: {}",
                std::any::type_name::<T>(),
                reason
            ))
        })
    }
}

impl Default for ObjectCodec {
    fn default() -> ObjectCodec {
        ObjectCodec::Bincode
    }
}
