//! Codec module - serialization/deserialization for payloads.
//!
//! This module provides codecs for encoding/decoding frame payloads:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (the default)
//! - [`JsonCodec`] - JSON using `serde_json`, readable in packet captures
//!
//! # Design
//!
//! Codecs are marker structs implementing [`Codec`] through static
//! functions. Clients and servers take the codec as a type parameter, so
//! selection happens at compile time and both ends of a connection must
//! agree on it.
//!
//! An empty payload stands for "no body" and decodes as the type's null
//! value (`()`, `None`, `serde_json::Value::Null`).
//!
//! # Example
//!
//! ```
//! use peerwire::codec::{Codec, JsonCodec, MsgPackCodec};
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let none: Option<u32> = JsonCodec::decode_body(&[]).unwrap();
//! assert_eq!(none, None);
//! ```

mod envelope;
mod json;
mod msgpack;

use serde::de::value::Error as ValueError;
use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::Serialize;

use crate::error::{Result, RpcError};

pub(crate) use envelope::{MethodName, Params, RequestEnvelope};
pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Pluggable payload serialization.
pub trait Codec: Send + Sync + 'static {
    /// Short name used in logs.
    const NAME: &'static str;

    /// Encode a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>>;

    /// Decode bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T>;

    /// Decode a frame body, treating an empty payload as null.
    fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            T::deserialize(IntoDeserializer::<ValueError>::into_deserializer(()))
                .map_err(|e| RpcError::Protocol(format!("Empty payload: {}", e)))
        } else {
            Self::decode(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_decode_body_empty_is_null() {
        let unit: () = MsgPackCodec::decode_body(&[]).unwrap();
        assert_eq!(unit, ());

        let none: Option<String> = MsgPackCodec::decode_body(&[]).unwrap();
        assert_eq!(none, None);

        let value: serde_json::Value = JsonCodec::decode_body(&[]).unwrap();
        assert_eq!(value, serde_json::Value::Null);
    }

    #[test]
    fn test_decode_body_empty_struct_fails() {
        #[derive(Deserialize, Debug)]
        struct Needs {
            #[allow(dead_code)]
            n: u32,
        }

        let result: Result<Needs> = MsgPackCodec::decode_body(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_decode_body_non_empty_delegates() {
        let bytes = JsonCodec::encode(&42u32).unwrap();
        let n: u32 = JsonCodec::decode_body(&bytes).unwrap();
        assert_eq!(n, 42);
    }
}
