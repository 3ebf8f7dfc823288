//! MsgPack codec using `rmp-serde`.
//!
//! Always uses `to_vec_named`: structs travel as maps keyed by field
//! name, so peers written against other MessagePack libraries (and the
//! `{method, params}` request body) decode them by name, not position.
//!
//! # Example
//!
//! ```
//! use peerwire::codec::{Codec, MsgPackCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Bid {
//!     lot: u32,
//!     amount: u64,
//! }
//!
//! let bid = Bid { lot: 7, amount: 1500 };
//! let encoded = MsgPackCodec::encode(&bid).unwrap();
//! let decoded: Bid = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, bid);
//! ```

use super::Codec;
use crate::error::Result;

/// MessagePack codec for structured data.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    const NAME: &'static str = "msgpack";

    #[inline]
    fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    #[inline]
    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Lot {
        id: u32,
        title: String,
        open: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Lot {
            id: 42,
            title: "lamp".to_string(),
            open: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Lot = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_decode_nested() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Catalog {
            lots: Vec<Lot>,
            seller: Option<String>,
        }

        let original = Catalog {
            lots: vec![
                Lot {
                    id: 1,
                    title: "a".into(),
                    open: false,
                },
                Lot {
                    id: 2,
                    title: "b".into(),
                    open: true,
                },
            ],
            seller: None,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Catalog = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_structs_encode_as_maps() {
        let lot = Lot {
            id: 1,
            title: "x".to_string(),
            open: false,
        };

        let encoded = MsgPackCodec::encode(&lot).unwrap();

        // fixmap with 3 entries; positional encoding would be 0x93.
        assert_eq!(encoded[0], 0x83, "Expected fixmap, got {:02X}", encoded[0]);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Lot> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(matches!(
            result,
            Err(crate::error::RpcError::MsgPackDecode(_))
        ));
    }

    #[test]
    fn test_none_is_nil() {
        let encoded = MsgPackCodec::encode(&Option::<i32>::None).unwrap();
        assert_eq!(encoded, vec![0xc0]);

        let decoded: Option<i32> = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_binary_payload() {
        let data: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        let encoded = MsgPackCodec::encode(&serde_bytes::Bytes::new(&data)).unwrap();

        // bin8 marker
        assert_eq!(encoded[0], 0xc4);

        let decoded: serde_bytes::ByteBuf = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), &data);
    }

    #[test]
    fn test_dynamic_value() {
        let value = serde_json::json!({"hello": "world", "n": [1, 2, 3]});
        let encoded = MsgPackCodec::encode(&value).unwrap();
        let decoded: serde_json::Value = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }
}
