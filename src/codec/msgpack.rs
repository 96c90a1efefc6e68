//! MsgPack codec using `rmp-serde`.
//!
//! **Always use `to_vec_named`, never `to_vec`.** Messages are internally
//! tagged (`kind`) and must be encoded as maps with field names; the
//! positional array form cannot be decoded back into a tagged [`Message`]
//! and is not what JavaScript peers produce.
//!
//! # Example
//!
//! ```
//! use service_proxy::codec::MsgPackCodec;
//! use service_proxy::protocol::Message;
//! use serde_json::json;
//!
//! let msg = Message::request("1", "echo", vec![json!("hello")]);
//! let bytes = MsgPackCodec::encode_message(&msg).unwrap();
//! assert_eq!(MsgPackCodec::decode_message(&bytes).unwrap(), msg);
//! ```

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::Message;

/// MessagePack codec for wire messages and arbitrary serde values.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode a protocol message into a channel payload.
    pub fn encode_message(msg: &Message) -> Result<Bytes> {
        Self::encode(msg).map(Bytes::from)
    }

    /// Decode a channel payload into a protocol message.
    pub fn decode_message(bytes: &[u8]) -> Result<Message> {
        Self::decode(bytes)
    }
}
