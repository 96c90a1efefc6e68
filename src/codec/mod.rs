//! Codec module - serialization of wire messages.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`, so
//!   structs travel as maps, which is what JavaScript peers expect)
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects.
//! Payloads leave the codec as `bytes::Bytes`, which the channel moves
//! without copying.

mod msgpack;

pub use msgpack::MsgPackCodec;
