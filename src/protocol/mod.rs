//! Protocol module - wire vocabulary shared by both roles.
//!
//! - [`Message`] and its variants ([`Request`], [`SignalRequest`], [`Response`])
//! - [`Signal`] control codes
//! - [`TrustPolicy`] sender address validation

mod message;
mod origin;

pub use message::{Message, Request, Response, Signal, SignalRequest};
pub use origin::TrustPolicy;
