//! Error types for service-proxy.
//!
//! The `Display` text of the lifecycle and protocol variants is part of the
//! compatibility surface: callers on the other side of a proxy match on these
//! exact strings.

use serde_json::Value;
use thiserror::Error;

/// Main error type for all proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// An inbound request was missing its id or method name.
    #[error("proxy request in invalid format")]
    InvalidFormat,

    /// The listener never announced itself within the init timeout.
    #[error("proxy init timeout")]
    InitTimeout,

    /// No matching response arrived within the call's timeout.
    #[error("proxy request timeout")]
    RequestTimeout,

    /// Operation needs an initialized proxy.
    #[error("proxy is not active")]
    NotActive,

    /// `init` called on a proxy that is already initialized (or initializing).
    #[error("proxy already initialized")]
    AlreadyInitialized,

    /// A control message the handshake cannot interpret.
    #[error("unsupported response")]
    UnsupportedResponse,

    /// Manifest given to the wrapper is not a list of names or a mapping.
    #[error("unsupported type for wrapper")]
    UnsupportedWrapperType,

    /// The remote side rejected the call; carries its `res` verbatim.
    ///
    /// Used both for faults raised by the service and for vetoed stops.
    #[error("remote error: {}", display_value(.0))]
    Remote(Value),

    /// The wrapper has no method with this name.
    #[error("no such method on wrapper: {0}")]
    NoSuchMethod(String),

    /// The id generator produced an id that is still pending.
    #[error("request id already pending: {0}")]
    DuplicateId(String),

    /// The channel (or the proxy's dispatcher) went away mid-call.
    #[error("channel closed")]
    ChannelClosed,

    /// A successful result could not be converted into the requested type.
    #[error("result decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl ProxyError {
    /// The remote payload, if this error carries one.
    pub fn remote_value(&self) -> Option<&Value> {
        match self {
            ProxyError::Remote(value) => Some(value),
            _ => None,
        }
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
