//! Wire messages shared by both roles.
//!
//! Every message is one variant of [`Message`], tagged on the wire by an
//! explicit `kind` field:
//!
//! | kind       | fields                        |
//! |------------|-------------------------------|
//! | `request`  | `id?`, `methodName?`, `params?` |
//! | `signal`   | `id`, `signal`                |
//! | `response` | `id?`, `res`, `signal?`       |
//!
//! Request fields are optional on the wire so that a malformed request can be
//! decoded and answered with an error instead of being dropped.
//!
//! # Example
//!
//! ```
//! use service_proxy::protocol::{Message, Response, Signal};
//! use serde_json::json;
//!
//! let msg = Message::request("7", "echo", vec![json!(42)]);
//! assert_eq!(msg.id(), Some("7"));
//!
//! let res = Response::signal(None, Signal::Listening, json!({"ready": true}));
//! assert!(res.is_signal(Signal::Listening));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;

/// Control-plane signal.
///
/// Encoded as numeric codes starting at 900. Codes this crate does not know
/// decode as [`Signal::Unknown`] so the surrounding message survives; each
/// role decides what an unknown signal means for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", from = "u16")]
pub enum Signal {
    /// The listener is up; sent once when it starts listening.
    Listening,
    /// Stop request (client to listener) or stop confirmation (listener to client).
    StopListening,
    /// The response carries a fault instead of a result.
    Error,
    /// Any other code, kept verbatim.
    Unknown(u16),
}

impl Signal {
    /// Wire code for this signal.
    pub const fn code(self) -> u16 {
        match self {
            Signal::Listening => 900,
            Signal::StopListening => 901,
            Signal::Error => 902,
            Signal::Unknown(code) => code,
        }
    }
}

impl From<Signal> for u16 {
    fn from(signal: Signal) -> u16 {
        signal.code()
    }
}

impl From<u16> for Signal {
    fn from(code: u16) -> Self {
        match code {
            900 => Signal::Listening,
            901 => Signal::StopListening,
            902 => Signal::Error,
            other => Signal::Unknown(other),
        }
    }
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
}

impl Request {
    /// Returns `(id, method_name)` if both are present and non-empty.
    pub fn validate(&self) -> Result<(&str, &str), ProxyError> {
        match (self.id.as_deref(), self.method_name.as_deref()) {
            (Some(id), Some(method)) if !id.is_empty() && !method.is_empty() => Ok((id, method)),
            _ => Err(ProxyError::InvalidFormat),
        }
    }
}

/// A control request (currently only `StopListening` is acted upon).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRequest {
    pub id: String,
    pub signal: Signal,
}

/// Reply to a request, or an unsolicited `Listening` announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub res: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Signal>,
}

impl Response {
    /// A normal result.
    pub fn result(id: impl Into<String>, res: Value) -> Self {
        Self {
            id: Some(id.into()),
            res,
            signal: None,
        }
    }

    /// An error reply; `id` is echoed as received, even when absent.
    pub fn error(id: Option<String>, res: Value) -> Self {
        Self {
            id,
            res,
            signal: Some(Signal::Error),
        }
    }

    /// A reply carrying a control signal.
    pub fn signal(id: Option<String>, signal: Signal, res: Value) -> Self {
        Self {
            id,
            res,
            signal: Some(signal),
        }
    }

    #[inline]
    pub fn is_signal(&self, signal: Signal) -> bool {
        self.signal == Some(signal)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.is_signal(Signal::Error)
    }
}

/// Every message that crosses the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Request(Request),
    Signal(SignalRequest),
    Response(Response),
}

impl Message {
    /// Build a well-formed request.
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Message::Request(Request {
            id: Some(id.into()),
            method_name: Some(method.into()),
            params: Some(params),
        })
    }

    /// Build a signal request.
    pub fn signal(id: impl Into<String>, signal: Signal) -> Self {
        Message::Signal(SignalRequest {
            id: id.into(),
            signal,
        })
    }

    /// The message id, if it has one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Request(req) => req.id.as_deref(),
            Message::Signal(sig) => Some(&sig.id),
            Message::Response(res) => res.id.as_deref(),
        }
    }
}

impl From<Response> for Message {
    fn from(res: Response) -> Self {
        Message::Response(res)
    }
}
