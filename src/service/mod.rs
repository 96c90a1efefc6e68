//! Service module - what the listener dispatches requests into.
//!
//! Provides:
//! - [`Service`] - the object-safe dispatch trait
//! - [`Fault`] - the value a failing method sends back to the caller
//! - [`ServiceRegistry`] - name-keyed typed handlers implementing [`Service`]
//!
//! Every method returns a future, even when its result is known up front, so
//! the listener always awaits and never inspects the shape of a result.
//!
//! # Example
//!
//! ```
//! use service_proxy::service::{Fault, ServiceRegistry};
//!
//! let registry = ServiceRegistry::new()
//!     .method("add", |(a, b): (i64, i64)| async move { Ok::<_, Fault>(a + b) })
//!     .method("fail", |_: ()| async { Err::<(), _>(Fault::from("wonderful error")) });
//!
//! assert_eq!(registry.method_names(), ["add", "fail"]);
//! ```

mod registry;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

pub use registry::{Method, ServiceRegistry, TypedMethod};

/// Boxed future for service results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one service method invocation.
pub type ServiceResult = Result<Value, Fault>;

/// A failed invocation. The wrapped value is forwarded verbatim as the
/// `res` of the Error response.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault(Value);

impl Fault {
    /// A fault carrying `value` as is.
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    /// A fault carrying an error's message text.
    pub fn from_error(err: &(dyn std::error::Error + '_)) -> Self {
        Self(Value::String(err.to_string()))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

impl From<&str> for Fault {
    fn from(msg: &str) -> Self {
        Self(Value::String(msg.to_string()))
    }
}

impl From<String> for Fault {
    fn from(msg: String) -> Self {
        Self(Value::String(msg))
    }
}

impl From<Value> for Fault {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// A service instance the listener can dispatch to.
pub trait Service: Send + Sync + 'static {
    /// Invoke `method` with positional `params`.
    fn call(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, ServiceResult>;
}

impl<S: Service + ?Sized> Service for Arc<S> {
    fn call(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, ServiceResult> {
        (**self).call(method, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fault_conversions() {
        assert_eq!(Fault::from("boom").value(), &json!("boom"));
        assert_eq!(Fault::from(String::from("boom")).into_value(), json!("boom"));
        assert_eq!(Fault::from(json!({"code": 7})).value()["code"], 7);
    }

    #[test]
    fn test_fault_from_error_uses_message() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        assert_eq!(Fault::from_error(&err).value(), &json!("disk on fire"));
    }

    #[test]
    fn test_fault_display() {
        assert_eq!(Fault::from("plain").to_string(), "plain");
        assert_eq!(Fault::new(json!([1, 2])).to_string(), "[1,2]");
    }

    struct Constant;

    impl Service for Constant {
        fn call(&self, method: &str, _params: Vec<Value>) -> BoxFuture<'static, ServiceResult> {
            let method = method.to_string();
            Box::pin(async move { Ok(json!(method)) })
        }
    }

    #[tokio::test]
    async fn test_arc_service_delegates() {
        let service: Arc<dyn Service> = Arc::new(Constant);
        assert_eq!(service.call("who", vec![]).await.unwrap(), json!("who"));
    }
}
