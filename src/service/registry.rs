//! Service registry mapping method names to typed handlers.
//!
//! Positional params arrive as a JSON array and are decoded into the
//! handler's argument type, so a tuple receives them in order:
//!
//! ```ignore
//! registry.register("greet", |(name, times): (String, u32)| async move {
//!     Ok::<_, Fault>(name.repeat(times as usize))
//! });
//! ```
//!
//! A handler taking `()` accepts an empty params list, and one taking
//! `Vec<Value>` receives the params untouched.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{BoxFuture, Fault, Service, ServiceResult};

/// A single remotely callable method.
pub trait Method: Send + Sync + 'static {
    /// Invoke with positional params.
    fn call(&self, params: Vec<Value>) -> BoxFuture<'static, ServiceResult>;
}

/// Wrapper that decodes params and encodes the result around a handler.
pub struct TypedMethod<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, Fault>> + Send + 'static,
{
    name: String,
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, R, Fut> TypedMethod<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, Fault>> + Send + 'static,
{
    pub fn new(name: &str, handler: F) -> Self {
        Self {
            name: name.to_string(),
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Method for TypedMethod<F, T, R, Fut>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R, Fault>> + Send + 'static,
{
    fn call(&self, params: Vec<Value>) -> BoxFuture<'static, ServiceResult> {
        let parsed: T = match decode_params(params) {
            Ok(v) => v,
            Err(e) => {
                let fault = Fault::from(format!("invalid params for {}: {}", self.name, e));
                return Box::pin(async move { Err(fault) });
            }
        };

        let name = self.name.clone();
        let fut = (self.handler)(parsed);
        Box::pin(async move {
            let out = fut.await?;
            serde_json::to_value(out)
                .map_err(|e| Fault::from(format!("unserializable result from {}: {}", name, e)))
        })
    }
}

fn decode_params<T: DeserializeOwned>(params: Vec<Value>) -> serde_json::Result<T> {
    if params.is_empty() {
        // Unit-like targets (`()`, `Option<_>`) only accept null.
        if let Ok(v) = serde_json::from_value(Value::Null) {
            return Ok(v);
        }
    }
    serde_json::from_value(Value::Array(params))
}

/// Registry mapping method names to handlers.
///
/// Implements [`Service`], so it can be handed straight to a listener.
#[derive(Default)]
pub struct ServiceRegistry {
    /// Methods by name.
    methods: HashMap<String, Box<dyn Method>>,
    /// Names in registration order.
    order: Vec<String>,
}

impl ServiceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, builder style.
    pub fn method<F, T, R, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, Fault>> + Send + 'static,
    {
        self.register(name, handler);
        self
    }

    /// Register a handler. Re-registering a name replaces its handler and
    /// keeps its original position.
    pub fn register<F, T, R, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R, Fault>> + Send + 'static,
    {
        let typed = TypedMethod::new(name, handler);
        if self.methods.insert(name.to_string(), Box::new(typed)).is_none() {
            self.order.push(name.to_string());
        }
    }

    /// Get a method by name.
    pub fn get(&self, name: &str) -> Option<&dyn Method> {
        self.methods.get(name).map(|m| m.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names in registration order.
    pub fn method_names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Service for ServiceRegistry {
    fn call(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, ServiceResult> {
        match self.get(method) {
            Some(m) => m.call(params),
            None => {
                let fault = Fault::from(format!("unknown method: {}", method));
                Box::pin(async move { Err(fault) })
            }
        }
    }
}
