//! Local forwarding stubs built from a method manifest.
//!
//! A [`ProxyStub`] exposes exactly the names listed in its [`Manifest`]; each
//! call is forwarded as `send_request(name, args)` on the underlying
//! [`RequestSender`] (normally a [`ServiceProxy`](crate::ServiceProxy)).
//!
//! Manifests come in three forms:
//!
//! - an explicit ordered list of names, used verbatim;
//! - a key/value mapping, whose keys are the names;
//! - a static [`InterfaceDecl`], declared next to the service type, whose
//!   method members are collected from the most derived declaration up to
//!   the root.
//!
//! # Example
//!
//! ```
//! use service_proxy::interface::{InterfaceDecl, Manifest, Member};
//!
//! static BASE: InterfaceDecl = InterfaceDecl {
//!     name: "Mock",
//!     members: &[Member::Field("mockProp"), Member::Method("mockMethod")],
//!     base: None,
//! };
//! static EXTENDED: InterfaceDecl = InterfaceDecl {
//!     name: "MockExtended",
//!     members: &[Member::Method("mockMethodWithParams")],
//!     base: Some(&BASE),
//! };
//!
//! let names = Manifest::from(&EXTENDED).into_names();
//! assert_eq!(names, ["mockMethodWithParams", "mockMethod"]);
//! ```

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{ProxyError, Result};
use crate::service::BoxFuture;

/// Anything that can issue a correlated request.
pub trait RequestSender: Send + Sync {
    fn send_request(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, Result<Value>>;
}

/// One declared member of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    /// A callable member; becomes part of the manifest.
    Method(&'static str),
    /// A data member; never forwarded.
    Field(&'static str),
}

/// Static description of a service type's members and its base type.
#[derive(Debug)]
pub struct InterfaceDecl {
    pub name: &'static str,
    pub members: &'static [Member],
    pub base: Option<&'static InterfaceDecl>,
}

impl InterfaceDecl {
    /// Callable names, most derived level first, each name once.
    ///
    /// Within one level names are sorted. `constructor` and fields are
    /// skipped, as is any name already taken from a more derived level.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let mut level = Some(self);

        while let Some(decl) = level {
            let mut own: Vec<&str> = decl
                .members
                .iter()
                .filter_map(|m| match m {
                    Member::Method(name) => Some(*name),
                    Member::Field(_) => None,
                })
                .filter(|name| *name != "constructor")
                .collect();
            own.sort_unstable();
            own.dedup();

            for name in own {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_string());
                }
            }
            level = decl.base;
        }

        names
    }
}

/// The set of method names a stub forwards.
#[derive(Debug, Clone)]
pub enum Manifest {
    Names(Vec<String>),
    Mapping(Map<String, Value>),
    Interface(&'static InterfaceDecl),
}

impl Manifest {
    /// Interpret a dynamic value as a manifest.
    ///
    /// An array of strings is a name list and an object is a mapping.
    /// Everything else is rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    _ => Err(ProxyError::UnsupportedWrapperType),
                })
                .collect::<Result<Vec<_>>>()
                .map(Manifest::Names),
            Value::Object(map) => Ok(Manifest::Mapping(map)),
            _ => Err(ProxyError::UnsupportedWrapperType),
        }
    }

    /// Method names this manifest exposes.
    pub fn into_names(self) -> Vec<String> {
        match self {
            Manifest::Names(names) => names,
            Manifest::Mapping(map) => map.into_iter().map(|(k, _)| k).collect(),
            Manifest::Interface(decl) => decl.method_names(),
        }
    }
}

impl From<Vec<String>> for Manifest {
    fn from(names: Vec<String>) -> Self {
        Manifest::Names(names)
    }
}

impl From<&[&str]> for Manifest {
    fn from(names: &[&str]) -> Self {
        Manifest::Names(names.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Manifest {
    fn from(names: [&str; N]) -> Self {
        Manifest::Names(names.iter().map(|s| s.to_string()).collect())
    }
}

impl From<Map<String, Value>> for Manifest {
    fn from(map: Map<String, Value>) -> Self {
        Manifest::Mapping(map)
    }
}

impl From<&'static InterfaceDecl> for Manifest {
    fn from(decl: &'static InterfaceDecl) -> Self {
        Manifest::Interface(decl)
    }
}

/// Forwarding object exposing exactly the manifest's method names.
#[derive(Debug, Clone)]
pub struct ProxyStub<S> {
    sender: S,
    methods: Vec<String>,
}

impl<S: RequestSender> ProxyStub<S> {
    /// Wrap `sender`, forwarding only the methods `manifest` names.
    pub fn new(sender: S, manifest: impl Into<Manifest>) -> Self {
        Self {
            sender,
            methods: manifest.into().into_names(),
        }
    }

    /// Names this stub forwards, in manifest order.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m == name)
    }

    /// Forward `name(args...)` and wait for the remote result.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        if !self.has_method(name) {
            return Err(ProxyError::NoSuchMethod(name.to_string()));
        }
        self.sender.send_request(name, args).await
    }

    /// Like [`call`](Self::call), decoding the result into `R`.
    pub async fn call_as<R: DeserializeOwned>(&self, name: &str, args: Vec<Value>) -> Result<R> {
        let value = self.call(name, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// A handle bound to one method.
    pub fn method(&self, name: &str) -> Option<RemoteMethod<'_, S>> {
        self.has_method(name).then(|| RemoteMethod {
            stub: self,
            name: name.to_string(),
        })
    }
}

/// One method of a [`ProxyStub`].
#[derive(Debug)]
pub struct RemoteMethod<'a, S> {
    stub: &'a ProxyStub<S>,
    name: String,
}

impl<S: RequestSender> RemoteMethod<'_, S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke this method with positional `args`.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.stub.sender.send_request(&self.name, args).await
    }
}
