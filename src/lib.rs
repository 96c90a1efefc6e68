//! # service-proxy
//!
//! Call methods on a service that lives in another isolated context, when the
//! only link between the two is an asynchronous, unordered, untrusted
//! message channel.
//!
//! ## Architecture
//!
//! - **Caller side**: [`ServiceProxy`] correlates requests with responses by
//!   id, bounds every wait with a timeout and drives the init/stop handshake.
//!   [`ProxyStub`] forwards named methods through it.
//! - **Service side**: [`ProxyListener`] dispatches requests into a
//!   [`Service`](service::Service) and runs the cancellable stop protocol.
//! - **Shared contract**: the [`Message`] vocabulary, MsgPack encoded, and the
//!   sender address check ([`TrustPolicy`]).
//!
//! ## Example
//!
//! ```
//! use serde_json::json;
//! use service_proxy::proxy::fixed_channel;
//! use service_proxy::{Fault, MemoryChannel, ProxyListener, ServiceProxy, ServiceRegistry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> service_proxy::Result<()> {
//! let (host, frame) = MemoryChannel::pair("https://host.app", "https://frame.app");
//!
//! let registry = ServiceRegistry::new()
//!     .method("add", |(a, b): (i64, i64)| async move { Ok::<_, Fault>(a + b) });
//! let listener = ProxyListener::new(registry, "https://host.app", frame);
//!
//! let proxy = ServiceProxy::builder("https://frame.app", fixed_channel(host.clone())).build();
//! let init = tokio::spawn({
//!     let proxy = proxy.clone();
//!     async move { proxy.init().await }
//! });
//! while host.subscriber_count() == 0 {
//!     tokio::task::yield_now().await;
//! }
//! listener.listen(None)?;
//! init.await.unwrap()?;
//!
//! let stub = proxy.wrap_with(["add"]);
//! assert_eq!(stub.call("add", vec![json!(2), json!(3)]).await?, json!(5));
//!
//! proxy.stop(false).await?;
//! assert!(!listener.is_listening());
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod interface;
pub mod listener;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{ProxyError, Result};
pub use interface::{Manifest, ProxyStub};
pub use listener::ProxyListener;
pub use protocol::{Message, Signal, TrustPolicy};
pub use proxy::ServiceProxy;
pub use service::{Fault, ServiceRegistry};
pub use transport::MemoryChannel;

/// Lock a mutex, recovering the data if a holder panicked.
///
/// Critical sections in this crate never leave state half-updated.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
