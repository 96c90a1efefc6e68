//! Request correlator - the calling side of a proxy.
//!
//! A [`ServiceProxy`] talks to one remote listener over a [`Channel`]:
//!
//! 1. `init` opens the channel through the [`Connector`] and waits for the
//!    listener's `Listening` announcement
//! 2. `send_request` tags each call with a fresh id and waits for the
//!    matching response, however late or out of order it arrives
//! 3. `stop` asks the listener to stop and, if it agrees, releases the channel
//!
//! Every inbound message is checked against the proxy's URL with the
//! configured [`TrustPolicy`] before it is decoded.
//!
//! # Example
//!
//! ```ignore
//! use service_proxy::proxy::{fixed_channel, ServiceProxy};
//!
//! let proxy = ServiceProxy::builder("https://frame.app", fixed_channel(channel))
//!     .timeout(Duration::from_secs(2))
//!     .build();
//!
//! let ready = proxy.init().await?;
//! let sum: i64 = proxy.request("add", vec![json!(2), json!(3)]).await?;
//! proxy.stop(false).await?;
//! ```

mod ids;
mod pending;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::codec::MsgPackCodec;
use crate::error::{ProxyError, Result};
use crate::interface::{Manifest, ProxyStub, RequestSender};
use crate::lock;
use crate::protocol::{Message, Signal, TrustPolicy};
use crate::service::BoxFuture;
use crate::transport::{Channel, Subscription, SubscriptionId};

pub use ids::{IdGenerator, SequentialIds};

use pending::{PendingGuard, PendingTable};

/// Default init and request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Opens the channel to the remote context named by a URL.
pub trait Connector: Send + Sync + 'static {
    /// Open a channel to `url`.
    fn connect(&self, url: &str) -> Result<Arc<dyn Channel>>;
}

impl<F> Connector for F
where
    F: Fn(&str) -> Result<Arc<dyn Channel>> + Send + Sync + 'static,
{
    fn connect(&self, url: &str) -> Result<Arc<dyn Channel>> {
        self(url)
    }
}

/// A connector that always hands out the same, already open channel.
pub fn fixed_channel(channel: impl Channel) -> impl Connector {
    let channel: Arc<dyn Channel> = Arc::new(channel);
    move |_: &str| -> Result<Arc<dyn Channel>> { Ok(Arc::clone(&channel)) }
}

/// Builder for a [`ServiceProxy`].
pub struct ServiceProxyBuilder {
    url: String,
    connector: Box<dyn Connector>,
    timeout: Duration,
    ids: Box<dyn IdGenerator>,
    trust: TrustPolicy,
}

impl ServiceProxyBuilder {
    fn new(url: String, connector: Box<dyn Connector>) -> Self {
        Self {
            url,
            connector,
            timeout: DEFAULT_TIMEOUT,
            ids: Box::new(SequentialIds::new()),
            trust: TrustPolicy::default(),
        }
    }

    /// Timeout for `init`, `stop` and calls without an explicit timeout.
    ///
    /// Default: 5000 ms
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the request id source.
    ///
    /// Default: a counter starting at 1
    pub fn id_generator(mut self, ids: impl IdGenerator) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// How inbound sender addresses are matched against the URL.
    pub fn trust_policy(mut self, trust: TrustPolicy) -> Self {
        self.trust = trust;
        self
    }

    /// Finish configuration. The proxy starts idle; call `init` to connect.
    pub fn build(self) -> ServiceProxy {
        ServiceProxy {
            inner: Arc::new(Inner {
                url: self.url,
                timeout: self.timeout,
                trust: self.trust,
                ids: self.ids,
                connector: self.connector,
                state: Mutex::new(State::Idle),
                pending: Arc::new(PendingTable::new()),
            }),
        }
    }
}

enum State {
    Idle,
    Initializing,
    Active(Connection),
}

struct Connection {
    channel: Arc<dyn Channel>,
    subscription: SubscriptionId,
    dispatcher: JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.dispatcher.abort();
        self.channel.unsubscribe(self.subscription);
    }
}

struct Inner {
    url: String,
    timeout: Duration,
    trust: TrustPolicy,
    ids: Box<dyn IdGenerator>,
    connector: Box<dyn Connector>,
    state: Mutex<State>,
    pending: Arc<PendingTable>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = std::mem::replace(&mut *lock(&self.state), State::Idle);
        if let State::Active(conn) = state {
            conn.close();
        }
    }
}

/// Resets an in-progress init when it does not complete.
struct InitGuard<'a> {
    state: &'a Mutex<State>,
    armed: bool,
}

impl<'a> InitGuard<'a> {
    fn new(state: &'a Mutex<State>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *lock(self.state) = State::Idle;
        }
    }
}

/// Client handle for one remote service. Cheap to clone; clones share the
/// connection and the pending-call table.
#[derive(Clone)]
pub struct ServiceProxy {
    inner: Arc<Inner>,
}

impl fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("url", &self.inner.url)
            .field("timeout", &self.inner.timeout)
            .field("active", &self.is_init())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ServiceProxy {
    /// Start configuring a proxy for the context at `url`.
    pub fn builder(url: impl Into<String>, connector: impl Connector) -> ServiceProxyBuilder {
        ServiceProxyBuilder::new(url.into(), Box::new(connector))
    }

    /// Build with defaults and run `init`.
    pub async fn create(url: impl Into<String>, connector: impl Connector) -> Result<Self> {
        let proxy = Self::builder(url, connector).build();
        proxy.init().await?;
        Ok(proxy)
    }

    /// Address of the remote context, also used as the trusted sender.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Default wait bound for `init` and every call.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Whether the handshake completed and the channel is held.
    pub fn is_init(&self) -> bool {
        matches!(*lock(&self.inner.state), State::Active(_))
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Open the channel and wait for the listener to announce itself.
    ///
    /// Resolves with the payload the listener passed to `listen`.
    pub async fn init(&self) -> Result<Value> {
        self.init_with_timeout(self.inner.timeout).await
    }

    /// Like [`init`](Self::init) with an explicit handshake bound.
    ///
    /// On failure the channel is released and the proxy is idle again.
    pub async fn init_with_timeout(&self, timeout: Duration) -> Result<Value> {
        {
            let mut state = lock(&self.inner.state);
            if !matches!(*state, State::Idle) {
                return Err(ProxyError::AlreadyInitialized);
            }
            *state = State::Initializing;
        }
        let guard = InitGuard::new(&self.inner.state);

        let channel = self.inner.connector.connect(&self.inner.url)?;
        let mut subscription = channel.subscribe();

        let handshake = self.await_listening(&mut subscription);
        let outcome = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::InitTimeout),
        };

        let payload = match outcome {
            Ok(payload) => payload,
            Err(e) => {
                channel.unsubscribe(subscription.id());
                tracing::debug!(url = %self.inner.url, error = %e, "proxy init failed");
                return Err(e);
            }
        };

        let subscription_id = subscription.id();
        let dispatcher = tokio::spawn(dispatch_responses(
            subscription,
            self.inner.url.clone(),
            self.inner.trust,
            Arc::clone(&self.inner.pending),
        ));

        *lock(&self.inner.state) = State::Active(Connection {
            channel,
            subscription: subscription_id,
            dispatcher,
        });
        guard.disarm();

        tracing::debug!(url = %self.inner.url, "proxy initialized");
        Ok(payload)
    }

    /// Handshake phase: the first trusted control response decides.
    async fn await_listening(&self, subscription: &mut Subscription) -> Result<Value> {
        while let Some(envelope) = subscription.recv().await {
            if !self.inner.trust.accepts(&self.inner.url, &envelope.origin) {
                tracing::trace!(
                    origin = %envelope.origin,
                    "dropping message from untrusted origin"
                );
                continue;
            }

            let msg = match MsgPackCodec::decode_message(&envelope.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("ignoring undecodable message during init: {}", e);
                    continue;
                }
            };

            match msg {
                Message::Response(res) => match res.signal {
                    Some(Signal::Listening) => return Ok(res.res),
                    Some(Signal::Error) | Some(Signal::StopListening) => {
                        return Err(ProxyError::Remote(res.res))
                    }
                    Some(Signal::Unknown(code)) => {
                        tracing::debug!(code, "unknown signal during init");
                        return Err(ProxyError::UnsupportedResponse);
                    }
                    None => continue,
                },
                Message::Signal(_) => return Err(ProxyError::UnsupportedResponse),
                Message::Request(_) => continue,
            }
        }

        Err(ProxyError::ChannelClosed)
    }

    /// Call `method` on the remote service with the default timeout.
    pub async fn send_request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.send_request_with_timeout(method, params, self.inner.timeout)
            .await
    }

    /// Call `method`, failing with `RequestTimeout` after `timeout`.
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.inner.ids.next_id();
        self.round_trip(Message::request(id.clone(), method, params), id, timeout)
            .await
    }

    /// Like [`send_request`](Self::send_request), decoding the result into `R`.
    pub async fn request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<R> {
        let value = self.send_request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Ask the listener to stop.
    ///
    /// On success the channel is released. If the listener refuses, the
    /// connection is kept (so `stop` can be retried) unless `force_close`
    /// is set.
    pub async fn stop(&self, force_close: bool) -> Result<Value> {
        if !self.is_init() {
            return Err(ProxyError::NotActive);
        }

        let id = self.inner.ids.next_id();
        let result = self
            .round_trip(Message::signal(id.clone(), Signal::StopListening), id, self.inner.timeout)
            .await;

        match &result {
            Ok(_) => self.teardown(),
            Err(e) if force_close => {
                tracing::debug!(url = %self.inner.url, error = %e, "stop refused, closing anyway");
                self.teardown();
            }
            Err(_) => {}
        }

        result
    }

    /// Forwarding stub exposing the manifest's methods.
    pub fn wrap_with(&self, manifest: impl Into<Manifest>) -> ProxyStub<ServiceProxy> {
        ProxyStub::new(self.clone(), manifest)
    }

    /// Like [`wrap_with`](Self::wrap_with) for a manifest held as a dynamic value.
    pub fn wrap_with_value(&self, manifest: Value) -> Result<ProxyStub<ServiceProxy>> {
        Ok(self.wrap_with(Manifest::from_value(manifest)?))
    }

    async fn round_trip(&self, msg: Message, id: String, timeout: Duration) -> Result<Value> {
        let channel = self.active_channel()?;
        let payload = MsgPackCodec::encode_message(&msg)?;

        let rx = self.inner.pending.register(&id)?;
        let _guard = PendingGuard::new(Arc::clone(&self.inner.pending), id);

        channel.post(payload);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) if res.is_error() => Err(ProxyError::Remote(res.res)),
            Ok(Ok(res)) => Ok(res.res),
            Ok(Err(_)) => Err(ProxyError::ChannelClosed),
            Err(_) => Err(ProxyError::RequestTimeout),
        }
    }

    fn active_channel(&self) -> Result<Arc<dyn Channel>> {
        match &*lock(&self.inner.state) {
            State::Active(conn) => Ok(Arc::clone(&conn.channel)),
            _ => Err(ProxyError::NotActive),
        }
    }

    fn teardown(&self) {
        let state = std::mem::replace(&mut *lock(&self.inner.state), State::Idle);
        if let State::Active(conn) = state {
            conn.close();
            let dropped = self.inner.pending.clear();
            tracing::debug!(url = %self.inner.url, dropped, "proxy stopped");
        }
    }
}

impl RequestSender for ServiceProxy {
    fn send_request(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, Result<Value>> {
        let proxy = self.clone();
        let method = method.to_string();
        Box::pin(async move { ServiceProxy::send_request(&proxy, &method, params).await })
    }
}

/// Steady state: route trusted responses to their pending calls.
async fn dispatch_responses(
    mut subscription: Subscription,
    url: String,
    trust: TrustPolicy,
    pending: Arc<PendingTable>,
) {
    while let Some(envelope) = subscription.recv().await {
        if !trust.accepts(&url, &envelope.origin) {
            tracing::trace!(origin = %envelope.origin, "dropping message from untrusted origin");
            continue;
        }

        let res = match MsgPackCodec::decode_message(&envelope.payload) {
            Ok(Message::Response(res)) => res,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("dropping undecodable message: {}", e);
                continue;
            }
        };

        let Some(id) = res.id.clone() else {
            continue;
        };
        if !pending.complete(&id, res) {
            tracing::trace!(id = %id, "dropping response with no pending call");
        }
    }
}
