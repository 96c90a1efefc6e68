//! Service listener - the serving side of a proxy.
//!
//! A [`ProxyListener`] owns a [`Service`] and answers requests arriving on a
//! [`Channel`]. Its lifecycle:
//!
//! 1. `listen` subscribes and broadcasts a `Listening` response
//! 2. each trusted request is dispatched to the service in its own task,
//!    bounded by a semaphore, and answered exactly once
//! 3. a `StopListening` request runs the stop cancellers; if none vetoes,
//!    the listener unsubscribes, runs the `on_stop` hook and confirms
//!
//! # Example
//!
//! ```ignore
//! let listener = ProxyListener::builder(registry, "https://host.app", channel)
//!     .max_concurrent_handlers(64)
//!     .build();
//!
//! listener.add_stop_canceller(|| async { None });
//! listener.set_on_stop(|| async { json!({"goodbye": "bye"}) });
//! listener.listen(Some(json!({"version": 1})))?;
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::codec::MsgPackCodec;
use crate::error::{ProxyError, Result};
use crate::lock;
use crate::protocol::{Message, Request, Response, Signal, SignalRequest, TrustPolicy};
use crate::service::{BoxFuture, Fault, Service};
use crate::transport::{Channel, Subscription, SubscriptionId};

/// Default maximum concurrent handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Stop check. `Some(reason)` vetoes the stop and `reason` is sent back.
type StopCanceller = Arc<dyn Fn() -> BoxFuture<'static, Option<Value>> + Send + Sync>;

/// Produces the payload of the stop confirmation.
type StopHook = Arc<dyn Fn() -> BoxFuture<'static, Value> + Send + Sync>;

/// Builder for a [`ProxyListener`].
pub struct ProxyListenerBuilder<S> {
    service: S,
    origin: String,
    channel: Arc<dyn Channel>,
    trust: TrustPolicy,
    max_concurrent_handlers: usize,
}

impl<S: Service> ProxyListenerBuilder<S> {
    /// How inbound sender addresses are matched against the origin.
    pub fn trust_policy(mut self, trust: TrustPolicy) -> Self {
        self.trust = trust;
        self
    }

    /// Set the maximum number of requests handled at once.
    ///
    /// Further requests wait for a free slot; none are dropped.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.max_concurrent_handlers = limit;
        self
    }

    /// Finish configuration. The listener starts idle; call
    /// [`ProxyListener::listen`] to start serving.
    pub fn build(self) -> ProxyListener<S> {
        ProxyListener {
            inner: Arc::new(Shared {
                service: self.service,
                origin: self.origin,
                channel: self.channel,
                trust: self.trust,
                semaphore: Arc::new(Semaphore::new(self.max_concurrent_handlers)),
                session: Mutex::new(None),
                cancellers: Mutex::new(Vec::new()),
                on_stop: Mutex::new(None),
            }),
        }
    }
}

/// A live subscription and the task draining it.
struct Session {
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

struct Shared<S> {
    service: S,
    origin: String,
    channel: Arc<dyn Channel>,
    trust: TrustPolicy,
    semaphore: Arc<Semaphore>,
    session: Mutex<Option<Session>>,
    cancellers: Mutex<Vec<StopCanceller>>,
    on_stop: Mutex<Option<StopHook>>,
}

impl<S> Shared<S> {
    /// Returns `false` if not listening.
    fn close_session(&self) -> bool {
        let Some(session) = lock(&self.session).take() else {
            return false;
        };
        session.task.abort();
        self.channel.unsubscribe(session.subscription);
        true
    }

    fn reply(&self, response: Response) {
        match MsgPackCodec::encode_message(&Message::Response(response)) {
            Ok(payload) => self.channel.post(payload),
            Err(e) => tracing::error!("failed to encode response: {}", e),
        }
    }
}

impl<S> Drop for Shared<S> {
    fn drop(&mut self) {
        self.close_session();
    }
}

impl<S: Service> Shared<S> {
    async fn handle(self: Arc<Self>, payload: Bytes) {
        match MsgPackCodec::decode_message(&payload) {
            Ok(Message::Request(req)) => self.handle_request(req).await,
            Ok(Message::Signal(sig)) => self.handle_signal(sig).await,
            Ok(Message::Response(res)) => {
                tracing::debug!(id = ?res.id, "response received by listener");
                self.reply(invalid_format(res.id));
            }
            Err(e) => {
                tracing::warn!("undecodable request: {}", e);
                self.reply(invalid_format(None));
            }
        }
    }

    async fn handle_request(self: Arc<Self>, req: Request) {
        let (id, method) = match req.validate() {
            Ok((id, method)) => (id.to_string(), method.to_string()),
            Err(_) => {
                tracing::debug!(id = ?req.id, "rejecting malformed request");
                self.reply(invalid_format(req.id));
                return;
            }
        };
        let params = req.params.unwrap_or_default();

        // Run the method in its own task so a panic becomes a fault.
        let call = {
            let shared = Arc::clone(&self);
            let method = method.clone();
            tokio::spawn(async move { shared.service.call(&method, params).await })
        };

        let response = match call.await {
            Ok(Ok(res)) => Response::result(id, res),
            Ok(Err(fault)) => {
                tracing::debug!(%id, %method, %fault, "method failed");
                Response::error(Some(id), fault.into_value())
            }
            Err(e) => {
                tracing::error!(%id, %method, "method task failed: {}", e);
                let fault = Fault::from(format!("method {} panicked", method));
                Response::error(Some(id), fault.into_value())
            }
        };

        self.reply(response);
    }

    async fn handle_signal(&self, sig: SignalRequest) {
        match sig.signal {
            Signal::StopListening => self.handle_stop(sig.id).await,
            other => {
                tracing::trace!(id = %sig.id, signal = ?other, "ignoring signal request")
            }
        }
    }

    async fn handle_stop(&self, id: String) {
        let cancellers: Vec<StopCanceller> = lock(&self.cancellers).clone();
        for canceller in cancellers {
            if let Some(reason) = canceller().await {
                tracing::debug!(%id, "stop vetoed");
                self.reply(Response::error(Some(id), reason));
                return;
            }
        }

        self.close_session();

        let hook = lock(&self.on_stop).clone();
        let res = match hook {
            Some(hook) => hook().await,
            None => Value::Null,
        };

        tracing::debug!(origin = %self.origin, "stopped listening");
        self.reply(Response::signal(Some(id), Signal::StopListening, res));
    }
}

fn invalid_format(id: Option<String>) -> Response {
    Response::error(id, Value::String(ProxyError::InvalidFormat.to_string()))
}

/// Pull envelopes off the subscription and hand trusted ones to handler tasks.
async fn dispatch_loop<S: Service>(
    shared: Weak<Shared<S>>,
    mut subscription: Subscription,
    semaphore: Arc<Semaphore>,
) {
    while let Some(envelope) = subscription.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        if !shared.trust.accepts(&shared.origin, &envelope.origin) {
            tracing::trace!(origin = %envelope.origin, "dropping message from untrusted origin");
            continue;
        }

        // Wait for capacity; requests are never dropped.
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        tokio::spawn(async move {
            // Permit is held until this task completes
            let _permit = permit;
            shared.handle(envelope.payload).await;
        });
    }
}

/// Serves one [`Service`] over a channel. Cheap to clone; clones share state.
pub struct ProxyListener<S> {
    inner: Arc<Shared<S>>,
}

impl<S> Clone for ProxyListener<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Service> ProxyListener<S> {
    /// Start configuring a listener that trusts `origin` and replies on `channel`.
    pub fn builder(
        service: S,
        origin: impl Into<String>,
        channel: impl Channel,
    ) -> ProxyListenerBuilder<S> {
        ProxyListenerBuilder {
            service,
            origin: origin.into(),
            channel: Arc::new(channel),
            trust: TrustPolicy::default(),
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }

    /// Listener with default settings.
    pub fn new(service: S, origin: impl Into<String>, channel: impl Channel) -> Self {
        Self::builder(service, origin, channel).build()
    }

    /// The trusted peer address.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Whether a `listen` is in effect (no successful stop since).
    pub fn is_listening(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    /// The served instance.
    pub fn service(&self) -> &S {
        &self.inner.service
    }

    /// Subscribe and announce `Listening` with `payload`. No-op if already
    /// listening.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, since the dispatch loop is
    /// spawned onto the current one.
    pub fn listen(&self, payload: Option<Value>) -> Result<()> {
        let mut session = lock(&self.inner.session);
        if session.is_some() {
            return Ok(());
        }

        let announce = MsgPackCodec::encode_message(&Message::Response(Response::signal(
            None,
            Signal::Listening,
            payload.unwrap_or(Value::Null),
        )))?;

        let subscription = self.inner.channel.subscribe();
        let subscription_id = subscription.id();
        let task = tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            subscription,
            Arc::clone(&self.inner.semaphore),
        ));
        *session = Some(Session {
            subscription: subscription_id,
            task,
        });
        drop(session);

        self.inner.channel.post(announce);
        tracing::debug!(origin = %self.inner.origin, "listening");
        Ok(())
    }

    /// Stop locally, without telling the peer.
    pub fn stop_listen(&self) {
        if self.inner.close_session() {
            tracing::debug!(origin = %self.inner.origin, "stopped listening");
        }
    }

    /// Append a stop check. Checks run in the order they were added; the
    /// first to return `Some(reason)` vetoes the stop.
    ///
    /// Any `Some` is a veto, including `Some(Value::Null)` or
    /// `Some(json!(false))`; return `None` to let the stop proceed.
    pub fn add_stop_canceller<F, Fut>(&self, canceller: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Value>> + Send + 'static,
    {
        let canceller: StopCanceller =
            Arc::new(move || -> BoxFuture<'static, Option<Value>> { Box::pin(canceller()) });
        lock(&self.inner.cancellers).push(canceller);
    }

    /// Remove every stop check; later stops always succeed.
    pub fn clear_stop_cancellers(&self) {
        lock(&self.inner.cancellers).clear();
    }

    /// Set the hook whose value is sent with the stop confirmation.
    pub fn set_on_stop<F, Fut>(&self, hook: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let hook: StopHook = Arc::new(move || -> BoxFuture<'static, Value> { Box::pin(hook()) });
        *lock(&self.inner.on_stop) = Some(hook);
    }

    /// Remove the hook; stop confirmations then carry `null`.
    pub fn clear_on_stop(&self) {
        *lock(&self.inner.on_stop) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceRegistry, ServiceResult};
    use crate::transport::MemoryChannel;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const HOST: &str = "https://host.test";
    const FRAME: &str = "https://frame.test";

    /// Counts how often the service is actually invoked.
    struct Counting {
        registry: ServiceRegistry,
        calls: Arc<AtomicUsize>,
    }

    impl Service for Counting {
        fn call(&self, method: &str, params: Vec<Value>) -> BoxFuture<'static, ServiceResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.registry.call(method, params)
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new()
            .method("echo", |params: Vec<Value>| async move { Ok::<_, Fault>(params) })
            .method("fail", |_: ()| async { Err::<(), _>(Fault::from("wonderful error")) })
            .method("slow", |_: ()| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, Fault>("done")
            })
            .method("explode", |_: ()| async {
                if true {
                    panic!("boom");
                }
                Ok::<_, Fault>(())
            })
    }

    struct Harness {
        listener: ProxyListener<Counting>,
        calls: Arc<AtomicUsize>,
        /// The listener's end of the channel.
        frame: MemoryChannel,
        /// The caller's end, driven by hand.
        host: MemoryChannel,
        /// Everything the listener posts.
        inbox: Subscription,
    }

    fn harness_with(
        configure: impl FnOnce(ProxyListenerBuilder<Counting>) -> ProxyListenerBuilder<Counting>,
    ) -> Harness {
        let (host, frame) = MemoryChannel::pair(HOST, FRAME);
        let calls = Arc::new(AtomicUsize::new(0));
        let service = Counting {
            registry: registry(),
            calls: calls.clone(),
        };
        let listener = configure(ProxyListener::builder(service, HOST, frame.clone())).build();
        let inbox = host.subscribe();
        Harness {
            listener,
            calls,
            frame,
            host,
            inbox,
        }
    }

    fn harness() -> Harness {
        harness_with(|b| b)
    }

    fn post(channel: &MemoryChannel, msg: Message) {
        channel.post(MsgPackCodec::encode_message(&msg).unwrap());
    }

    async fn next_response(inbox: &mut Subscription) -> Response {
        let envelope = inbox.recv().await.unwrap();
        assert_eq!(envelope.origin, FRAME);
        match MsgPackCodec::decode_message(&envelope.payload).unwrap() {
            Message::Response(res) => res,
            other => panic!("expected response, got {other:?}"),
        }
    }

    async fn listening(h: &mut Harness) {
        h.listener.listen(None).unwrap();
        let res = next_response(&mut h.inbox).await;
        assert!(res.is_signal(Signal::Listening));
    }

    #[tokio::test]
    async fn test_listen_is_idempotent() {
        let mut h = harness();
        assert!(!h.listener.is_listening());

        h.listener.listen(Some(json!({"ready": true}))).unwrap();
        h.listener.listen(Some(json!({"again": true}))).unwrap();

        assert!(h.listener.is_listening());
        assert_eq!(h.frame.subscriber_count(), 1);

        let res = next_response(&mut h.inbox).await;
        assert_eq!(res, Response::signal(None, Signal::Listening, json!({"ready": true})));

        // The next message is the echo, not a second announcement.
        post(&h.host, Message::request("1", "echo", vec![json!("x")]));
        assert_eq!(next_response(&mut h.inbox).await, Response::result("1", json!(["x"])));
    }

    #[tokio::test]
    async fn test_request_is_answered_with_result() {
        let mut h = harness();
        listening(&mut h).await;

        post(
            &h.host,
            Message::request("7", "echo", vec![json!(1), json!({"success": "great"})]),
        );

        let res = next_response(&mut h.inbox).await;
        assert_eq!(res, Response::result("7", json!([1, {"success": "great"}])));
    }

    #[tokio::test]
    async fn test_fault_is_answered_with_error() {
        let mut h = harness();
        listening(&mut h).await;

        post(&h.host, Message::request("2", "fail", vec![]));

        let res = next_response(&mut h.inbox).await;
        assert_eq!(res, Response::error(Some("2".into()), json!("wonderful error")));
    }

    #[tokio::test]
    async fn test_malformed_request_never_reaches_service() {
        let mut h = harness();
        listening(&mut h).await;

        post(
            &h.host,
            Message::Request(Request {
                id: Some("3".into()),
                method_name: None,
                params: None,
            }),
        );

        let res = next_response(&mut h.inbox).await;
        assert_eq!(
            res,
            Response::error(Some("3".into()), json!("proxy request in invalid format"))
        );
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_undecodable_and_response_shaped_input() {
        let mut h = harness();
        listening(&mut h).await;

        h.host.post(Bytes::from_static(b"\xc1"));
        let res = next_response(&mut h.inbox).await;
        assert_eq!(res, Response::error(None, json!("proxy request in invalid format")));

        post(&h.host, Message::Response(Response::result("4", json!(0))));
        let res = next_response(&mut h.inbox).await;
        assert_eq!(
            res,
            Response::error(Some("4".into()), json!("proxy request in invalid format"))
        );

        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_untrusted_sender_is_ignored() {
        let mut h = harness();
        listening(&mut h).await;

        let msg = Message::request("evil", "echo", vec![]);
        h.host
            .post_as("https://not-origin.test", MsgPackCodec::encode_message(&msg).unwrap());
        post(&h.host, Message::request("good", "echo", vec![]));

        let res = next_response(&mut h.inbox).await;
        assert_eq!(res.id.as_deref(), Some("good"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_method_becomes_fault() {
        let mut h = harness();
        listening(&mut h).await;

        post(&h.host, Message::request("5", "explode", vec![]));

        let res = next_response(&mut h.inbox).await;
        assert!(res.is_error());
        assert_eq!(res.id.as_deref(), Some("5"));
        assert_eq!(res.res, json!("method explode panicked"));
        assert!(h.listener.is_listening());
    }

    #[tokio::test]
    async fn test_stop_without_cancellers() {
        let mut h = harness();
        listening(&mut h).await;

        post(&h.host, Message::signal("s1", Signal::StopListening));

        let res = next_response(&mut h.inbox).await;
        assert_eq!(
            res,
            Response::signal(Some("s1".into()), Signal::StopListening, Value::Null)
        );
        assert!(!h.listener.is_listening());
        assert_eq!(h.frame.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_vetoed_stop_then_success() {
        let mut h = harness();
        listening(&mut h).await;

        let vetoed = Arc::new(AtomicBool::new(false));
        h.listener.add_stop_canceller({
            let vetoed = vetoed.clone();
            move || {
                let first = !vetoed.swap(true, Ordering::SeqCst);
                async move { first.then(|| json!("Do not stop!")) }
            }
        });
        h.listener.set_on_stop(|| async { json!({"goodbye": "bye"}) });

        post(&h.host, Message::signal("s1", Signal::StopListening));
        let res = next_response(&mut h.inbox).await;
        assert_eq!(res, Response::error(Some("s1".into()), json!("Do not stop!")));
        assert!(h.listener.is_listening());

        post(&h.host, Message::signal("s2", Signal::StopListening));
        let res = next_response(&mut h.inbox).await;
        assert_eq!(
            res,
            Response::signal(Some("s2".into()), Signal::StopListening, json!({"goodbye": "bye"}))
        );
        assert!(!h.listener.is_listening());
    }

    #[tokio::test]
    async fn test_first_veto_wins() {
        let mut h = harness();
        listening(&mut h).await;

        let later_runs = Arc::new(AtomicUsize::new(0));
        h.listener.add_stop_canceller(|| async { None });
        h.listener.add_stop_canceller(|| async { Some(json!("first")) });
        h.listener.add_stop_canceller({
            let later_runs = later_runs.clone();
            move || {
                later_runs.fetch_add(1, Ordering::SeqCst);
                async { Some(json!("second")) }
            }
        });

        post(&h.host, Message::signal("s1", Signal::StopListening));

        let res = next_response(&mut h.inbox).await;
        assert_eq!(res.res, json!("first"));
        assert_eq!(later_runs.load(Ordering::SeqCst), 0);

        h.listener.clear_stop_cancellers();
        post(&h.host, Message::signal("s2", Signal::StopListening));
        assert!(next_response(&mut h.inbox).await.is_signal(Signal::StopListening));
    }

    #[tokio::test]
    async fn test_cleared_on_stop_sends_null() {
        let mut h = harness();
        listening(&mut h).await;

        h.listener.set_on_stop(|| async { json!("unused") });
        h.listener.clear_on_stop();
        post(&h.host, Message::signal("s1", Signal::StopListening));

        assert_eq!(next_response(&mut h.inbox).await.res, Value::Null);
    }

    #[tokio::test]
    async fn test_other_signals_are_ignored() {
        let mut h = harness();
        listening(&mut h).await;

        post(&h.host, Message::signal("a", Signal::Listening));
        post(&h.host, Message::signal("b", Signal::Error));
        post(&h.host, Message::request("c", "echo", vec![]));

        let res = next_response(&mut h.inbox).await;
        assert_eq!(res.id.as_deref(), Some("c"));
        assert!(h.listener.is_listening());
    }

    #[tokio::test]
    async fn test_unknown_signal_is_ignored() {
        let mut h = harness();
        listening(&mut h).await;

        let raw = json!({"kind": "signal", "id": "s9", "signal": 903});
        h.host.post(MsgPackCodec::encode(&raw).unwrap().into());
        post(&h.host, Message::request("after", "echo", vec![]));

        let res = next_response(&mut h.inbox).await;
        assert_eq!(res, Response::result("after", json!([])));
        assert!(h.listener.is_listening());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falsy_some_still_vetoes() {
        let mut h = harness();
        listening(&mut h).await;

        h.listener.add_stop_canceller(|| async { Some(json!(false)) });
        post(&h.host, Message::signal("s1", Signal::StopListening));

        let res = next_response(&mut h.inbox).await;
        assert_eq!(res, Response::error(Some("s1".into()), json!(false)));
        assert!(h.listener.is_listening());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_awaits_deferred_canceller_and_hook() {
        let mut h = harness();
        listening(&mut h).await;

        h.listener.add_stop_canceller(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            None
        });
        h.listener.set_on_stop(|| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            json!("drained")
        });

        let start = Instant::now();
        post(&h.host, Message::signal("s1", Signal::StopListening));

        let res = next_response(&mut h.inbox).await;
        assert_eq!(
            res,
            Response::signal(Some("s1".into()), Signal::StopListening, json!("drained"))
        );
        assert_eq!(start.elapsed(), Duration::from_millis(80));
        assert!(!h.listener.is_listening());
    }

    #[test]
    #[should_panic]
    fn test_listen_outside_runtime_panics() {
        let h = harness();
        let _ = h.listener.listen(None);
    }

    #[tokio::test]
    async fn test_stop_listen_is_silent_and_relisten_announces() {
        let mut h = harness();
        listening(&mut h).await;

        h.listener.stop_listen();
        assert!(!h.listener.is_listening());
        assert_eq!(h.frame.subscriber_count(), 0);

        h.listener.listen(Some(json!(2))).unwrap();
        let res = next_response(&mut h.inbox).await;
        assert_eq!(res, Response::signal(None, Signal::Listening, json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_wait_for_handler_capacity() {
        let mut h = harness_with(|b| b.max_concurrent_handlers(1));
        listening(&mut h).await;

        let start = Instant::now();
        post(&h.host, Message::request("1", "slow", vec![]));
        post(&h.host, Message::request("2", "slow", vec![]));

        let first = next_response(&mut h.inbox).await;
        let second = next_response(&mut h.inbox).await;

        assert_eq!(first, Response::result("1", json!("done")));
        assert_eq!(second, Response::result("2", json!("done")));
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_dropping_listener_unsubscribes() {
        let mut h = harness();
        listening(&mut h).await;
        assert_eq!(h.frame.subscriber_count(), 1);

        drop(h.listener);

        assert_eq!(h.frame.subscriber_count(), 0);
    }
}
