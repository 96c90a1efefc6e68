//! Proxy round trip over an in-process channel pair.
//!
//! Run with `RUST_LOG=service_proxy=debug cargo run --example roundtrip`
//! to see the library's lifecycle logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use service_proxy::interface::{InterfaceDecl, Member};
use service_proxy::proxy::fixed_channel;
use service_proxy::{Fault, MemoryChannel, ProxyListener, ServiceProxy, ServiceRegistry};
use tracing_subscriber::EnvFilter;

static MOCK_SERVICE: InterfaceDecl = InterfaceDecl {
    name: "MockService",
    members: &[
        Member::Method("mockMethod"),
        Member::Method("throwSyncMethod"),
        Member::Method("throwAsyncMethod"),
    ],
    base: None,
};

fn mock_service() -> ServiceRegistry {
    ServiceRegistry::new()
        .method("mockMethod", |params: Vec<Value>| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Fault>(params.into_iter().next().unwrap_or(Value::Null))
        })
        .method("throwSyncMethod", |_: ()| async {
            Err::<(), _>(Fault::from("wonderful error"))
        })
        .method("throwAsyncMethod", |_: ()| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err::<(), _>(Fault::from("wonderful async error"))
        })
}

/// Service side: listen, and refuse the first stop request.
fn start_listener(channel: MemoryChannel, host_origin: &str) -> ProxyListener<ServiceRegistry> {
    let listener = ProxyListener::new(mock_service(), host_origin, channel);

    let refused = Arc::new(AtomicBool::new(false));
    listener.add_stop_canceller(move || {
        let veto = !refused.swap(true, Ordering::SeqCst);
        async move { veto.then(|| json!({"reason": "still busy"})) }
    });
    listener.set_on_stop(|| async { json!({"goodbye": "see you"}) });

    listener
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (host, frame) = MemoryChannel::pair("https://host.app", "https://frame.app");
    let listener = start_listener(frame, "https://host.app");

    let proxy = ServiceProxy::builder("https://frame.app", fixed_channel(host.clone())).build();
    let init = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.init().await }
    });
    while host.subscriber_count() == 0 {
        tokio::task::yield_now().await;
    }
    listener.listen(Some(json!({"initial": "hello"})))?;

    let payload = init.await??;
    println!("service proxy created! received value: {}", payload["initial"]);

    let mock = proxy.wrap_with(&MOCK_SERVICE);

    println!("invoking method with no params...");
    println!("result: {}", mock.call("mockMethod", vec![]).await?);

    println!("invoking method with primitive...");
    println!("result: {}", mock.call("mockMethod", vec![json!(42)]).await?);

    println!("invoking method with object...");
    let result = mock
        .call("mockMethod", vec![json!({"success": "great"})])
        .await?;
    println!("result: {}", result);

    for name in ["throwSyncMethod", "throwAsyncMethod"] {
        println!("invoking {}...", name);
        if let Err(e) = mock.call(name, vec![]).await {
            println!("threw: {}", e);
        }
    }

    println!("trying to stop the proxy, expecting a refusal...");
    if let Err(e) = proxy.stop(false).await {
        println!("stop refused: {}", e);
    }

    println!("stopping for real...");
    let goodbye = proxy.stop(false).await?;
    println!("service proxy stopped! received value: {}", goodbye["goodbye"]);

    Ok(())
}
