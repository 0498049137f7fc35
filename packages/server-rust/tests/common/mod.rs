#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use switchboard_core::{parse_response, Reply};
use switchboard_server::backend::Handler;
use switchboard_server::transport::MemoryTransport;
use switchboard_server::{Backend, BackendConfig, Delivery, HandlerContext, MemoryBroker, Transport};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn config() -> BackendConfig {
    BackendConfig {
        namespace: "sb".to_string(),
        ..BackendConfig::default()
    }
}

pub async fn connect(broker: &MemoryBroker, config: BackendConfig) -> Backend {
    Backend::connect(config, Arc::new(broker.connect()), Arc::new(broker.lock_store()))
        .await
        .unwrap()
}

/// Handler that inserts `key: key` into an object body and answers `code`.
pub fn merging(key: &'static str, code: u16) -> impl Handler {
    move |ctx: HandlerContext| async move {
        let mut body = ctx.body().clone();
        if let Value::Object(map) = &mut body {
            map.insert(key.to_string(), json!(key));
        }
        ctx.respond(body, code);
        Ok(())
    }
}

/// A raw connection subscribed to `topic`. Keep the transport alive while
/// reading from the receiver.
pub async fn tap(broker: &MemoryBroker, topic: &str) -> (MemoryTransport, UnboundedReceiver<Delivery>) {
    let transport = broker.connect();
    transport.subscribe(topic).await.unwrap();
    let rx = transport.take_deliveries().unwrap();
    (transport, rx)
}

pub fn reply_of(delivery: &Delivery) -> Reply {
    let parsed = parse_response(&delivery.payload);
    Reply::new(parsed.data, parsed.code.unwrap_or(0))
}

pub async fn next_delivery(rx: &mut UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no delivery in time")
        .expect("tap closed")
}

pub fn keys(value: &Value) -> Vec<String> {
    let mut keys: Vec<String> = value
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();
    keys
}
