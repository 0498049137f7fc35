mod common;

use std::time::Duration;

use serde_json::{json, Value};
use switchboard_server::backend::Handler;
use switchboard_server::{
    BackendConfig, ErrorBroadcast, HandlerContext, MemoryBroker, RequestOptions, SubscriptionOptions,
};

use common::{connect, next_delivery, reply_of, tap};

fn config(broadcast_errors: ErrorBroadcast) -> BackendConfig {
    BackendConfig {
        broadcast_errors,
        ..common::config()
    }
}

fn sleeper(secs: u64) -> impl Handler {
    move |ctx: HandlerContext| async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        ctx.respond(json!({"slept": secs}), 200);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn handler_within_execution_timeout_succeeds() {
    let broker = MemoryBroker::new();
    let backend = connect(&broker, config(ErrorBroadcast::DefaultChannel)).await;
    backend
        .reply_to(
            "slow",
            SubscriptionOptions::default().with_timeout(Duration::from_secs(2)),
            sleeper(1),
        )
        .await
        .unwrap();

    let reply = backend.request(json!({}), "slow", RequestOptions::default()).await;
    assert_eq!(reply.code, 200);
    assert_eq!(reply.data, json!({"slept": 1}));
}

#[tokio::test(start_paused = true)]
async fn execution_timeout_answers_504_and_reports_once() {
    let broker = MemoryBroker::new();
    let (_errors_tap, mut errors) = tap(&broker, "sb.error").await;
    let backend = connect(&broker, config(ErrorBroadcast::DefaultChannel)).await;
    backend
        .reply_to(
            "slow",
            SubscriptionOptions::default().with_timeout(Duration::from_secs(2)),
            sleeper(4),
        )
        .await
        .unwrap();

    let reply = backend.request(json!({"job": 7}), "slow", RequestOptions::default()).await;
    assert_eq!(reply.code, 504);
    assert!(reply.data.as_str().unwrap().contains("timed out"));

    let report = reply_of(&next_delivery(&mut errors).await);
    assert_eq!(report.code, 504);
    assert_eq!(report.data["code"], json!(504));
    assert_eq!(report.data["topic"], json!("sb.request.slow"));
    assert_eq!(report.data["request_data"], json!({"job": 7}));
    assert_eq!(report.data["multi_process"], json!(false));

    // The handler finishing late must not answer or report again.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(errors.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn sender_timeout_is_499() {
    let broker = MemoryBroker::new();
    let backend = connect(&broker, config(ErrorBroadcast::Disabled)).await;
    backend
        .reply_to("slow", SubscriptionOptions::default(), sleeper(3))
        .await
        .unwrap();

    let reply = backend
        .request(json!({}), "slow", RequestOptions::default().with_timeout(Duration::from_secs(1)))
        .await;
    assert_eq!(reply.code, 499);
    assert_eq!(reply.data, Value::Null);
    assert_eq!(backend.pending_requests(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(backend.pending_requests(), 0);
}

#[tokio::test]
async fn handler_error_goes_to_the_configured_topic() {
    let broker = MemoryBroker::new();
    let (_errors_tap, mut errors) = tap(&broker, "ops.failures").await;
    let backend = connect(&broker, config(ErrorBroadcast::Topic("ops.failures".to_string()))).await;
    backend
        .reply_to("fail", SubscriptionOptions::default(), |_ctx: HandlerContext| async move {
            Err::<(), _>(anyhow::anyhow!("database unavailable"))
        })
        .await
        .unwrap();

    let reply = backend.request(json!({"id": 1}), "fail", RequestOptions::default()).await;
    assert_eq!(reply.code, 500);
    assert!(reply.data.as_str().unwrap().contains("database unavailable"));

    let report = reply_of(&next_delivery(&mut errors).await);
    assert_eq!(report.data["code"], json!(500));
    assert!(report.data["backtrace"].as_str().unwrap().contains("database unavailable"));
}

#[tokio::test]
async fn explicit_error_code_is_reported() {
    let broker = MemoryBroker::new();
    let (_errors_tap, mut errors) = tap(&broker, "sb.error").await;
    let backend = connect(&broker, config(ErrorBroadcast::DefaultChannel)).await;
    backend
        .reply_to("missing", SubscriptionOptions::default(), |ctx: HandlerContext| async move {
            ctx.respond(json!("no such record"), 404);
            Ok(())
        })
        .await
        .unwrap();
    backend
        .reply_to("fine", SubscriptionOptions::default(), |_ctx: HandlerContext| async move { Ok(()) })
        .await
        .unwrap();

    let reply = backend.request(json!({}), "fine", RequestOptions::default()).await;
    assert_eq!(reply.code, 200);
    let reply = backend.request(json!({}), "missing", RequestOptions::default()).await;
    assert_eq!(reply.code, 404);

    let report = reply_of(&next_delivery(&mut errors).await);
    assert_eq!(report.data["topic"], json!("sb.request.missing"));
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn panicking_handler_answers_500() {
    let broker = MemoryBroker::new();
    let backend = connect(&broker, config(ErrorBroadcast::Disabled)).await;
    backend
        .reply_to("boom", SubscriptionOptions::default(), |ctx: HandlerContext| async move {
            if ctx.body().is_object() {
                panic!("handler exploded");
            }
            Ok(())
        })
        .await
        .unwrap();

    let reply = backend.request(json!({}), "boom", RequestOptions::default()).await;
    assert_eq!(reply.code, 500);
    assert!(reply.data.as_str().unwrap().contains("handler exploded"));
}
