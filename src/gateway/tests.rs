//! Tests for the event fan-out gateway.

use super::*;
use crate::bus::BroadcastBus;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn open_gateway() -> Arc<EventFanOutGateway> {
    Arc::new(EventFanOutGateway::new(Arc::new(
        StaticTokenAuthenticator::new(None),
    )))
}

async fn connect(
    gateway: &EventFanOutGateway,
    id: &str,
) -> (Arc<ChannelListener>, UnboundedReceiver<PushedEvent>) {
    let (listener, rx) = ChannelListener::new(id);
    gateway
        .on_connect(listener.clone(), "")
        .await
        .expect("connect should succeed");
    (listener, rx)
}

async fn recv(rx: &mut UnboundedReceiver<PushedEvent>) -> PushedEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event within timeout")
        .expect("channel open")
}

#[tokio::test]
async fn test_dispatch_reaches_only_the_tasks_subscribers() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;
    let (_b, mut rx_b) = connect(&gateway, "b").await;

    gateway.subscribe("a", "task-1").await;
    gateway.subscribe("b", "task-2").await;
    // Drain the subscription acks
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");
    assert_eq!(recv(&mut rx_b).await.event, "subscribed");

    gateway
        .dispatch("task-1", "progress", json!({"message": "working"}))
        .await;

    let event = recv(&mut rx_a).await;
    assert_eq!(event.event, "progress");
    assert_eq!(event.payload["message"], json!("working"));
    // Payload is annotated with the task id and a server timestamp
    assert_eq!(event.payload["taskId"], json!("task-1"));
    assert!(event.payload["timestamp"].is_string());

    // b subscribed to a different task and sees nothing
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn test_dispatch_without_subscribers_is_dropped() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;

    gateway
        .dispatch("task-1", "progress", json!({"message": "nobody listening"}))
        .await;

    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_subscribe_is_idempotent() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;

    gateway.subscribe("a", "task-1").await;
    gateway.subscribe("a", "task-1").await;
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");
    assert_eq!(gateway.subscriber_count("task-1").await, 1);

    gateway.dispatch("task-1", "progress", json!({})).await;
    // Exactly one delivery despite the duplicate subscribe
    assert_eq!(recv(&mut rx_a).await.event, "progress");
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_subscribe_from_unknown_listener_is_ignored() {
    let gateway = open_gateway();
    gateway.subscribe("ghost", "task-1").await;
    assert_eq!(gateway.subscriber_count("task-1").await, 0);
}

#[tokio::test]
async fn test_disconnect_removes_all_subscriptions() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;
    gateway.subscribe("a", "task-1").await;
    gateway.subscribe("a", "task-2").await;
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");

    gateway.on_disconnect("a").await;

    assert_eq!(gateway.subscriber_count("task-1").await, 0);
    assert_eq!(gateway.subscriber_count("task-2").await, 0);
    // Dispatch after disconnect delivers nothing
    gateway.dispatch("task-1", "progress", json!({})).await;
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_only_affects_that_task() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;
    gateway.subscribe("a", "task-1").await;
    gateway.subscribe("a", "task-2").await;
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");

    gateway.unsubscribe("a", "task-1").await;
    assert_eq!(recv(&mut rx_a).await.event, "unsubscribed");

    assert_eq!(gateway.subscriber_count("task-1").await, 0);
    assert_eq!(gateway.subscriber_count("task-2").await, 1);
}

#[tokio::test]
async fn test_failed_push_drops_listener_without_aborting_others() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;
    let (_b, rx_b) = connect(&gateway, "b").await;
    gateway.subscribe("a", "task-1").await;
    gateway.subscribe("b", "task-1").await;
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");

    // Dropping b's receiver makes its next push fail
    drop(rx_b);

    gateway.dispatch("task-1", "progress", json!({"n": 1})).await;

    // a still got the event; b was disconnected by the failed push
    assert_eq!(recv(&mut rx_a).await.event, "progress");
    assert_eq!(gateway.subscriber_count("task-1").await, 1);

    gateway.dispatch("task-1", "progress", json!({"n": 2})).await;
    assert_eq!(recv(&mut rx_a).await.event, "progress");
}

#[tokio::test]
async fn test_broadcast_reaches_every_connected_listener() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;
    let (_b, mut rx_b) = connect(&gateway, "b").await;
    // No subscriptions at all; broadcast ignores them
    gateway.broadcast("announcement", json!({"message": "hi"})).await;

    assert_eq!(recv(&mut rx_a).await.event, "announcement");
    assert_eq!(recv(&mut rx_b).await.event, "announcement");
}

#[tokio::test]
async fn test_failed_auth_registers_nothing() {
    let gateway = Arc::new(EventFanOutGateway::new(Arc::new(
        StaticTokenAuthenticator::new(Some("secret".to_string())),
    )));
    let (listener, mut rx) = ChannelListener::new("a");

    let result = gateway.on_connect(listener.clone(), "wrong").await;
    assert!(result.is_err());

    // The listener saw an error event and was closed
    let event = recv(&mut rx).await;
    assert_eq!(event.event, "error");
    assert!(listener.push("x", json!({})).await.is_err());

    // It never registered, so its subscribe is ignored
    gateway.subscribe("a", "task-1").await;
    assert_eq!(gateway.subscriber_count("task-1").await, 0);
}

#[tokio::test]
async fn test_correct_token_is_accepted() {
    let gateway = Arc::new(EventFanOutGateway::new(Arc::new(
        StaticTokenAuthenticator::new(Some("secret".to_string())),
    )));
    let (listener, _rx) = ChannelListener::new("a");
    gateway
        .on_connect(listener, "secret")
        .await
        .expect("matching token accepted");
}

#[tokio::test]
async fn test_bridge_relays_bus_topics_to_subscribers() {
    let gateway = open_gateway();
    let bus = BroadcastBus::new();
    gateway.bridge_bus(&bus).await.expect("bridge");

    let (_a, mut rx_a) = connect(&gateway, "a").await;
    gateway.subscribe("a", "task-1").await;
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");

    bus.publish(
        TASK_PROGRESS_TOPIC,
        json!({"taskId": "task-1", "message": "halfway", "progress": 50}),
    )
    .await
    .expect("publish");

    let event = recv(&mut rx_a).await;
    assert_eq!(event.event, "progress");
    assert_eq!(event.payload["message"], json!("halfway"));

    bus.publish(
        WORKFLOW_EVENTS_TOPIC,
        json!({"taskId": "task-1", "type": "STATE_TRANSITION"}),
    )
    .await
    .expect("publish");

    let event = recv(&mut rx_a).await;
    assert_eq!(event.event, "state-change");
    assert_eq!(event.payload["type"], json!("STATE_TRANSITION"));
}

#[tokio::test]
async fn test_publish_time_timestamp_survives_dispatch() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;
    gateway.subscribe("a", "task-1").await;
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");

    gateway
        .dispatch(
            "task-1",
            "progress",
            json!({"message": "working", "timestamp": "2026-01-02T03:04:05Z"}),
        )
        .await;

    // The timestamp set at publish time wins over the dispatch-time one
    let event = recv(&mut rx_a).await;
    assert_eq!(event.payload["timestamp"], json!("2026-01-02T03:04:05Z"));
}

#[tokio::test]
async fn test_non_object_payload_is_wrapped() {
    let gateway = open_gateway();
    let (_a, mut rx_a) = connect(&gateway, "a").await;
    gateway.subscribe("a", "task-1").await;
    assert_eq!(recv(&mut rx_a).await.event, "subscribed");

    gateway.dispatch("task-1", "progress", json!("plain text")).await;

    let event = recv(&mut rx_a).await;
    assert_eq!(event.payload["data"], json!("plain text"));
    assert_eq!(event.payload["taskId"], json!("task-1"));
}
