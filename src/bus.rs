//! Internal event bus: topic-keyed publish/subscribe decoupling the
//! orchestrator from live subscribers.
//!
//! A transition is published here after durable persistence, so it is
//! recorded even when no listener is connected. `BroadcastBus` is the
//! in-process implementation, one `tokio::sync::broadcast` channel per
//! topic; per-topic publish order is preserved, handler errors are logged
//! and never retried.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tokio::sync::RwLock;

use crate::workflow::errors::WorkflowError;

/// Topic the state machine publishes `STATE_TRANSITION` events on.
pub const WORKFLOW_EVENTS_TOPIC: &str = "workflow-events";
/// Topic the orchestrator publishes human-readable progress on.
pub const TASK_PROGRESS_TOPIC: &str = "task-progress";

/// One message on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
}

/// Handler invoked for every message on a subscribed topic.
pub type BusHandler = Box<dyn Fn(BusMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a message; a topic with no subscribers drops it.
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), WorkflowError>;

    /// Registers a handler for a topic. The group id only disambiguates
    /// consumers in logs; the in-process bus has no consumer groups.
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: BusHandler,
    ) -> Result<(), WorkflowError>;
}

const TOPIC_CAPACITY: usize = 256;

/// In-process bus over per-topic broadcast channels.
#[derive(Default)]
pub struct BroadcastBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(tx) = self.topics.read().await.get(topic) {
            return tx.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), WorkflowError> {
        let tx = self.sender_for(topic).await;
        // send only fails when there is no receiver; that is the documented
        // drop case, not an error.
        let _ = tx.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        handler: BusHandler,
    ) -> Result<(), WorkflowError> {
        let mut rx = self.sender_for(topic).await.subscribe();
        let topic = topic.to_string();
        let group = group_id.to_string();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if let Err(e) = handler(message).await {
                            tracing::warn!(
                                topic = %topic,
                                group = %group,
                                "bus handler failed: {:#}",
                                e
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(topic = %topic, group = %group, missed, "bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }
}
