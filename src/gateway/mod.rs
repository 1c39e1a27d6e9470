//! Event fan-out gateway: delivers events to exactly the listeners
//! subscribed to a task.
//!
//! The subscription registry is owned by the gateway instance (constructed
//! at service start, injected where needed) rather than living in a module
//! global, so it can be unit-tested in isolation and replaced by a
//! distributed registry if the gateway is scaled out. Delivery is
//! at-most-once and best-effort: an event dispatched to a task with no
//! subscribers is dropped, and a late subscriber misses prior events.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use crate::bus::{BusMessage, EventBus, TASK_PROGRESS_TOPIC, WORKFLOW_EVENTS_TOPIC};
use crate::workflow::errors::WorkflowError;

pub type ListenerId = String;

/// Identity established by a successful authentication.
#[derive(Debug, Clone)]
pub struct ListenerIdentity {
    pub subject: String,
}

/// The live transport side of one connected listener.
#[async_trait]
pub trait ListenerTransport: Send + Sync {
    fn id(&self) -> &str;
    async fn push(&self, event: &str, payload: Value) -> anyhow::Result<()>;
    async fn close(&self);
}

/// External credential validation; a failed connection registers nothing.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &str) -> anyhow::Result<ListenerIdentity>;
}

/// Shared-token authenticator; with no token configured every connection
/// is accepted.
pub struct StaticTokenAuthenticator {
    token: Option<String>,
}

impl StaticTokenAuthenticator {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credentials: &str) -> anyhow::Result<ListenerIdentity> {
        match &self.token {
            Some(expected) if expected != credentials => {
                anyhow::bail!("invalid credentials")
            }
            _ => Ok(ListenerIdentity {
                subject: "listener".to_string(),
            }),
        }
    }
}

pub struct EventFanOutGateway {
    auth: Arc<dyn Authenticator>,
    listeners: RwLock<HashMap<ListenerId, Arc<dyn ListenerTransport>>>,
    subscriptions: RwLock<HashMap<String, HashSet<ListenerId>>>,
}

impl EventFanOutGateway {
    pub fn new(auth: Arc<dyn Authenticator>) -> Self {
        Self {
            auth,
            listeners: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Validates credentials and records the listener. On auth failure the
    /// listener gets an error event, is forcibly closed, and registers no
    /// subscription state.
    pub async fn on_connect(
        &self,
        listener: Arc<dyn ListenerTransport>,
        credentials: &str,
    ) -> anyhow::Result<()> {
        match self.auth.authenticate(credentials).await {
            Ok(identity) => {
                tracing::debug!(
                    listener = %listener.id(),
                    subject = %identity.subject,
                    "listener connected"
                );
                self.listeners
                    .write()
                    .await
                    .insert(listener.id().to_string(), listener);
                Ok(())
            }
            Err(e) => {
                let _ = listener
                    .push("error", json!({ "message": "authentication failed" }))
                    .await;
                listener.close().await;
                Err(e)
            }
        }
    }

    /// Removes the listener from every task's subscription set; task entries
    /// left empty are removed entirely.
    pub async fn on_disconnect(&self, listener_id: &str) {
        self.listeners.write().await.remove(listener_id);
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.retain(|_, set| {
            set.remove(listener_id);
            !set.is_empty()
        });
        tracing::debug!(listener = %listener_id, "listener disconnected");
    }

    /// Adds the listener to the task's set (idempotent) and acknowledges.
    pub async fn subscribe(&self, listener_id: &str, task_id: &str) {
        let transport = self.listeners.read().await.get(listener_id).cloned();
        let Some(transport) = transport else {
            tracing::debug!(listener = %listener_id, "subscribe from unknown listener ignored");
            return;
        };

        self.subscriptions
            .write()
            .await
            .entry(task_id.to_string())
            .or_default()
            .insert(listener_id.to_string());

        let _ = transport
            .push("subscribed", json!({ "taskId": task_id }))
            .await;
    }

    /// Removes the listener from the task's set (no-op if absent) and
    /// acknowledges.
    pub async fn unsubscribe(&self, listener_id: &str, task_id: &str) {
        {
            let mut subscriptions = self.subscriptions.write().await;
            if let Some(set) = subscriptions.get_mut(task_id) {
                set.remove(listener_id);
                if set.is_empty() {
                    subscriptions.remove(task_id);
                }
            }
        }

        if let Some(transport) = self.listeners.read().await.get(listener_id) {
            let _ = transport
                .push("unsubscribed", json!({ "taskId": task_id }))
                .await;
        }
    }

    /// Pushes the payload, annotated with the task id and a server
    /// timestamp, to every listener subscribed to the task. With no
    /// subscribers the event is dropped. A push failure marks that listener
    /// disconnected without aborting delivery to the rest.
    pub async fn dispatch(&self, task_id: &str, event: &str, payload: Value) {
        let subscriber_ids: Vec<ListenerId> = match self.subscriptions.read().await.get(task_id) {
            Some(set) => set.iter().cloned().collect(),
            None => return,
        };

        let annotated = annotate(payload, Some(task_id));
        let mut failed = Vec::new();
        for listener_id in subscriber_ids {
            let transport = self.listeners.read().await.get(&listener_id).cloned();
            if let Some(transport) = transport {
                if let Err(e) = transport.push(event, annotated.clone()).await {
                    tracing::warn!(listener = %listener_id, "push failed, dropping listener: {:#}", e);
                    failed.push(listener_id);
                }
            }
        }
        for listener_id in failed {
            self.on_disconnect(&listener_id).await;
        }
    }

    /// Pushes to every connected listener regardless of subscription.
    pub async fn broadcast(&self, event: &str, payload: Value) {
        let listeners: Vec<Arc<dyn ListenerTransport>> =
            self.listeners.read().await.values().cloned().collect();

        let annotated = annotate(payload, None);
        let mut failed = Vec::new();
        for transport in listeners {
            if let Err(e) = transport.push(event, annotated.clone()).await {
                tracing::warn!(listener = %transport.id(), "push failed, dropping listener: {:#}", e);
                failed.push(transport.id().to_string());
            }
        }
        for listener_id in failed {
            self.on_disconnect(&listener_id).await;
        }
    }

    /// Number of listeners currently subscribed to a task (zero when the
    /// entry has been removed).
    pub async fn subscriber_count(&self, task_id: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(task_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Bridges the event bus into the gateway: progress and workflow events
    /// published by the orchestrator and state machine are relayed to the
    /// task's subscribers.
    pub async fn bridge_bus(
        self: &Arc<Self>,
        bus: &dyn EventBus,
    ) -> Result<(), WorkflowError> {
        let gateway = Arc::clone(self);
        bus.subscribe(
            TASK_PROGRESS_TOPIC,
            "workflow-gateway",
            Box::new(move |message: BusMessage| {
                let gateway = Arc::clone(&gateway);
                Box::pin(async move {
                    relay(&gateway, message, "progress").await;
                    Ok(())
                })
            }),
        )
        .await?;

        let gateway = Arc::clone(self);
        bus.subscribe(
            WORKFLOW_EVENTS_TOPIC,
            "workflow-gateway",
            Box::new(move |message: BusMessage| {
                let gateway = Arc::clone(&gateway);
                Box::pin(async move {
                    relay(&gateway, message, "state-change").await;
                    Ok(())
                })
            }),
        )
        .await
    }
}

async fn relay(gateway: &EventFanOutGateway, message: BusMessage, event: &str) {
    let task_id = message
        .payload
        .get("taskId")
        .and_then(Value::as_str)
        .map(str::to_string);
    match task_id {
        Some(task_id) => gateway.dispatch(&task_id, event, message.payload).await,
        None => tracing::debug!(topic = %message.topic, "bus message without taskId dropped"),
    }
}

/// Fills in the task id (for task-scoped events) and a server timestamp
/// when the payload does not already carry them; a non-object payload is
/// wrapped.
fn annotate(payload: Value, task_id: Option<&str>) -> Value {
    let mut map = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    if let Some(task_id) = task_id {
        map.entry("taskId".to_string())
            .or_insert_with(|| json!(task_id));
    }
    map.entry("timestamp".to_string())
        .or_insert_with(|| json!(Utc::now().to_rfc3339()));
    Value::Object(map)
}

/// Channel-backed transport: events land on an unbounded mpsc receiver.
/// Used by the CLI to print live events and by tests to observe delivery.
pub struct ChannelListener {
    id: String,
    tx: mpsc::UnboundedSender<PushedEvent>,
    closed: AtomicBool,
}

/// One event as seen by a `ChannelListener`.
#[derive(Debug, Clone)]
pub struct PushedEvent {
    pub event: String,
    pub payload: Value,
}

impl ChannelListener {
    pub fn new(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<PushedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id: id.into(),
                tx,
                closed: AtomicBool::new(false),
            }),
            rx,
        )
    }
}

#[async_trait]
impl ListenerTransport for ChannelListener {
    fn id(&self) -> &str {
        &self.id
    }

    async fn push(&self, event: &str, payload: Value) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("listener {} is closed", self.id);
        }
        self.tx
            .send(PushedEvent {
                event: event.to_string(),
                payload,
            })
            .map_err(|_| anyhow::anyhow!("listener {} receiver dropped", self.id))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests;
