//! Control plane event bus.
//!
//! Components publish [`Event`]s without ever blocking. Each event fans
//! out to two places:
//!
//! ```text
//! EventBus::publish
//!   ├── bounded mpsc ──► EventQueue::drain ──► EventSink (external, best-effort)
//!   └── broadcast ─────► internal subscribers (controller, autoscaler, cost)
//! ```
//!
//! A full queue drops the event with a warning; a slow sink only delays
//! delivery, never the publisher.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::time::epoch_secs;

/// Event topics understood by the event sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "deployment:status")]
    DeploymentStatus,
    #[serde(rename = "scaling:executed")]
    ScalingExecuted,
    #[serde(rename = "budget:alert")]
    BudgetAlert,
    #[serde(rename = "sandbox:cleanup")]
    SandboxCleanup,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::DeploymentStatus => "deployment:status",
            Topic::ScalingExecuted => "scaling:executed",
            Topic::BudgetAlert => "budget:alert",
            Topic::SandboxCleanup => "sandbox:cleanup",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single published event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub topic: Topic,
    pub deployment_id: Option<String>,
    pub payload: serde_json::Value,
    /// Unix timestamp (seconds) at publish time.
    pub at: u64,
}

impl Event {
    pub fn new(topic: Topic, deployment_id: Option<&str>, payload: serde_json::Value) -> Self {
        Self {
            topic,
            deployment_id: deployment_id.map(str::to_string),
            payload,
            at: epoch_secs(),
        }
    }
}

/// External event delivery collaborator (pub/sub fan-out to clients).
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, topic: &str, payload: &serde_json::Value) -> anyhow::Result<()>;
}

/// Sink that writes every event to the log.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, topic: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        info!(%topic, %payload, "event");
        Ok(())
    }
}

/// Sink that records events in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events().into_iter().map(|(t, _)| t).collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn emit(&self, topic: &str, payload: &serde_json::Value) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink poisoned"))?
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }
}

/// Publisher handle. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    outbound: mpsc::Sender<Event>,
    internal: broadcast::Sender<Event>,
}

/// Receiving end of the outbound queue, drained into an [`EventSink`].
pub struct EventQueue {
    rx: mpsc::Receiver<Event>,
}

impl EventBus {
    /// Create a bus with a bounded outbound queue.
    pub fn new(capacity: usize) -> (Self, EventQueue) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let (internal, _) = broadcast::channel(capacity.max(1));
        (Self { outbound, internal }, EventQueue { rx })
    }

    /// Publish an event. Never blocks.
    pub fn publish(&self, event: Event) {
        // No internal subscribers is not an error.
        let _ = self.internal.send(event.clone());

        match self.outbound.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(topic = %event.topic, "event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(topic = %event.topic, "event queue closed, dropping event");
            }
        }
    }

    /// Build and publish an event.
    pub fn emit(&self, topic: Topic, deployment_id: Option<&str>, payload: serde_json::Value) {
        self.publish(Event::new(topic, deployment_id, payload));
    }

    /// Subscribe to every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.internal.subscribe()
    }
}

impl EventQueue {
    /// Forward queued events to the sink until shutdown or until every
    /// publisher is dropped. Events still queued at shutdown are flushed.
    pub async fn drain(
        mut self,
        sink: Arc<dyn EventSink>,
        timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                next = self.rx.recv() => {
                    match next {
                        Some(event) => deliver(sink.as_ref(), &event, timeout).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    while let Ok(event) = self.rx.try_recv() {
                        deliver(sink.as_ref(), &event, timeout).await;
                    }
                    break;
                }
            }
        }
        debug!("event queue drained");
    }
}

async fn deliver(sink: &dyn EventSink, event: &Event, timeout: Duration) {
    let mut payload = event.payload.clone();
    if let (Some(id), Some(obj)) = (&event.deployment_id, payload.as_object_mut()) {
        obj.entry("deployment_id")
            .or_insert_with(|| serde_json::Value::String(id.clone()));
    }
    match tokio::time::timeout(timeout, sink.emit(event.topic.as_str(), &payload)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(topic = %event.topic, error = %e, "event delivery failed"),
        Err(_) => warn!(topic = %event.topic, "event delivery timed out"),
    }
}
