//! Relay abstraction: namespaced records with child-event subscriptions.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Change to one child record of a subscribed namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Added { key: String, value: String },
    Changed { key: String, value: String },
    Removed { key: String },
}

/// Live feed of child events. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<ChildEvent>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        rx: mpsc::UnboundedReceiver<ChildEvent>,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    /// Next event, or `None` once the relay side is gone.
    pub async fn recv(&mut self) -> Option<ChildEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

/// Put/get/subscribe/remove over namespaced records.
///
/// Values are opaque strings (JSON in practice). Implementations must deliver
/// the events of one namespace to a subscriber in the order they were applied,
/// and a subscription must start with the current children as `Added` events.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Write `value` under `namespace/key`, replacing any previous value.
    async fn put(&self, namespace: &str, key: &str, value: String) -> Result<()>;

    /// Append `value` under a generated key that sorts after every earlier push.
    async fn push(&self, namespace: &str, value: String) -> Result<String>;

    /// Snapshot of the namespace in key order.
    async fn get(&self, namespace: &str) -> Result<Vec<(String, String)>>;

    async fn subscribe(&self, namespace: &str) -> Result<Subscription>;

    async fn remove(&self, namespace: &str, key: &str) -> Result<()>;

    /// Have the relay remove `namespace/key` when this client disconnects.
    async fn remove_on_disconnect(&self, namespace: &str, key: &str) -> Result<()>;

    /// Leave the relay, running registered disconnect removals.
    async fn disconnect(&self) -> Result<()>;
}
