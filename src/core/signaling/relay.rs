//! In-process relay: a shared record store every [`RelayClient`] talks to.
//!
//! Used by the demo binary (two nodes in one process) and by tests. It keeps
//! the semantics the session manager relies on: per-namespace ordered
//! delivery, snapshot-then-live subscriptions, and removals on disconnect.

use super::transport::{ChildEvent, SignalTransport, Subscription};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Default)]
struct RelayState {
    records: HashMap<String, BTreeMap<String, String>>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<ChildEvent>)>>,
    next_subscriber: u64,
    next_push: u64,
}

impl RelayState {
    fn notify(&mut self, namespace: &str, event: ChildEvent) {
        if let Some(subs) = self.subscribers.get_mut(namespace) {
            subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    fn put(&mut self, namespace: &str, key: &str, value: String) {
        let previous = self
            .records
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        let event = match previous {
            Some(_) => ChildEvent::Changed {
                key: key.to_string(),
                value,
            },
            None => ChildEvent::Added {
                key: key.to_string(),
                value,
            },
        };
        self.notify(namespace, event);
    }

    fn remove(&mut self, namespace: &str, key: &str) {
        let removed = self
            .records
            .get_mut(namespace)
            .and_then(|children| children.remove(key))
            .is_some();
        if removed {
            self.notify(
                namespace,
                ChildEvent::Removed {
                    key: key.to_string(),
                },
            );
        }
    }
}

/// Shared store. Clones refer to the same relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new client.
    pub fn client(&self) -> RelayClient {
        RelayClient {
            state: self.state.clone(),
            on_disconnect: Arc::new(Mutex::new(Vec::new())),
            unreachable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of records currently stored under `namespace`.
    pub fn len(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.records.get(namespace).map_or(0, |c| c.len()))
            .unwrap_or(0)
    }
}

/// One device's connection to a [`MemoryRelay`].
#[derive(Clone)]
pub struct RelayClient {
    state: Arc<Mutex<RelayState>>,
    on_disconnect: Arc<Mutex<Vec<(String, String)>>>,
    unreachable: Arc<AtomicBool>,
}

impl RelayClient {
    /// Make every operation fail until reset, simulating a relay outage.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Release);
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RelayState) -> T) -> Result<T> {
        if self.unreachable.load(Ordering::Acquire) {
            return Err(anyhow!("relay unreachable"));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("relay state poisoned"))?;
        Ok(f(&mut state))
    }
}

#[async_trait]
impl SignalTransport for RelayClient {
    async fn put(&self, namespace: &str, key: &str, value: String) -> Result<()> {
        self.with_state(|s| s.put(namespace, key, value))
    }

    async fn push(&self, namespace: &str, value: String) -> Result<String> {
        self.with_state(|s| {
            s.next_push += 1;
            // Zero-padded so lexical key order equals push order.
            let key = format!("{:020}", s.next_push);
            s.put(namespace, &key, value);
            key
        })
    }

    async fn get(&self, namespace: &str) -> Result<Vec<(String, String)>> {
        self.with_state(|s| {
            s.records
                .get(namespace)
                .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        })
    }

    async fn subscribe(&self, namespace: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.with_state(|s| {
            if let Some(children) = s.records.get(namespace) {
                for (key, value) in children {
                    let _ = tx.send(ChildEvent::Added {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
            s.next_subscriber += 1;
            let id = s.next_subscriber;
            s.subscribers
                .entry(namespace.to_string())
                .or_default()
                .push((id, tx));
            id
        })?;

        let weak: Weak<Mutex<RelayState>> = Arc::downgrade(&self.state);
        let ns = namespace.to_string();
        Ok(Subscription::new(rx, move || {
            if let Some(state) = weak.upgrade() {
                if let Ok(mut s) = state.lock() {
                    if let Some(subs) = s.subscribers.get_mut(&ns) {
                        subs.retain(|(sid, _)| *sid != id);
                    }
                }
            }
        }))
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        self.with_state(|s| s.remove(namespace, key))
    }

    async fn remove_on_disconnect(&self, namespace: &str, key: &str) -> Result<()> {
        let mut hooks = self
            .on_disconnect
            .lock()
            .map_err(|_| anyhow!("disconnect hooks poisoned"))?;
        hooks.push((namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let hooks: Vec<(String, String)> = self
            .on_disconnect
            .lock()
            .map(|mut h| h.drain(..).collect())
            .map_err(|_| anyhow!("disconnect hooks poisoned"))?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("relay state poisoned"))?;
        for (namespace, key) in hooks {
            debug!(event = "relay_disconnect_removal", %namespace, %key, "Removing record on disconnect");
            state.remove(&namespace, &key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscription_replays_snapshot_then_live_events() {
        let relay = MemoryRelay::new();
        let a = relay.client();
        a.put("devices", "x", "1".into()).await.unwrap();

        let mut sub = a.subscribe("devices").await.unwrap();
        assert_eq!(
            sub.recv().await,
            Some(ChildEvent::Added { key: "x".into(), value: "1".into() })
        );

        a.put("devices", "x", "2".into()).await.unwrap();
        a.remove("devices", "x").await.unwrap();
        assert_eq!(
            sub.recv().await,
            Some(ChildEvent::Changed { key: "x".into(), value: "2".into() })
        );
        assert_eq!(sub.recv().await, Some(ChildEvent::Removed { key: "x".into() }));
    }

    #[tokio::test]
    async fn pushed_keys_preserve_order() {
        let relay = MemoryRelay::new();
        let c = relay.client();
        for i in 0..12 {
            c.push("signals/p", i.to_string()).await.unwrap();
        }
        let values: Vec<String> = c
            .get("signals/p")
            .await
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        let expected: Vec<String> = (0..12).map(|i| i.to_string()).collect();
        assert_eq!(values, expected);
    }

    #[tokio::test]
    async fn disconnect_runs_registered_removals() {
        let relay = MemoryRelay::new();
        let a = relay.client();
        let b = relay.client();
        a.put("devices", "a", "{}".into()).await.unwrap();
        a.remove_on_disconnect("devices", "a").await.unwrap();
        let mut sub = b.subscribe("devices").await.unwrap();
        let _ = sub.recv().await;

        a.disconnect().await.unwrap();
        assert_eq!(sub.recv().await, Some(ChildEvent::Removed { key: "a".into() }));
        assert_eq!(relay.len("devices"), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let relay = MemoryRelay::new();
        let c = relay.client();
        let sub = c.subscribe("ns").await.unwrap();
        drop(sub);
        c.put("ns", "k", "v".into()).await.unwrap();
        let subs = relay.state.lock().unwrap().subscribers.get("ns").map_or(0, |s| s.len());
        assert_eq!(subs, 0);
    }

    #[tokio::test]
    async fn unreachable_client_fails_operations() {
        let relay = MemoryRelay::new();
        let c = relay.client();
        c.set_unreachable(true);
        assert!(c.put("ns", "k", "v".into()).await.is_err());
        c.set_unreachable(false);
        assert!(c.put("ns", "k", "v".into()).await.is_ok());
    }
}
