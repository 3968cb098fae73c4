//! Live view of the `devices` namespace.

use crate::core::peer::PeerId;
use crate::core::signaling::{ChildEvent, PresenceRecord};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(PeerId),
    Updated(PeerId),
    Departed(PeerId),
    /// Own record, unknown key, or unparseable value.
    Ignored,
}

pub struct DeviceDirectory {
    local_id: PeerId,
    records: HashMap<PeerId, PresenceRecord>,
}

impl DeviceDirectory {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            records: HashMap::new(),
        }
    }

    pub fn apply(&mut self, event: ChildEvent) -> PresenceChange {
        match event {
            ChildEvent::Added { key, value } | ChildEvent::Changed { key, value } => {
                let record: PresenceRecord = match serde_json::from_str(&value) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(event = "presence_malformed", %key, %e, "Ignoring unreadable presence record");
                        return PresenceChange::Ignored;
                    }
                };
                if record.peer_id.as_str() != key {
                    warn!(event = "presence_key_mismatch", %key, peer = %record.peer_id, "Presence record stored under another key");
                    return PresenceChange::Ignored;
                }
                if record.peer_id == self.local_id {
                    return PresenceChange::Ignored;
                }
                let peer = record.peer_id.clone();
                match self.records.insert(peer.clone(), record) {
                    None => {
                        info!(event = "peer_joined", peer = %peer.short(), "Device appeared");
                        PresenceChange::Joined(peer)
                    }
                    Some(_) => PresenceChange::Updated(peer),
                }
            }
            ChildEvent::Removed { key } => {
                let peer = PeerId::from(key.as_str());
                match self.records.remove(&peer) {
                    Some(_) => {
                        info!(event = "peer_left", peer = %peer.short(), "Device disappeared");
                        PresenceChange::Departed(peer)
                    }
                    None => PresenceChange::Ignored,
                }
            }
        }
    }

    /// Remote devices, ordered by id.
    pub fn peers(&self) -> Vec<PresenceRecord> {
        let mut peers: Vec<PresenceRecord> = self.records.values().cloned().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn display_name_of(&self, peer: &PeerId) -> Option<&str> {
        self.records.get(peer).map(|r| r.display_name.as_str())
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, peer: &PeerId) -> bool {
        self.records.contains_key(peer)
    }

    /// Drop records last written more than `stale_after` before `now_ms`.
    /// Returns the evicted peers; the caller removes them from the relay.
    pub fn sweep_stale(&mut self, now_ms: u64, stale_after: Duration) -> Vec<PeerId> {
        let limit = stale_after.as_millis() as u64;
        let stale: Vec<PeerId> = self
            .records
            .values()
            .filter(|r| now_ms.saturating_sub(r.timestamp) > limit)
            .map(|r| r.peer_id.clone())
            .collect();
        for peer in &stale {
            self.records.remove(peer);
            debug!(event = "presence_evicted", peer = %peer.short(), "Evicted stale presence record");
        }
        stale
    }
}
