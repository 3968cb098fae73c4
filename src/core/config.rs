//! Centralized configuration for peerlink.
//!
//! Protocol timings and sizes live here so they can be reviewed in one place.
//! [`NodeConfig`] carries the subset a running node may override at startup.

use serde::Deserialize;
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KiB).
///
/// Small enough to pass through any SCTP implementation's default receive
/// buffer without fragmentation. The sender announces its chunk size in the
/// file metadata, so both ends never need to agree on this constant.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// How long the sender waits for an accept/decline before the offer times out.
pub const OFFER_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between chunk frames. Stands in for backpressure on channels that
/// don't surface buffered-amount signals to the application.
pub const INTER_CHUNK_DELAY: Duration = Duration::from_millis(10);

/// Upper bound on an announced chunk size. Metadata above this is rejected.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

// ── Sessions ─────────────────────────────────────────────────────────────────

/// Period of the session cleanup sweep.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Label of the single data channel created by the initiator.
pub const DATA_CHANNEL_LABEL: &str = "peerlink";

// ── Presence ─────────────────────────────────────────────────────────────────

/// Presence records older than this are evicted by the staleness sweep.
pub const PRESENCE_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// How often a node rewrites its own presence record.
pub const PRESENCE_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

// ── Signaling namespaces ─────────────────────────────────────────────────────

/// Namespace holding one presence record per live device.
pub const DEVICES_NAMESPACE: &str = "devices";

/// Namespace prefix of per-recipient signal mailboxes.
pub const SIGNALS_NAMESPACE: &str = "signals";

// ── Connection engine ────────────────────────────────────────────────────────

/// Whether the WebRTC engine gathers loopback candidates (same-machine links).
pub const ICE_USE_LOOPBACK: bool = true;

/// Default STUN server handed to the WebRTC engine.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

// ── Runtime configuration ────────────────────────────────────────────────────

/// Tunables for one [`Node`](crate::core::node::Node).
///
/// Every field has a default; TOML files may set any subset.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Name published in this device's presence record.
    pub display_name: String,
    /// Chunk size used for outgoing files.
    pub chunk_size: usize,
    /// Accept/decline window for outgoing offers.
    #[serde(with = "duration_secs")]
    pub offer_timeout: Duration,
    /// Delay between outgoing chunk frames.
    #[serde(with = "duration_millis")]
    pub chunk_delay: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_secs")]
    pub presence_refresh_interval: Duration,
    #[serde(with = "duration_secs")]
    pub presence_stale_after: Duration,
    /// Only the side with the lesser peer id initiates. Turning this off lets
    /// both sides offer, leaving collisions to glare resolution.
    pub tie_break_initiation: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            display_name: "peerlink".into(),
            chunk_size: CHUNK_SIZE,
            offer_timeout: OFFER_RESPONSE_TIMEOUT,
            chunk_delay: INTER_CHUNK_DELAY,
            cleanup_interval: CLEANUP_INTERVAL,
            presence_refresh_interval: PRESENCE_REFRESH_INTERVAL,
            presence_stale_after: PRESENCE_STALE_AFTER,
            tie_break_initiation: true,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            display_name = "desk"
            offer_timeout = 5
            chunk_delay = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.display_name, "desk");
        assert_eq!(cfg.offer_timeout, Duration::from_secs(5));
        assert_eq!(cfg.chunk_delay, Duration::ZERO);
        assert_eq!(cfg.chunk_size, CHUNK_SIZE);
        assert!(cfg.tie_break_initiation);
    }
}
