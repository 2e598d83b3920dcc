//! # ingest
//!
//! Position ingest hub — receives sensor-sample batches from devices via
//! UDP, validates them, and routes each batch to the owning session actor.
//!
//! ## Architecture
//! This module runs as a separate Tokio task (tokio::spawn) alongside the
//! Socket.IO surface. It:
//!   1. Binds a UDP socket (port configurable via WAYFIND_UDP_PORT)
//!   2. Receives JSON batch envelopes from positioning devices
//!   3. Validates sequence numbers per device (replay/stale detection)
//!   4. Message-passes the batch into the user's session actor
//!
//! UDP errors never crash the server; malformed packets are logged at debug
//! and dropped. Clients that need the fused pose synchronously use the
//! Socket.IO `position-update` event instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use wayfind_types::SensorSample;

use crate::session::{SessionCommand, SessionRegistry};

// ── Configuration ─────────────────────────────────────────────────────────────

pub struct IngestHubConfig {
    /// UDP port to listen on (default 5544).
    pub udp_port: u16,
    /// Maximum samples per envelope; larger batches are truncated.
    pub max_batch: usize,
    /// A device silent for longer than this may restart its sequence
    /// numbering without being treated as a replay, milliseconds.
    pub resync_after_ms: i64,
}

impl Default for IngestHubConfig {
    fn default() -> Self {
        Self {
            udp_port: std::env::var("WAYFIND_UDP_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5544),
            max_batch: std::env::var("WAYFIND_INGEST_MAX_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(64),
            resync_after_ms: std::env::var("WAYFIND_INGEST_RESYNC_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30_000),
        }
    }
}

// ── Wire format ───────────────────────────────────────────────────────────────

/// JSON envelope for one sample batch from one device.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEnvelope {
    pub user_id: String,
    #[serde(default)]
    pub device_id: String,
    /// Monotonically increasing per-device sequence number.
    pub seq_num: u32,
    pub samples: Vec<SensorSample>,
}

// ── Replay window (anti-replay protection) ────────────────────────────────────

/// Width of the per-device acceptance bitmap: packets trailing the
/// high-water mark by up to this many sequence numbers may arrive late, but
/// each is accepted at most once.
const REORDER_WINDOW: u32 = 64;

struct DeviceWindow {
    /// Highest sequence number accepted so far.
    high_seq: u32,
    /// Bit i set = `high_seq - i` was already accepted.
    seen_mask: u64,
    last_seen_ms: i64,
}

/// Per-device sliding acceptance window. Each sequence number is accepted
/// exactly once; numbers below the window are replays. A device that has
/// been silent past the resync horizon is allowed to restart its numbering
/// (battery swap, app relaunch) instead of being locked out.
struct ReplayWindow {
    devices: HashMap<String, DeviceWindow>,
    resync_after_ms: i64,
}

impl ReplayWindow {
    fn new(resync_after_ms: i64) -> Self {
        Self { devices: HashMap::new(), resync_after_ms }
    }

    fn accept(&mut self, device: &str, seq_num: u32, now_ms: i64) -> bool {
        let Some(window) = self.devices.get_mut(device) else {
            self.devices.insert(
                device.to_string(),
                DeviceWindow { high_seq: seq_num, seen_mask: 1, last_seen_ms: now_ms },
            );
            return true;
        };

        if now_ms - window.last_seen_ms > self.resync_after_ms {
            debug!("ingest: device {device} quiet past resync horizon; renumbering from {seq_num}");
            window.high_seq = seq_num;
            window.seen_mask = 1;
            window.last_seen_ms = now_ms;
            return true;
        }

        if seq_num > window.high_seq {
            let advance = seq_num - window.high_seq;
            window.seen_mask = if advance >= REORDER_WINDOW {
                1
            } else {
                (window.seen_mask << advance) | 1
            };
            window.high_seq = seq_num;
            window.last_seen_ms = now_ms;
            return true;
        }

        let lag = window.high_seq - seq_num;
        if lag >= REORDER_WINDOW {
            warn!(
                "ingest: rejected packet from {device}: seq {seq_num} trails high-water {} beyond the window",
                window.high_seq
            );
            return false;
        }
        let bit = 1u64 << lag;
        if window.seen_mask & bit != 0 {
            warn!("ingest: rejected duplicate seq {seq_num} from {device}");
            return false;
        }
        window.seen_mask |= bit;
        window.last_seen_ms = now_ms;
        true
    }
}

// ── Main UDP listener task ────────────────────────────────────────────────────

/// Start the ingest hub as a background Tokio task.
pub async fn start_ingest_hub(config: IngestHubConfig, registry: Arc<SessionRegistry>) {
    let addr = format!("0.0.0.0:{}", config.udp_port);
    let socket = match UdpSocket::bind(&addr).await {
        Ok(s) => {
            info!("ingest hub listening on UDP {addr}");
            s
        }
        Err(e) => {
            // No UDP feed in this deployment; the socket surface still works.
            warn!("ingest hub: could not bind UDP {addr}: {e} (UDP ingest disabled)");
            return;
        }
    };

    let mut replay_window = ReplayWindow::new(config.resync_after_ms);
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                process_packet(&buf[..len], src, &mut replay_window, &config, &registry).await;
            }
            Err(e) => {
                // Never crash; log and continue.
                warn!("ingest hub: UDP recv error: {e}");
            }
        }
    }
}

fn now_wall_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

async fn process_packet(
    data: &[u8],
    src: SocketAddr,
    replay_window: &mut ReplayWindow,
    config: &IngestHubConfig,
    registry: &Arc<SessionRegistry>,
) {
    let envelope: IngestEnvelope = match serde_json::from_slice(data) {
        Ok(e) => e,
        Err(e) => {
            debug!("ingest: malformed packet from {src}: {e}");
            return;
        }
    };
    if envelope.user_id.is_empty() {
        debug!("ingest: packet from {src} without user id");
        return;
    }

    let device_key = if envelope.device_id.is_empty() {
        envelope.user_id.clone()
    } else {
        format!("{}/{}", envelope.user_id, envelope.device_id)
    };
    if !replay_window.accept(&device_key, envelope.seq_num, now_wall_ms()) {
        return;
    }

    let mut samples: Vec<SensorSample> = envelope.samples;
    if samples.len() > config.max_batch {
        debug!(
            "ingest: batch from {device_key} truncated {} -> {}",
            samples.len(),
            config.max_batch
        );
        samples.truncate(config.max_batch);
    }
    if samples.is_empty() {
        return;
    }

    if let Err(e) = registry
        .send(&envelope.user_id, SessionCommand::IngestSamples { samples, reply: None })
        .await
    {
        warn!("ingest: could not route batch for {}: {e}", envelope.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_rejects_duplicates_but_accepts_late_arrivals() {
        let mut w = ReplayWindow::new(30_000);
        assert!(w.accept("dev-1", 5, 0));
        assert!(w.accept("dev-1", 6, 100));
        assert!(!w.accept("dev-1", 6, 200)); // exact duplicate
        assert!(w.accept("dev-1", 9, 300)); // loss ahead is fine
        assert!(w.accept("dev-1", 7, 400)); // late in-window arrival
        assert!(!w.accept("dev-1", 7, 500)); // but only once
        assert!(w.accept("dev-2", 1, 600)); // independent per device
    }

    #[test]
    fn window_rejects_sequences_trailing_beyond_the_window() {
        let mut w = ReplayWindow::new(30_000);
        assert!(w.accept("dev-1", 500, 0));
        assert!(!w.accept("dev-1", 500 - REORDER_WINDOW, 100));
        assert!(w.accept("dev-1", 500 - REORDER_WINDOW + 1, 200));
    }

    #[test]
    fn quiet_device_may_renumber() {
        let mut w = ReplayWindow::new(30_000);
        assert!(w.accept("dev-1", 900, 0));
        // an old sequence number shortly after is a replay...
        assert!(!w.accept("dev-1", 3, 1_000));
        // ...but after the resync horizon it reads as a device restart.
        // (the rejected attempt does not refresh the horizon)
        assert!(w.accept("dev-1", 3, 40_000));
        assert!(w.accept("dev-1", 4, 40_100));
    }

    #[test]
    fn large_jump_resets_the_bitmap() {
        let mut w = ReplayWindow::new(30_000);
        assert!(w.accept("dev-1", 1, 0));
        assert!(w.accept("dev-1", 1 + REORDER_WINDOW * 2, 100));
        // the pre-jump number now trails beyond the window
        assert!(!w.accept("dev-1", 1, 200));
    }

    #[test]
    fn envelope_parses_wire_shape() {
        let raw = serde_json::json!({
            "userId": "u-1",
            "deviceId": "phone-1",
            "seqNum": 7,
            "samples": [{
                "source": "SLAM",
                "timestampNs": 123,
                "position": { "frame": "LOCAL", "x": 1.0, "y": 2.0, "z": 0.0, "floor": 0 },
                "confidence": 0.9
            }]
        });
        let env: IngestEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.user_id, "u-1");
        assert_eq!(env.seq_num, 7);
        assert_eq!(env.samples.len(), 1);
    }
}
