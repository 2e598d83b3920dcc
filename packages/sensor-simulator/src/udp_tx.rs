//! udp_tx.rs — UDP transmitter toward the ingest hub
//!
//! Serializes one JSON envelope per walker per epoch and fires it at the
//! hub's ingest port. Sequence numbers are per simulated device so the hub's
//! replay guard sees realistic traffic.

use std::collections::HashMap;

use serde::Serialize;
use tokio::net::UdpSocket;
use tracing::{debug, warn};
use wayfind_types::SensorSample;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeOut<'a> {
    user_id: &'a str,
    device_id: String,
    seq_num: u32,
    samples: &'a [SensorSample],
}

pub struct UdpTransmitter {
    socket: UdpSocket,
    hub_addr: String,
    seq_nums: HashMap<String, u32>,
    pub sent: u64,
    pub errors: u64,
}

impl UdpTransmitter {
    pub async fn bind(hub_addr: String) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Self { socket, hub_addr, seq_nums: HashMap::new(), sent: 0, errors: 0 })
    }

    pub async fn send_batch(&mut self, user_id: &str, samples: &[SensorSample]) {
        if samples.is_empty() {
            return;
        }
        let seq = self.seq_nums.entry(user_id.to_string()).or_insert(0);
        *seq += 1;
        let envelope = EnvelopeOut {
            user_id,
            device_id: format!("{user_id}-dev"),
            seq_num: *seq,
            samples,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!("envelope serialize failed for {user_id}: {e}");
                self.errors += 1;
                return;
            }
        };
        match self.socket.send_to(&payload, &self.hub_addr).await {
            Ok(_) => {
                self.sent += 1;
                debug!("sent {} samples for {user_id} (seq {seq})", samples.len());
            }
            Err(e) => {
                // Hub offline is not fatal; the sim keeps walking.
                self.errors += 1;
                warn!("UDP send to {} failed: {e}", self.hub_addr);
            }
        }
    }
}
