//! # zone_wal
//!
//! SHA-256 chained append-only log for runtime zone mutations.
//!
//! Hazard zones created while the server runs must survive a restart; every
//! accepted CRUD operation is appended as a JSON line where each record
//! hashes the previous record's hash. On startup the log is replayed in
//! order; a record that fails hash verification ends the replay at the last
//! good prefix (a torn tail from a crash mid-write is expected and safe).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use wayfind_types::{HazardZone, ZoneStatus};

use crate::error::{CoreError, CoreResult};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ── Operations ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneOp {
    Create { zone: HazardZone },
    Update { zone: HazardZone },
    Delete { zone_id: String },
    Activate { zone_id: String, status: ZoneStatus },
}

impl ZoneOp {
    pub fn zone_id(&self) -> &str {
        match self {
            ZoneOp::Create { zone } | ZoneOp::Update { zone } => &zone.id,
            ZoneOp::Delete { zone_id } | ZoneOp::Activate { zone_id, .. } => zone_id,
        }
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalRecord {
    seq: u64,
    timestamp_ms: i64,
    prev_hash: String,
    #[serde(flatten)]
    op: ZoneOp,
    hash: String,
}

fn compute_hash(prev_hash: &str, seq: u64, timestamp_ms: i64, op: &ZoneOp) -> String {
    let payload = serde_json::to_string(op).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(seq.to_le_bytes());
    hasher.update(timestamp_ms.to_le_bytes());
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Append-only writer. One instance per process; the geofence engine holds it
/// behind its CRUD writer lock, so appends are serialized.
pub struct ZoneWal {
    path: PathBuf,
    seq: u64,
    last_hash: String,
}

impl ZoneWal {
    /// Open the WAL, replaying any existing records. A broken or torn tail
    /// is truncated away so the next append continues a valid chain. Returns
    /// the writer positioned at the tail plus the replayed operations.
    pub async fn open(path: impl Into<PathBuf>) -> CoreResult<(Self, Vec<ZoneOp>)> {
        let path = path.into();
        let outcome = replay(&path).await;
        if outcome.good_bytes < outcome.total_bytes {
            warn!(
                "zone WAL at {} truncated from {} to {} bytes (broken tail)",
                path.display(),
                outcome.total_bytes,
                outcome.good_bytes
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| CoreError::internal(&format!("WAL open for truncate: {e}")))?;
            file.set_len(outcome.good_bytes)
                .await
                .map_err(|e| CoreError::internal(&format!("WAL truncate: {e}")))?;
        }
        if !outcome.ops.is_empty() {
            info!("zone WAL replayed {} records from {}", outcome.ops.len(), path.display());
        }
        Ok((Self { path, seq: outcome.seq, last_hash: outcome.last_hash }, outcome.ops))
    }

    /// Append one operation and fsync before returning. The zone store must
    /// only be mutated after this resolves.
    pub async fn commit(&mut self, op: &ZoneOp, timestamp_ms: i64) -> CoreResult<()> {
        let seq = self.seq;
        let hash = compute_hash(&self.last_hash, seq, timestamp_ms, op);
        let record = WalRecord {
            seq,
            timestamp_ms,
            prev_hash: self.last_hash.clone(),
            op: op.clone(),
            hash: hash.clone(),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| CoreError::internal(&format!("WAL serialize: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CoreError::internal(&format!("WAL open {}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::internal(&format!("WAL write: {e}")))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| CoreError::internal(&format!("WAL write: {e}")))?;
        file.sync_data()
            .await
            .map_err(|e| CoreError::internal(&format!("WAL fsync: {e}")))?;

        self.seq = seq + 1;
        self.last_hash = hash;
        Ok(())
    }
}

struct ReplayOutcome {
    ops: Vec<ZoneOp>,
    seq: u64,
    last_hash: String,
    /// Byte length of the valid prefix.
    good_bytes: u64,
    total_bytes: u64,
}

/// Replay the log, stopping at the first record that breaks the chain.
async fn replay(path: &Path) -> ReplayOutcome {
    let mut outcome = ReplayOutcome {
        ops: Vec::new(),
        seq: 0,
        last_hash: GENESIS_HASH.to_string(),
        good_bytes: 0,
        total_bytes: 0,
    };

    let data = match tokio::fs::read_to_string(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return outcome,
        Err(e) => {
            warn!("zone WAL unreadable at {}: {e}; starting empty", path.display());
            return outcome;
        }
    };
    outcome.total_bytes = data.len() as u64;

    for (line_no, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            outcome.good_bytes += line.len() as u64 + 1;
            continue;
        }
        let record: WalRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "zone WAL line {} unparseable ({e}); keeping {} records",
                    line_no + 1,
                    outcome.ops.len()
                );
                return outcome;
            }
        };
        let expected = compute_hash(&record.prev_hash, record.seq, record.timestamp_ms, &record.op);
        if record.seq != outcome.seq || record.prev_hash != outcome.last_hash || record.hash != expected {
            warn!(
                "zone WAL chain broken at line {} (seq {}); keeping {} records",
                line_no + 1,
                record.seq,
                outcome.ops.len()
            );
            return outcome;
        }
        outcome.last_hash = record.hash.clone();
        outcome.seq += 1;
        outcome.ops.push(record.op);
        outcome.good_bytes += line.len() as u64 + 1;
    }
    outcome.good_bytes = outcome.total_bytes;
    outcome
}
