//! # broker
//!
//! Facility State Broker — applies live operational state to the graph and
//! fans out invalidations.
//!
//! Inputs arrive from upstream collaborators (asset status stream, crowd
//! density stream) and from the geofence engine (hazard-driven blocked-edge
//! lists). Every accepted update becomes an edge patch; the graph store bumps
//! its version and a `FacilityChange` notification goes out on the broadcast
//! bus so route sessions can invalidate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use wayfind_types::EdgeStatus;

use crate::config::BrokerConfig;
use crate::graph::{EdgePatch, GraphStore};

// ── Inbound updates ───────────────────────────────────────────────────────────

/// Operational status of a facility asset (elevator bank, corridor segment).
/// Assets map to edges by ID prefix: an update for asset `elv-3` patches every
/// edge whose `id` starts with `elv-3`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetStatusUpdate {
    pub asset_id: String,
    pub new_status: EdgeStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub updated_by: String,
    pub timestamp: i64,
}

/// Per-node crowd density in [0, 1], produced by the external heatmap service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrowdDensityUpdate {
    pub node_id: String,
    pub density: f64,
    pub timestamp: i64,
}

// ── Change notifications ──────────────────────────────────────────────────────

/// Broadcast to session actors after every published patch.
#[derive(Debug, Clone)]
pub struct FacilityChange {
    pub graph_version: u64,
    /// Edges whose status or weight changed in this patch.
    pub changed_edges: Arc<HashSet<String>>,
    /// Human-readable cause, forwarded on the `facility_change` topic.
    pub reason: String,
}

// ── Broker ────────────────────────────────────────────────────────────────────

pub struct FacilityBroker {
    graph: Arc<GraphStore>,
    config: BrokerConfig,
    change_tx: broadcast::Sender<FacilityChange>,
    /// Last density seen per node, for reconcile sweeps.
    densities: std::sync::Mutex<HashMap<String, f64>>,
    /// Edges currently blocked per hazard zone, to undo on zone resolve.
    hazard_blocks: std::sync::Mutex<HashMap<String, Vec<String>>>,
}

impl FacilityBroker {
    pub fn new(graph: Arc<GraphStore>, config: BrokerConfig) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            graph,
            config,
            change_tx,
            densities: std::sync::Mutex::new(HashMap::new()),
            hazard_blocks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<FacilityChange> {
        self.change_tx.subscribe()
    }

    /// Apply an asset status update. Matching is by edge-ID prefix; an update
    /// that matches nothing is logged and dropped.
    pub fn apply_asset_status(&self, update: &AssetStatusUpdate) -> u64 {
        let snapshot = self.graph.snapshot();
        let patches: Vec<EdgePatch> = snapshot
            .edges()
            .filter(|e| e.id.starts_with(&update.asset_id))
            .map(|e| EdgePatch {
                edge_id: e.id.clone(),
                status: Some(update.new_status),
                dynamic_weight: None,
            })
            .collect();

        if patches.is_empty() {
            warn!("asset status for {} matched no edges", update.asset_id);
            return snapshot.version;
        }

        info!(
            "asset {} -> {:?} ({} edges), reason: {}",
            update.asset_id,
            update.new_status,
            patches.len(),
            update.reason
        );
        self.publish(patches, format!("asset {} {:?}", update.asset_id, update.new_status))
    }

    /// Apply a crowd density reading. The node's density is projected onto
    /// every edge leaving it: weight = 1 + crowdPenalty · density³.
    pub fn apply_crowd_density(&self, update: &CrowdDensityUpdate) -> u64 {
        let density = update.density.clamp(0.0, 1.0);
        self.densities.lock().expect("density map lock").insert(update.node_id.clone(), density);

        let weight = 1.0 + self.config.crowd_penalty * density.powi(3);
        let snapshot = self.graph.snapshot();
        let patches: Vec<EdgePatch> = snapshot
            .neighbors(&update.node_id)
            .iter()
            .map(|e| EdgePatch {
                edge_id: e.id.clone(),
                status: None,
                dynamic_weight: Some(weight),
            })
            .collect();

        if patches.is_empty() {
            debug!("density update for unknown/leaf node {}", update.node_id);
            return snapshot.version;
        }
        self.publish(patches, format!("crowd density {:.2} at {}", density, update.node_id))
    }

    /// Replace the blocked-edge set attributed to one hazard zone. Edges no
    /// longer blocked revert to operational; newly blocked edges close.
    pub fn apply_hazard_blocks(&self, zone_id: &str, blocked: Vec<String>) -> u64 {
        let previous = {
            let mut map = self.hazard_blocks.lock().expect("hazard block lock");
            map.insert(zone_id.to_string(), blocked.clone()).unwrap_or_default()
        };

        let blocked_set: HashSet<&String> = blocked.iter().collect();
        let mut patches: Vec<EdgePatch> = Vec::new();
        for edge_id in &previous {
            if !blocked_set.contains(edge_id) {
                patches.push(EdgePatch {
                    edge_id: edge_id.clone(),
                    status: Some(EdgeStatus::Operational),
                    dynamic_weight: None,
                });
            }
        }
        for edge_id in &blocked {
            patches.push(EdgePatch {
                edge_id: edge_id.clone(),
                status: Some(EdgeStatus::Closed),
                dynamic_weight: None,
            });
        }

        if patches.is_empty() {
            return self.graph.version();
        }
        info!("hazard {} blocks {} edges ({} released)", zone_id, blocked.len(), previous.len());
        self.publish(patches, format!("hazard {zone_id}"))
    }

    /// Periodic reconcile: re-derive every tracked density weight. Heals any
    /// drift if a patch was lost (job wheel calls this).
    pub fn reconcile(&self) {
        let densities = self.densities.lock().expect("density map lock").clone();
        let snapshot = self.graph.snapshot();
        let mut patches = Vec::new();
        for (node_id, density) in &densities {
            let weight = 1.0 + self.config.crowd_penalty * density.powi(3);
            for e in snapshot.neighbors(node_id) {
                if (e.dynamic_weight - weight).abs() > 1e-9 {
                    patches.push(EdgePatch {
                        edge_id: e.id.clone(),
                        status: None,
                        dynamic_weight: Some(weight),
                    });
                }
            }
        }
        if !patches.is_empty() {
            debug!("reconcile repaired {} edge weights", patches.len());
            self.publish(patches, "broker reconcile".to_string());
        }
    }

    fn publish(&self, patches: Vec<EdgePatch>, reason: String) -> u64 {
        let (version, changed) = self.graph.patch_edges(&patches);
        if !changed.is_empty() {
            let _ = self.change_tx.send(FacilityChange {
                graph_version: version,
                changed_edges: Arc::new(changed.into_iter().collect()),
                reason,
            });
        }
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use wayfind_types::{AccessFlags, LocalPoint, NavEdge, NavNode, NodeKind, TraversalMode};

    fn store() -> Arc<GraphStore> {
        let node = |id: &str, x: f64| NavNode {
            id: id.into(),
            position: LocalPoint::new(x, 0.0, 0.0, 0),
            kind: NodeKind::Walkway,
            access: AccessFlags::default(),
            name: String::new(),
        };
        let edge = |id: &str, from: &str, to: &str| NavEdge {
            id: id.into(),
            from_id: from.into(),
            to_id: to.into(),
            distance_m: 10.0,
            base_time_s: 8.0,
            mode: TraversalMode::Walk,
            status: EdgeStatus::Operational,
            constraints: Default::default(),
            wait_time_s: 0.0,
            accessibility_score: 1.0,
            dynamic_weight: 1.0,
        };
        Arc::new(
            GraphStore::new(
                &GraphConfig::default(),
                vec![node("a", 0.0), node("b", 10.0)],
                vec![edge("elv-3-up", "a", "b"), edge("walk-1", "b", "a")],
            )
            .unwrap(),
        )
    }

    #[test]
    fn asset_status_patches_matching_edges() {
        let graph = store();
        let broker = FacilityBroker::new(graph.clone(), BrokerConfig::default());
        let mut rx = broker.subscribe_changes();

        let v = broker.apply_asset_status(&AssetStatusUpdate {
            asset_id: "elv-3".into(),
            new_status: EdgeStatus::Maintenance,
            reason: "inspection".into(),
            updated_by: "ops".into(),
            timestamp: 0,
        });
        assert_eq!(v, 2);
        assert_eq!(graph.snapshot().edge("elv-3-up").unwrap().status, EdgeStatus::Maintenance);
        assert_eq!(graph.snapshot().edge("walk-1").unwrap().status, EdgeStatus::Operational);

        let change = rx.try_recv().unwrap();
        assert!(change.changed_edges.contains("elv-3-up"));
    }

    #[test]
    fn density_weight_is_cubic() {
        let graph = store();
        let broker = FacilityBroker::new(graph.clone(), BrokerConfig { crowd_penalty: 2.0 });
        broker.apply_crowd_density(&CrowdDensityUpdate {
            node_id: "a".into(),
            density: 0.5,
            timestamp: 0,
        });
        let w = graph.snapshot().edge("elv-3-up").unwrap().dynamic_weight;
        assert!((w - (1.0 + 2.0 * 0.125)).abs() < 1e-9);
    }

    #[test]
    fn repeated_update_does_not_bump_version() {
        let graph = store();
        let broker = FacilityBroker::new(graph.clone(), BrokerConfig::default());
        let upd = AssetStatusUpdate {
            asset_id: "walk-1".into(),
            new_status: EdgeStatus::Closed,
            reason: String::new(),
            updated_by: String::new(),
            timestamp: 0,
        };
        let v1 = broker.apply_asset_status(&upd);
        let v2 = broker.apply_asset_status(&upd);
        assert_eq!(v1, v2);
    }

    #[test]
    fn hazard_blocks_release_on_replacement() {
        let graph = store();
        let broker = FacilityBroker::new(graph.clone(), BrokerConfig::default());
        broker.apply_hazard_blocks("hz-1", vec!["walk-1".into()]);
        assert_eq!(graph.snapshot().edge("walk-1").unwrap().status, EdgeStatus::Closed);
        broker.apply_hazard_blocks("hz-1", vec![]);
        assert_eq!(graph.snapshot().edge("walk-1").unwrap().status, EdgeStatus::Operational);
    }
}
