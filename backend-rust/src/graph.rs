//! # graph
//!
//! Navigation Graph Store — in-memory multi-floor graph with a per-floor grid
//! spatial index and copy-on-write snapshots.
//!
//! ## Architecture
//! Readers take an `Arc<GraphSnapshot>` and keep it for the duration of one
//! routing call; the facility broker is the only writer. A patch builds a new
//! snapshot and installs it atomically, so a reader either sees all edges of
//! a patch or none of them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};
use wayfind_types::{EdgeStatus, LocalPoint, NavEdge, NavNode};

use crate::config::GraphConfig;
use crate::error::{CoreError, CoreResult};

// ── Patches ───────────────────────────────────────────────────────────────────

/// One edge mutation applied by the facility broker. Unset fields keep the
/// edge's current value.
#[derive(Debug, Clone)]
pub struct EdgePatch {
    pub edge_id: String,
    pub status: Option<EdgeStatus>,
    pub dynamic_weight: Option<f64>,
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

type GridKey = (i32, i64, i64);

/// Immutable, versioned view of the navigation graph.
#[derive(Debug)]
pub struct GraphSnapshot {
    pub version: u64,
    nodes: HashMap<String, NavNode>,
    /// from-node → outgoing edges.
    adjacency: HashMap<String, Vec<NavEdge>>,
    /// edge id → (from-node, index into its adjacency list).
    edge_index: HashMap<String, (String, usize)>,
    /// (floor, ⌊x/cell⌋, ⌊y/cell⌋) → node ids.
    grid: HashMap<GridKey, Vec<String>>,
    cell_m: f64,
}

impl GraphSnapshot {
    fn grid_key(cell_m: f64, p: &LocalPoint) -> GridKey {
        (p.floor, (p.x / cell_m).floor() as i64, (p.y / cell_m).floor() as i64)
    }

    pub fn node(&self, id: &str) -> Option<&NavNode> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(Vec::len).sum()
    }

    /// Outgoing edges, O(1).
    pub fn neighbors(&self, node_id: &str) -> &[NavEdge] {
        self.adjacency.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge(&self, edge_id: &str) -> Option<&NavEdge> {
        let (from, idx) = self.edge_index.get(edge_id)?;
        self.adjacency.get(from)?.get(*idx)
    }

    pub fn edges(&self) -> impl Iterator<Item = &NavEdge> {
        self.adjacency.values().flatten()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NavNode> {
        self.nodes.values()
    }

    /// Nearest node to `p` on its floor within `max_radius_m`, scanning grid
    /// cells in expanding rings. `filter` rejects candidates (accessibility).
    pub fn nearest_node<F>(&self, p: &LocalPoint, max_radius_m: f64, filter: F) -> Option<&NavNode>
    where
        F: Fn(&NavNode) -> bool,
    {
        let center = Self::grid_key(self.cell_m, p);
        let max_ring = (max_radius_m / self.cell_m).ceil() as i64 + 1;

        let mut best: Option<(&NavNode, f64)> = None;
        for ring in 0..=max_ring {
            // Any candidate in an earlier ring closer than this ring's lower
            // bound cannot be beaten; stop expanding.
            let ring_floor_m = (ring - 1).max(0) as f64 * self.cell_m;
            if let Some((_, d)) = best {
                if d <= ring_floor_m {
                    break;
                }
            }
            for dx in -ring..=ring {
                for dy in -ring..=ring {
                    if dx.abs() != ring && dy.abs() != ring {
                        continue; // only the ring boundary
                    }
                    let key = (center.0, center.1 + dx, center.2 + dy);
                    let Some(ids) = self.grid.get(&key) else { continue };
                    for id in ids {
                        let Some(node) = self.nodes.get(id) else { continue };
                        if !filter(node) {
                            continue;
                        }
                        let d = p.horizontal_distance(&node.position);
                        if d <= max_radius_m && best.map_or(true, |(_, bd)| d < bd) {
                            best = Some((node, d));
                        }
                    }
                }
            }
        }
        best.map(|(n, _)| n)
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// Single-writer, many-reader store. `snapshot()` is wait-free for readers
/// apart from the pointer clone.
#[derive(Debug)]
pub struct GraphStore {
    current: RwLock<Arc<GraphSnapshot>>,
    cell_m: f64,
}

impl GraphStore {
    /// Build the store from a loaded facility map. Edges referencing unknown
    /// nodes are rejected.
    pub fn new(config: &GraphConfig, nodes: Vec<NavNode>, edges: Vec<NavEdge>) -> CoreResult<Self> {
        let cell_m = config.grid_cell_m;
        let node_map: HashMap<String, NavNode> =
            nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let mut adjacency: HashMap<String, Vec<NavEdge>> = HashMap::new();
        let mut edge_index: HashMap<String, (String, usize)> = HashMap::new();
        for edge in edges {
            if !node_map.contains_key(&edge.from_id) || !node_map.contains_key(&edge.to_id) {
                return Err(CoreError::InvalidInput(format!(
                    "edge {} references unknown node ({} -> {})",
                    edge.id, edge.from_id, edge.to_id
                )));
            }
            if edge_index.contains_key(&edge.id) {
                return Err(CoreError::InvalidInput(format!("duplicate edge id {}", edge.id)));
            }
            let list = adjacency.entry(edge.from_id.clone()).or_default();
            edge_index.insert(edge.id.clone(), (edge.from_id.clone(), list.len()));
            list.push(edge);
        }

        let mut grid: HashMap<GridKey, Vec<String>> = HashMap::new();
        for node in node_map.values() {
            grid.entry(GraphSnapshot::grid_key(cell_m, &node.position))
                .or_default()
                .push(node.id.clone());
        }

        let snapshot = GraphSnapshot {
            version: 1,
            nodes: node_map,
            adjacency,
            edge_index,
            grid,
            cell_m,
        };
        info!(
            "graph loaded: {} nodes, {} edges, version {}",
            snapshot.node_count(),
            snapshot.edge_count(),
            snapshot.version
        );
        Ok(Self { current: RwLock::new(Arc::new(snapshot)), cell_m })
    }

    /// Current immutable view.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.current.read().expect("graph snapshot lock poisoned").clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Apply edge patches and publish a new snapshot. A patch set that
    /// changes nothing is a no-op and does not bump the version, which keeps
    /// repeated facility updates idempotent.
    ///
    /// Returns the version current after the call and the IDs of edges that
    /// actually changed.
    pub fn patch_edges(&self, patches: &[EdgePatch]) -> (u64, Vec<String>) {
        let mut guard = self.current.write().expect("graph snapshot lock poisoned");
        let base = guard.clone();

        let mut adjacency = base.adjacency.clone();
        let mut changed = Vec::new();
        for patch in patches {
            let Some((from, idx)) = base.edge_index.get(&patch.edge_id) else {
                debug!("patch for unknown edge {} skipped", patch.edge_id);
                continue;
            };
            let Some(edge) = adjacency.get_mut(from).and_then(|l| l.get_mut(*idx)) else {
                continue;
            };
            let mut touched = false;
            if let Some(status) = patch.status {
                if edge.status != status {
                    edge.status = status;
                    touched = true;
                }
            }
            if let Some(weight) = patch.dynamic_weight {
                if (edge.dynamic_weight - weight).abs() > 1e-9 {
                    edge.dynamic_weight = weight;
                    touched = true;
                }
            }
            if touched {
                changed.push(patch.edge_id.clone());
            }
        }

        if changed.is_empty() {
            return (base.version, changed);
        }

        let next = GraphSnapshot {
            version: base.version + 1,
            nodes: base.nodes.clone(),
            adjacency,
            edge_index: base.edge_index.clone(),
            grid: base.grid.clone(),
            cell_m: self.cell_m,
        };
        debug!("graph patched: {} edges changed, version {}", changed.len(), next.version);
        *guard = Arc::new(next);
        (guard.version, changed)
    }

    /// Replace the whole graph (facility reload). Resets to a fresh version
    /// lineage above the current one so stale cache entries cannot collide.
    pub fn reload(&self, nodes: Vec<NavNode>, edges: Vec<NavEdge>, config: &GraphConfig) -> CoreResult<u64> {
        let fresh = GraphStore::new(config, nodes, edges)?;
        let mut guard = self.current.write().expect("graph snapshot lock poisoned");
        let mut snapshot = Arc::try_unwrap(fresh.snapshot()).unwrap_or_else(|arc| (*arc).clone());
        snapshot.version = guard.version + 1;
        let version = snapshot.version;
        *guard = Arc::new(snapshot);
        info!("facility reloaded, graph version {version}");
        Ok(version)
    }
}

impl Clone for GraphSnapshot {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            nodes: self.nodes.clone(),
            adjacency: self.adjacency.clone(),
            edge_index: self.edge_index.clone(),
            grid: self.grid.clone(),
            cell_m: self.cell_m,
        }
    }
}
