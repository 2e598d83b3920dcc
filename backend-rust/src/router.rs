//! # router
//!
//! Route Planner — A\* over the current graph snapshot, subject to an
//! optimization spec.
//!
//! ## Architecture
//! Planning is CPU-bound and runs under `spawn_blocking` with a hard
//! deadline, an expansion cap, and a cooperative cancel flag. Results are
//! cached by `(startNode, endNode, optHash, graphVersion)` with per-key
//! single-flight so duplicate requests coalesce into one computation, and a
//! fair global semaphore bounds concurrent computations across all users.
//!
//! ## Determinism
//! Equal-cost alternatives tie-break on the lower edge ID, so two planners
//! over the same snapshot always return the same route.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;
use wayfind_types::{
    ComputeMeta, Instruction, InstructionKind, LocalPoint, NavEdge, NavNode, OptimizationSpec,
    OptimizeCriterion, Route, RouteMetrics, TraversalMode,
};

use crate::config::RouterConfig;
use crate::error::{CoreError, CoreResult};
use crate::graph::{GraphSnapshot, GraphStore};

// ── Injected capabilities ─────────────────────────────────────────────────────

/// Hazard severity lookup for the safest-route cost term. The geofence
/// engine implements this; tests supply fakes.
pub trait HazardScore: Send + Sync {
    /// Severity score in [0, 1] of the nearest active hazard to the edge,
    /// 0.0 when the edge is clear.
    fn edge_severity(&self, edge: &NavEdge) -> f64;
}

/// No hazards anywhere. Used at boot before the geofence engine is wired in
/// and by unit tests.
pub struct NoHazards;

impl HazardScore for NoHazards {
    fn edge_severity(&self, _edge: &NavEdge) -> f64 {
        0.0
    }
}

// ── Cost model ────────────────────────────────────────────────────────────────

fn effective_wait_s(edge: &NavEdge, config: &RouterConfig) -> f64 {
    // Map-provided carrier wait wins; the config default covers edges that
    // do not carry one.
    if edge.wait_time_s > 0.0 {
        edge.wait_time_s
    } else {
        config.elevator_penalty_s
    }
}

/// Cost of traversing `edge` under `spec`. `f64::INFINITY` = untraversable.
fn edge_cost(
    edge: &NavEdge,
    spec: &OptimizationSpec,
    config: &RouterConfig,
    hazard: &dyn HazardScore,
) -> f64 {
    if !edge.is_traversable() {
        return f64::INFINITY;
    }
    if spec.constraints.elevator_only
        && matches!(edge.mode, TraversalMode::Stairs | TraversalMode::Escalator)
    {
        return f64::INFINITY;
    }
    if spec.constraints.wheelchair_required && !edge.is_wheelchair_accessible() {
        return f64::INFINITY;
    }

    let mut cost = match spec.criterion {
        OptimizeCriterion::Shortest => edge.distance_m,
        _ => edge.base_time_s,
    };

    if spec.criterion != OptimizeCriterion::Shortest {
        match edge.mode {
            TraversalMode::Elevator => cost += effective_wait_s(edge, config),
            TraversalMode::Escalator => cost *= config.escalator_bonus,
            TraversalMode::Stairs => cost *= config.stairs_penalty,
            TraversalMode::Walk | TraversalMode::MovingWalkway => {}
        }
    }

    match spec.criterion {
        OptimizeCriterion::Safest => {
            let w = spec.weights.safety.clamp(0.0, 1.0);
            cost += config.safety_weight * w * hazard.edge_severity(edge);
        }
        OptimizeCriterion::Accessible => {
            let w = spec.weights.accessibility.clamp(0.0, 1.0);
            cost += config.accessibility_weight * w * (1.0 - edge.accessibility_score);
        }
        _ => {}
    }

    cost * edge.dynamic_weight.max(1.0)
}

/// Wall-clock seconds a user spends on `edge`, for route metrics. Mode
/// modifiers apply; criterion does not.
fn edge_travel_s(edge: &NavEdge, config: &RouterConfig) -> f64 {
    match edge.mode {
        TraversalMode::Elevator => edge.base_time_s + effective_wait_s(edge, config),
        TraversalMode::Escalator => edge.base_time_s * config.escalator_bonus,
        TraversalMode::Stairs => edge.base_time_s * config.stairs_penalty,
        TraversalMode::Walk | TraversalMode::MovingWalkway => edge.base_time_s,
    }
}

// ── A\* internals ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct OpenEntry {
    f: f64,
    g: f64,
    node: String,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.f == other.f && self.node == other.node
    }
}
impl Eq for OpenEntry {}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on f, then on node ID for a deterministic pop order.
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Heuristic {
    criterion: OptimizeCriterion,
    /// Admissible speed bound for time-based criteria, m/s.
    max_speed_mps: f64,
    /// Admissible per-floor cost bound.
    floor_cost: f64,
    goal: LocalPoint,
}

impl Heuristic {
    /// Derive admissible bounds from the snapshot: the fastest effective
    /// edge speed and the cheapest observed floor-change cost, capped by the
    /// configured floor penalty.
    fn new(snapshot: &GraphSnapshot, spec: &OptimizationSpec, config: &RouterConfig, goal: LocalPoint) -> Self {
        let mut max_speed = 1.4_f64;
        let mut min_floor_cost = config.floor_penalty_s;
        for edge in snapshot.edges() {
            if edge.base_time_s > 0.0 {
                max_speed = max_speed.max(edge.distance_m / edge.base_time_s);
            }
            let (Some(from), Some(to)) =
                (snapshot.node(&edge.from_id), snapshot.node(&edge.to_id))
            else {
                continue;
            };
            let dfloor = (to.position.floor - from.position.floor).abs();
            if dfloor > 0 {
                let per_floor = match spec.criterion {
                    OptimizeCriterion::Shortest => edge.distance_m / dfloor as f64,
                    _ => edge.base_time_s * config.escalator_bonus / dfloor as f64,
                };
                min_floor_cost = min_floor_cost.min(per_floor);
            }
        }
        // Escalator bonus can shrink effective time below base time.
        let max_speed_mps = max_speed / config.escalator_bonus.min(1.0);
        Self { criterion: spec.criterion, max_speed_mps, floor_cost: min_floor_cost, goal }
    }

    fn estimate(&self, node: &NavNode) -> f64 {
        let flat = node.position.horizontal_distance(&self.goal);
        let floors = (node.position.floor - self.goal.floor).abs() as f64;
        match self.criterion {
            OptimizeCriterion::Shortest => flat + floors * self.floor_cost,
            _ => flat / self.max_speed_mps + floors * self.floor_cost,
        }
    }
}

struct SearchOutcome {
    path: Vec<String>,
    edges: Vec<NavEdge>,
    cost: f64,
    nodes_expanded: u64,
}

#[allow(clippy::too_many_arguments)]
fn astar(
    snapshot: &GraphSnapshot,
    start: &str,
    goal: &str,
    spec: &OptimizationSpec,
    config: &RouterConfig,
    hazard: &dyn HazardScore,
    deadline: Instant,
    cancel: &AtomicBool,
) -> CoreResult<SearchOutcome> {
    let goal_node = snapshot
        .node(goal)
        .ok_or_else(|| CoreError::InvalidInput(format!("unknown node {goal}")))?;
    let heuristic = Heuristic::new(snapshot, spec, config, goal_node.position);

    let mut g_score: HashMap<String, f64> = HashMap::new();
    let mut came_from: HashMap<String, (String, NavEdge)> = HashMap::new();
    // Accumulated walking meters, for the max-walking-distance constraint.
    let mut walked: HashMap<String, f64> = HashMap::new();
    let mut open = BinaryHeap::new();

    g_score.insert(start.to_string(), 0.0);
    walked.insert(start.to_string(), 0.0);
    let start_node = snapshot
        .node(start)
        .ok_or_else(|| CoreError::InvalidInput(format!("unknown node {start}")))?;
    open.push(OpenEntry { f: heuristic.estimate(start_node), g: 0.0, node: start.to_string() });

    let mut expanded: u64 = 0;
    while let Some(entry) = open.pop() {
        if entry.node == goal {
            // Reconstruct
            let mut path = vec![goal.to_string()];
            let mut edges = Vec::new();
            let mut cursor = goal.to_string();
            while let Some((prev, edge)) = came_from.get(&cursor) {
                edges.push(edge.clone());
                path.push(prev.clone());
                cursor = prev.clone();
            }
            path.reverse();
            edges.reverse();
            return Ok(SearchOutcome { path, edges, cost: entry.g, nodes_expanded: expanded });
        }

        // Stale heap entry
        if entry.g > *g_score.get(&entry.node).unwrap_or(&f64::INFINITY) + 1e-9 {
            continue;
        }

        expanded += 1;
        if expanded % 256 == 0 {
            if cancel.load(AtomicOrdering::Relaxed) {
                return Err(CoreError::RouteCancelled { nodes_expanded: expanded });
            }
            if Instant::now() > deadline {
                return Err(CoreError::RouteTimeout { budget_ms: config.max_computation_ms });
            }
        }
        if expanded > config.max_expansions {
            return Err(CoreError::RouteTimeout { budget_ms: config.max_computation_ms });
        }

        let walked_here = *walked.get(&entry.node).unwrap_or(&0.0);
        for edge in snapshot.neighbors(&entry.node) {
            let cost = edge_cost(edge, spec, config, hazard);
            if !cost.is_finite() {
                continue;
            }
            if let Some(max_walk) = spec.constraints.max_walking_distance_m {
                let walk_add = if edge.mode == TraversalMode::Walk { edge.distance_m } else { 0.0 };
                if walked_here + walk_add > max_walk {
                    continue;
                }
            }
            let tentative = entry.g + cost;
            let current = g_score.get(&edge.to_id).copied().unwrap_or(f64::INFINITY);
            let improves = tentative < current - 1e-9;
            // Equal-cost alternative: keep the lower edge ID for determinism.
            let ties_lower = (tentative - current).abs() <= 1e-9
                && came_from
                    .get(&edge.to_id)
                    .map(|(_, e)| edge.id < e.id)
                    .unwrap_or(false);
            if improves || ties_lower {
                g_score.insert(edge.to_id.clone(), tentative);
                came_from.insert(edge.to_id.clone(), (entry.node.clone(), edge.clone()));
                let walk_add = if edge.mode == TraversalMode::Walk { edge.distance_m } else { 0.0 };
                walked.insert(edge.to_id.clone(), walked_here + walk_add);
                if improves {
                    let to_node = match snapshot.node(&edge.to_id) {
                        Some(n) => n,
                        None => continue,
                    };
                    open.push(OpenEntry {
                        f: tentative + heuristic.estimate(to_node),
                        g: tentative,
                        node: edge.to_id.clone(),
                    });
                }
            }
        }
    }

    Err(CoreError::NoRouteFound { from: start.to_string(), to: goal.to_string() })
}

// ── Instruction synthesis ─────────────────────────────────────────────────────

/// Relative bearing change in degrees, normalized to (−180, 180].
fn relative_bearing(incoming: f64, outgoing: f64) -> f64 {
    let mut delta = outgoing - incoming;
    while delta > 180.0 {
        delta -= 360.0;
    }
    while delta <= -180.0 {
        delta += 360.0;
    }
    delta
}

fn mode_label(mode: TraversalMode) -> &'static str {
    match mode {
        TraversalMode::Walk => "walk",
        TraversalMode::Elevator => "elevator",
        TraversalMode::Escalator => "escalator",
        TraversalMode::MovingWalkway => "moving walkway",
        TraversalMode::Stairs => "stairs",
    }
}

fn node_label(node: &NavNode) -> String {
    if node.name.is_empty() {
        node.id.clone()
    } else {
        node.name.clone()
    }
}

fn build_instructions(snapshot: &GraphSnapshot, path: &[String], edges: &[NavEdge]) -> Vec<Instruction> {
    let mut out = Vec::with_capacity(edges.len() + 2);
    if path.is_empty() {
        return out;
    }

    let first = snapshot.node(&path[0]);
    out.push(Instruction {
        kind: InstructionKind::Start,
        text: first
            .map(|n| format!("Start at {}", node_label(n)))
            .unwrap_or_else(|| "Start".to_string()),
        node_id: path[0].clone(),
        edge_id: None,
        distance_m: 0.0,
        floor_delta: 0,
        mode: None,
    });

    let mut prev_bearing: Option<f64> = None;
    for (i, edge) in edges.iter().enumerate() {
        let (Some(from), Some(to)) = (snapshot.node(&path[i]), snapshot.node(&path[i + 1])) else {
            continue;
        };
        let floor_delta = to.position.floor - from.position.floor;
        let bearing = from.position.bearing_to(&to.position);

        let (kind, text) = if matches!(
            edge.mode,
            TraversalMode::Elevator | TraversalMode::Escalator | TraversalMode::Stairs
        ) {
            (
                InstructionKind::FacilityUse,
                format!("Take the {} to floor {}", mode_label(edge.mode), to.position.floor),
            )
        } else if floor_delta != 0 {
            (
                InstructionKind::FloorChange,
                format!("Continue to floor {}", to.position.floor),
            )
        } else {
            match prev_bearing {
                None => (
                    InstructionKind::Continue,
                    format!("Head toward {}", node_label(to)),
                ),
                Some(incoming) => {
                    let delta = relative_bearing(incoming, bearing);
                    if delta > -135.0 && delta < -45.0 {
                        (
                            InstructionKind::TurnLeft,
                            format!("Turn left toward {}", node_label(to)),
                        )
                    } else if delta > 45.0 && delta < 135.0 {
                        (
                            InstructionKind::TurnRight,
                            format!("Turn right toward {}", node_label(to)),
                        )
                    } else {
                        (
                            InstructionKind::Continue,
                            format!("Continue toward {}", node_label(to)),
                        )
                    }
                }
            }
        };

        out.push(Instruction {
            kind,
            text,
            node_id: path[i].clone(),
            edge_id: Some(edge.id.clone()),
            distance_m: edge.distance_m,
            floor_delta,
            mode: Some(edge.mode),
        });
        prev_bearing = Some(bearing);
    }

    let last = path.last().expect("non-empty path");
    out.push(Instruction {
        kind: InstructionKind::Arrive,
        text: snapshot
            .node(last)
            .map(|n| format!("Arrive at {}", node_label(n)))
            .unwrap_or_else(|| "Arrive".to_string()),
        node_id: last.clone(),
        edge_id: None,
        distance_m: 0.0,
        floor_delta: 0,
        mode: None,
    });
    out
}

// ── Cache & planner ───────────────────────────────────────────────────────────

type CacheKey = (String, String, u64, u64);

struct CacheEntry {
    route: Arc<Route>,
    inserted: Instant,
}

type InflightResult = Option<CoreResult<Arc<Route>>>;

pub struct RoutePlanner {
    graph: Arc<GraphStore>,
    config: RouterConfig,
    hazard: Arc<dyn HazardScore>,
    cache: Mutex<HashMap<CacheKey, CacheEntry>>,
    inflight: tokio::sync::Mutex<HashMap<CacheKey, watch::Receiver<InflightResult>>>,
    /// Fair FIFO admission across all users.
    admission: Arc<Semaphore>,
}

impl RoutePlanner {
    pub fn new(graph: Arc<GraphStore>, config: RouterConfig, hazard: Arc<dyn HazardScore>) -> Self {
        let admission = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            graph,
            config,
            hazard,
            cache: Mutex::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            admission,
        }
    }

    pub fn set_hazard_score(&mut self, hazard: Arc<dyn HazardScore>) {
        self.hazard = hazard;
    }

    /// Snap a position to its nearest node, honoring accessibility
    /// constraints when required.
    pub fn snap(&self, snapshot: &GraphSnapshot, p: &LocalPoint, spec: &OptimizationSpec) -> CoreResult<String> {
        let wheelchair = spec.constraints.wheelchair_required;
        snapshot
            .nearest_node(p, self.config.max_search_radius_m, |n| {
                !wheelchair || n.access.wheelchair
            })
            .map(|n| n.id.clone())
            .ok_or(CoreError::NoNodesNearPosition { radius_m: self.config.max_search_radius_m })
    }

    /// Plan a route between two positions. Cached, single-flighted, admission
    /// controlled; honors `cancel` cooperatively.
    pub async fn plan(
        &self,
        start: LocalPoint,
        destination: LocalPoint,
        spec: OptimizationSpec,
        cancel: Arc<AtomicBool>,
    ) -> CoreResult<Arc<Route>> {
        let snapshot = self.graph.snapshot();
        let start_node = self.snap(&snapshot, &start, &spec)?;
        let goal_node = self.snap(&snapshot, &destination, &spec)?;
        self.plan_between(snapshot, start_node, goal_node, spec, cancel).await
    }

    /// Plan between already-snapped node IDs on the given snapshot.
    pub async fn plan_between(
        &self,
        snapshot: Arc<GraphSnapshot>,
        start_node: String,
        goal_node: String,
        spec: OptimizationSpec,
        cancel: Arc<AtomicBool>,
    ) -> CoreResult<Arc<Route>> {
        let key: CacheKey =
            (start_node.clone(), goal_node.clone(), spec.cache_hash(), snapshot.version);

        if let Some(route) = self.cache_get(&key) {
            return Ok(route);
        }

        // Single-flight: join an in-progress identical computation if any.
        let tx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(&key) {
                let mut rx = rx.clone();
                drop(inflight);
                loop {
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    if rx.changed().await.is_err() {
                        // Leader dropped without publishing; retry as leader.
                        return Box::pin(
                            self.plan_between(snapshot, start_node, goal_node, spec, cancel),
                        )
                        .await;
                    }
                }
            }
            let (tx, rx) = watch::channel(None);
            inflight.insert(key.clone(), rx);
            tx
        };

        let result = self.compute_admitted(&snapshot, &start_node, &goal_node, &spec, cancel).await;

        {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(&key);
        }
        let shared = result.map(Arc::new);
        let _ = tx.send(Some(shared.clone()));

        if let Ok(route) = &shared {
            self.cache_put(key, route.clone());
        }
        shared
    }

    async fn compute_admitted(
        &self,
        snapshot: &Arc<GraphSnapshot>,
        start_node: &str,
        goal_node: &str,
        spec: &OptimizationSpec,
        cancel: Arc<AtomicBool>,
    ) -> CoreResult<Route> {
        let budget = Duration::from_millis(self.config.max_computation_ms);
        let permit = tokio::time::timeout(budget, self.admission.clone().acquire_owned())
            .await
            .map_err(|_| CoreError::RouteTimeout { budget_ms: self.config.max_computation_ms })?
            .map_err(|_| CoreError::internal("router admission semaphore closed"))?;

        let snapshot = snapshot.clone();
        let config = self.config.clone();
        let hazard = self.hazard.clone();
        let start = start_node.to_string();
        let goal = goal_node.to_string();
        let spec = *spec;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let started = Instant::now();
            let deadline = started + Duration::from_millis(config.max_computation_ms);
            let outcome = astar(&snapshot, &start, &goal, &spec, &config, hazard.as_ref(), deadline, &cancel)?;
            Ok::<Route, CoreError>(finish_route(&snapshot, outcome, &spec, &config, started))
        });

        match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(CoreError::internal(&format!("planner task panicked: {join_err}"))),
        }
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Arc<Route>> {
        let cache = self.cache.lock().expect("route cache lock");
        let entry = cache.get(key)?;
        if entry.inserted.elapsed() > Duration::from_millis(self.config.cache_ttl_ms) {
            return None;
        }
        Some(entry.route.clone())
    }

    fn cache_put(&self, key: CacheKey, route: Arc<Route>) {
        let mut cache = self.cache.lock().expect("route cache lock");
        cache.insert(key, CacheEntry { route, inserted: Instant::now() });
    }

    /// Drop expired entries and entries computed against old graph versions.
    /// Called from the job wheel; stale entries are also bypassed lazily on
    /// access.
    pub fn prune_cache(&self) {
        let current_version = self.graph.version();
        let ttl = Duration::from_millis(self.config.cache_ttl_ms);
        let mut cache = self.cache.lock().expect("route cache lock");
        let before = cache.len();
        cache.retain(|(_, _, _, version), entry| {
            *version == current_version && entry.inserted.elapsed() <= ttl
        });
        if cache.len() != before {
            debug!("route cache pruned: {} -> {}", before, cache.len());
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }
}

fn finish_route(
    snapshot: &GraphSnapshot,
    outcome: SearchOutcome,
    spec: &OptimizationSpec,
    config: &RouterConfig,
    started: Instant,
) -> Route {
    let total_distance_m: f64 = outcome.edges.iter().map(|e| e.distance_m).sum();
    let estimated_time_s: f64 = outcome.edges.iter().map(|e| edge_travel_s(e, config)).sum();
    let accessibility_score = outcome
        .edges
        .iter()
        .map(|e| e.accessibility_score)
        .fold(1.0_f64, f64::min);
    let elevation_change = match (outcome.path.first(), outcome.path.last()) {
        (Some(a), Some(b)) => {
            let fa = snapshot.node(a).map(|n| n.position.floor).unwrap_or(0);
            let fb = snapshot.node(b).map(|n| n.position.floor).unwrap_or(0);
            fb - fa
        }
        _ => 0,
    };

    let instructions = build_instructions(snapshot, &outcome.path, &outcome.edges);
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;

    if outcome.cost.is_infinite() {
        warn!("route finished with non-finite cost; this is a planner bug");
    }

    Route {
        id: format!("route-{}", Uuid::new_v4()),
        path: outcome.path,
        edges: outcome.edges,
        metrics: RouteMetrics {
            total_distance_m,
            estimated_time_s,
            elevation_change,
            accessibility_score,
        },
        instructions,
        meta: ComputeMeta {
            algorithm: "astar".to_string(),
            compute_ms: started.elapsed().as_millis() as u64,
            nodes_expanded: outcome.nodes_expanded,
            graph_version: snapshot.version,
        },
        optimization: *spec,
        origin_timestamp_ms: now_ms,
        stale: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::graph::EdgePatch;
    use std::collections::BTreeSet;
    use wayfind_types::{AccessFlags, EdgeStatus, NodeKind, RouteConstraints};

    fn node(id: &str, x: f64, y: f64, floor: i32) -> wayfind_types::NavNode {
        wayfind_types::NavNode {
            id: id.into(),
            position: LocalPoint::new(x, y, floor as f64 * 4.0, floor),
            kind: NodeKind::Walkway,
            access: AccessFlags { wheelchair: true, elevator_access: true, braille: false },
            name: String::new(),
        }
    }

    fn walk_edge(id: &str, from: &str, to: &str, dist: f64) -> NavEdge {
        NavEdge {
            id: id.into(),
            from_id: from.into(),
            to_id: to.into(),
            distance_m: dist,
            base_time_s: dist / 1.2,
            mode: TraversalMode::Walk,
            status: EdgeStatus::Operational,
            constraints: BTreeSet::new(),
            wait_time_s: 0.0,
            accessibility_score: 1.0,
            dynamic_weight: 1.0,
        }
    }

    fn l_graph() -> Arc<GraphStore> {
        // A -(10)- B -(10)- C -(10)- D, with a detour A -> X -> D of 40 m
        let nodes = vec![
            node("a", 0.0, 0.0, 0),
            node("b", 10.0, 0.0, 0),
            node("c", 10.0, 10.0, 0),
            node("d", 20.0, 10.0, 0),
            node("x", 0.0, 20.0, 0),
        ];
        let edges = vec![
            walk_edge("e-ab", "a", "b", 10.0),
            walk_edge("e-bc", "b", "c", 10.0),
            walk_edge("e-cd", "c", "d", 10.0),
            walk_edge("e-ax", "a", "x", 20.0),
            walk_edge("e-xd", "x", "d", 25.0),
        ];
        Arc::new(GraphStore::new(&GraphConfig::default(), nodes, edges).unwrap())
    }

    fn planner(graph: Arc<GraphStore>) -> RoutePlanner {
        RoutePlanner::new(graph, RouterConfig::default(), Arc::new(NoHazards))
    }

    fn shortest() -> OptimizationSpec {
        OptimizationSpec { criterion: OptimizeCriterion::Shortest, ..Default::default() }
    }

    #[tokio::test]
    async fn plans_shortest_path_with_instructions() {
        let planner = planner(l_graph());
        let route = planner
            .plan(
                LocalPoint::new(0.0, 0.0, 0.0, 0),
                LocalPoint::new(20.0, 10.0, 0.0, 0),
                shortest(),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();

        assert_eq!(route.path, vec!["a", "b", "c", "d"]);
        assert!((route.metrics.total_distance_m - 30.0).abs() < 1e-9);
        assert!(route.is_consistent());

        let kinds: Vec<InstructionKind> = route.instructions.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![
                InstructionKind::Start,
                InstructionKind::Continue,
                InstructionKind::TurnLeft,
                InstructionKind::TurnRight,
                InstructionKind::Arrive,
            ]
        );
    }

    #[tokio::test]
    async fn closed_edge_forces_detour() {
        let graph = l_graph();
        graph.patch_edges(&[EdgePatch {
            edge_id: "e-bc".into(),
            status: Some(EdgeStatus::Closed),
            dynamic_weight: None,
        }]);
        let planner = planner(graph);
        let route = planner
            .plan(
                LocalPoint::new(0.0, 0.0, 0.0, 0),
                LocalPoint::new(20.0, 10.0, 0.0, 0),
                shortest(),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();
        assert_eq!(route.path, vec!["a", "x", "d"]);
    }

    #[tokio::test]
    async fn wheelchair_constraint_avoids_tagged_stairs() {
        // b and b2 on different floors, stairs (inaccessible) vs elevator
        let nodes = vec![node("a", 0.0, 0.0, 0), node("b", 10.0, 0.0, 0), node("b2", 10.0, 0.0, 1)];
        let mut stairs = walk_edge("st-1", "b", "b2", 5.0);
        stairs.mode = TraversalMode::Stairs;
        stairs.base_time_s = 15.0;
        stairs.constraints.insert(wayfind_types::graph::WHEELCHAIR_INACCESSIBLE.to_string());
        stairs.accessibility_score = 0.0;
        let mut lift = walk_edge("elv-1", "b", "b2", 5.0);
        lift.mode = TraversalMode::Elevator;
        lift.base_time_s = 15.0;
        lift.wait_time_s = 45.0;
        let edges = vec![walk_edge("e-ab", "a", "b", 10.0), stairs, lift];
        let graph = Arc::new(GraphStore::new(&GraphConfig::default(), nodes, edges).unwrap());
        let planner = planner(graph);

        let spec = OptimizationSpec {
            criterion: OptimizeCriterion::Fastest,
            constraints: RouteConstraints { wheelchair_required: true, ..Default::default() },
            ..Default::default()
        };
        let route = planner
            .plan(
                LocalPoint::new(0.0, 0.0, 0.0, 0),
                LocalPoint::new(10.0, 0.0, 4.0, 1),
                spec,
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap();
        assert!(route.edges.iter().any(|e| e.id == "elv-1"));
        assert!(route.edges.iter().all(|e| e.id != "st-1"));
        assert!((route.metrics.accessibility_score - 1.0).abs() < 1e-9);
    }

    struct SpotHazard;

    impl HazardScore for SpotHazard {
        fn edge_severity(&self, edge: &NavEdge) -> f64 {
            if edge.id == "e-bc" {
                1.0
            } else {
                0.0
            }
        }
    }

    #[tokio::test]
    async fn safest_route_detours_around_hazardous_edge() {
        let graph = l_graph();
        let spec = OptimizationSpec { criterion: OptimizeCriterion::Safest, ..Default::default() };
        let start = LocalPoint::new(0.0, 0.0, 0.0, 0);
        let dest = LocalPoint::new(20.0, 10.0, 0.0, 0);

        let clear = RoutePlanner::new(graph.clone(), RouterConfig::default(), Arc::new(NoHazards));
        let direct = clear.plan(start, dest, spec, Arc::new(AtomicBool::new(false))).await.unwrap();
        assert_eq!(direct.path, vec!["a", "b", "c", "d"]);

        let wary = RoutePlanner::new(graph, RouterConfig::default(), Arc::new(SpotHazard));
        let detour = wary.plan(start, dest, spec, Arc::new(AtomicBool::new(false))).await.unwrap();
        assert_eq!(detour.path, vec!["a", "x", "d"]);
    }

    #[tokio::test]
    async fn unreachable_destination_reports_no_route() {
        let nodes = vec![node("a", 0.0, 0.0, 0), node("z", 50.0, 0.0, 0)];
        let graph = Arc::new(GraphStore::new(&GraphConfig::default(), nodes, vec![]).unwrap());
        let planner = planner(graph);
        let err = planner
            .plan(
                LocalPoint::new(0.0, 0.0, 0.0, 0),
                LocalPoint::new(50.0, 0.0, 0.0, 0),
                shortest(),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "no_route_found");
    }

    #[tokio::test]
    async fn snap_failure_reports_no_nodes() {
        let planner = planner(l_graph());
        let err = planner
            .plan(
                LocalPoint::new(10_000.0, 10_000.0, 0.0, 0),
                LocalPoint::new(20.0, 10.0, 0.0, 0),
                shortest(),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "no_nodes_near_position");
    }

    #[tokio::test]
    async fn cache_hits_same_key_and_misses_after_patch() {
        let graph = l_graph();
        let planner = planner(graph.clone());
        let start = LocalPoint::new(0.0, 0.0, 0.0, 0);
        let dest = LocalPoint::new(20.0, 10.0, 0.0, 0);
        let cancel = Arc::new(AtomicBool::new(false));

        let r1 = planner.plan(start, dest, shortest(), cancel.clone()).await.unwrap();
        let r2 = planner.plan(start, dest, shortest(), cancel.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&r1, &r2)); // cache hit returns the same snapshot

        graph.patch_edges(&[EdgePatch {
            edge_id: "e-bc".into(),
            status: Some(EdgeStatus::Closed),
            dynamic_weight: None,
        }]);
        let r3 = planner.plan(start, dest, shortest(), cancel).await.unwrap();
        assert_eq!(r3.path, vec!["a", "x", "d"]);
    }

    #[tokio::test]
    async fn cancelled_plan_reports_route_cancelled() {
        let cancel = Arc::new(AtomicBool::new(true));
        // A cancel flag set before the search only trips at the periodic
        // check, so use a long chain to guarantee expansions happen.
        let mut nodes = vec![node("s", 0.0, 0.0, 0)];
        let mut edges = Vec::new();
        for i in 0..2_000 {
            nodes.push(node(&format!("n{i}"), (i + 1) as f64, 0.0, 0));
            let from = if i == 0 { "s".to_string() } else { format!("n{}", i - 1) };
            edges.push(walk_edge(&format!("e{i:05}"), &from, &format!("n{i}"), 1.0));
        }
        let graph = Arc::new(GraphStore::new(&GraphConfig::default(), nodes, edges).unwrap());
        let planner2 = RoutePlanner::new(graph, RouterConfig::default(), Arc::new(NoHazards));
        let err = planner2
            .plan(
                LocalPoint::new(0.0, 0.0, 0.0, 0),
                LocalPoint::new(2_000.0, 0.0, 0.0, 0),
                shortest(),
                cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "route_cancelled");
    }

    #[test]
    fn relative_bearing_wraps() {
        assert!((relative_bearing(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((relative_bearing(10.0, 350.0) + 20.0).abs() < 1e-9);
        assert!((relative_bearing(90.0, 180.0) - 90.0).abs() < 1e-9);
    }
}
