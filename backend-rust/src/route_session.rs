//! # route_session
//!
//! Route Session Manager — owns the active route for one user, evaluates
//! progress on every fused pose, and decides when to re-plan.
//!
//! The struct is plain state driven by its owning session actor: pose
//! evaluations return `RouteAction`s and the actor turns them into planner
//! calls and subscriber events. At most one re-plan is in flight per user;
//! triggers that arrive while one is pending coalesce into it.

use std::sync::Arc;

use tracing::{debug, info};
use wayfind_types::{FusedPose, LocalPoint, OptimizationSpec, Route};

use crate::config::TrackingConfig;
use crate::graph::GraphSnapshot;

// ── Status & actions ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSessionStatus {
    Idle,
    Active,
    Paused,
    Recomputing,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanReason {
    Deviation,
    HazardInvalidated,
    FacilityInvalidated,
}

/// What the owning actor must do after an evaluation step.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    /// Route finished; emit `route_completed`.
    Completed,
    /// A sustained deviation was counted (informational).
    DeviationCounted { count: u32 },
    /// Kick off a re-plan from the current pose to the original destination.
    RequestReplan { reason: ReplanReason },
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct RouteSession {
    config: TrackingConfig,
    status: RouteSessionStatus,
    route: Option<Arc<Route>>,
    /// Index of the edge currently being traversed.
    progress_index: usize,
    deviation_count: u32,
    deviation_started_ms: Option<i64>,
    replan_in_flight: bool,
    /// Original destination; re-plans keep aiming here.
    destination: Option<LocalPoint>,
    optimization: OptimizationSpec,
}

impl RouteSession {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            status: RouteSessionStatus::Idle,
            route: None,
            progress_index: 0,
            deviation_count: 0,
            deviation_started_ms: None,
            replan_in_flight: false,
            destination: None,
            optimization: OptimizationSpec::default(),
        }
    }

    pub fn status(&self) -> RouteSessionStatus {
        self.status
    }

    pub fn route(&self) -> Option<&Arc<Route>> {
        self.route.as_ref()
    }

    pub fn progress_index(&self) -> usize {
        self.progress_index
    }

    pub fn optimization(&self) -> &OptimizationSpec {
        &self.optimization
    }

    pub fn destination(&self) -> Option<LocalPoint> {
        self.destination
    }

    pub fn replan_pending(&self) -> bool {
        self.replan_in_flight
    }

    /// Install a freshly planned route and begin tracking it.
    pub fn start(&mut self, route: Arc<Route>, destination: LocalPoint, optimization: OptimizationSpec) {
        info!("route session started: {} ({} edges)", route.id, route.edges.len());
        self.route = Some(route);
        self.destination = Some(destination);
        self.optimization = optimization;
        self.status = RouteSessionStatus::Active;
        self.progress_index = 0;
        self.deviation_count = 0;
        self.deviation_started_ms = None;
        self.replan_in_flight = false;
    }

    pub fn cancel(&mut self) -> bool {
        if matches!(self.status, RouteSessionStatus::Idle | RouteSessionStatus::Cancelled) {
            return false;
        }
        self.status = RouteSessionStatus::Cancelled;
        self.route = None;
        self.replan_in_flight = false;
        true
    }

    pub fn pause(&mut self) {
        if self.status == RouteSessionStatus::Active {
            self.status = RouteSessionStatus::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.status == RouteSessionStatus::Paused {
            self.status = RouteSessionStatus::Active;
        }
    }

    /// Evaluate one fused pose against the active route.
    pub fn on_pose(&mut self, pose: &FusedPose, graph: &GraphSnapshot) -> Vec<RouteAction> {
        let mut actions = Vec::new();
        if self.status != RouteSessionStatus::Active {
            return actions;
        }
        let Some(route) = self.route.clone() else {
            return actions;
        };
        let now_ms = pose.timestamp_ns / 1_000_000;
        let p = &pose.position;

        // Arrival first: within the radius of the destination node.
        if let Some(dest_id) = route.path.last() {
            if let Some(dest) = graph.node(dest_id) {
                if dest.position.floor == p.floor
                    && dest.position.horizontal_distance(p) <= self.config.arrival_radius_m
                {
                    info!("route {} completed", route.id);
                    self.status = RouteSessionStatus::Completed;
                    self.route = None;
                    actions.push(RouteAction::Completed);
                    return actions;
                }
            }
        }

        // Project onto the remaining edges; progress never moves backwards.
        let mut best: Option<(usize, f64)> = None;
        for (i, edge) in route.edges.iter().enumerate().skip(self.progress_index) {
            let (Some(from), Some(to)) = (graph.node(&edge.from_id), graph.node(&edge.to_id))
            else {
                continue;
            };
            if from.position.floor != p.floor && to.position.floor != p.floor {
                continue;
            }
            let d = point_segment_distance(p, &from.position, &to.position);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }

        let Some((edge_idx, distance)) = best else {
            // No remaining edge shares the user's floor; treat as deviating.
            self.track_deviation(f64::INFINITY, now_ms, &mut actions);
            return actions;
        };
        if edge_idx > self.progress_index {
            debug!("progress {} -> {} on route {}", self.progress_index, edge_idx, route.id);
            self.progress_index = edge_idx;
        }

        self.track_deviation(distance, now_ms, &mut actions);
        actions
    }

    fn track_deviation(&mut self, distance_m: f64, now_ms: i64, actions: &mut Vec<RouteAction>) {
        if distance_m <= self.config.deviation_threshold_m {
            self.deviation_started_ms = None;
            return;
        }
        let since = *self.deviation_started_ms.get_or_insert(now_ms);
        if now_ms - since < self.config.deviation_sustain_ms as i64 {
            return;
        }
        // One count per sustained window; the timer re-arms.
        self.deviation_started_ms = Some(now_ms);
        self.deviation_count += 1;
        debug!("sustained deviation #{} ({distance_m:.1} m off route)", self.deviation_count);
        actions.push(RouteAction::DeviationCounted { count: self.deviation_count });

        if self.deviation_count >= self.config.deviations_before_replan && !self.replan_in_flight {
            self.deviation_count = 0;
            self.begin_replan();
            actions.push(RouteAction::RequestReplan { reason: ReplanReason::Deviation });
        }
    }

    /// A facility/hazard event touched the remaining route. Returns the
    /// re-plan action unless one is already in flight.
    pub fn on_edges_invalidated(
        &mut self,
        changed_edges: &std::collections::HashSet<String>,
        reason: ReplanReason,
    ) -> Option<RouteAction> {
        if !matches!(self.status, RouteSessionStatus::Active | RouteSessionStatus::Paused) {
            return None;
        }
        let route = self.route.as_ref()?;
        let affected = route.edges[self.progress_index.min(route.edges.len())..]
            .iter()
            .any(|e| changed_edges.contains(&e.id));
        if !affected {
            return None;
        }
        if self.replan_in_flight {
            // Coalesce into the pending re-plan.
            return None;
        }
        info!("remaining route invalidated ({reason:?}); recomputing");
        self.begin_replan();
        Some(RouteAction::RequestReplan { reason })
    }

    fn begin_replan(&mut self) {
        self.status = RouteSessionStatus::Recomputing;
        self.replan_in_flight = true;
        self.deviation_started_ms = None;
    }

    /// Result of the re-plan the actor kicked off.
    /// On failure the old route stays visible, flagged stale.
    pub fn on_replan_result(&mut self, result: Result<Arc<Route>, crate::error::CoreError>) -> Option<Arc<Route>> {
        self.replan_in_flight = false;
        if self.status == RouteSessionStatus::Cancelled {
            return None;
        }
        match result {
            Ok(route) => {
                self.route = Some(route.clone());
                self.progress_index = 0;
                self.deviation_count = 0;
                self.deviation_started_ms = None;
                self.status = RouteSessionStatus::Active;
                Some(route)
            }
            Err(_) => {
                if let Some(old) = self.route.take() {
                    let mut stale = (*old).clone();
                    stale.stale = true;
                    self.route = Some(Arc::new(stale));
                }
                // Remain Recomputing; the next pose or an explicit cancel
                // moves the session on.
                None
            }
        }
    }
}

/// Horizontal distance from `p` to the segment a→b.
fn point_segment_distance(p: &LocalPoint, a: &LocalPoint, b: &LocalPoint) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq <= f64::EPSILON {
        0.0
    } else {
        (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a.x + t * dx, a.y + t * dy);
    ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::error::CoreError;
    use crate::graph::GraphStore;
    use std::collections::HashSet;
    use wayfind_types::{
        AccessFlags, ComputeMeta, EdgeStatus, FrameKind, NavEdge, NavNode, NodeKind,
        RouteMetrics, SourceWeights, TraversalMode,
    };

    fn node(id: &str, x: f64, y: f64) -> NavNode {
        NavNode {
            id: id.into(),
            position: LocalPoint::new(x, y, 0.0, 0),
            kind: NodeKind::Walkway,
            access: AccessFlags::default(),
            name: String::new(),
        }
    }

    fn edge(id: &str, from: &str, to: &str, d: f64) -> NavEdge {
        NavEdge {
            id: id.into(),
            from_id: from.into(),
            to_id: to.into(),
            distance_m: d,
            base_time_s: d / 1.2,
            mode: TraversalMode::Walk,
            status: EdgeStatus::Operational,
            constraints: Default::default(),
            wait_time_s: 0.0,
            accessibility_score: 1.0,
            dynamic_weight: 1.0,
        }
    }

    fn graph() -> Arc<GraphStore> {
        Arc::new(
            GraphStore::new(
                &GraphConfig::default(),
                vec![node("a", 0.0, 0.0), node("b", 10.0, 0.0), node("c", 10.0, 10.0), node("d", 20.0, 10.0)],
                vec![edge("e-ab", "a", "b", 10.0), edge("e-bc", "b", "c", 10.0), edge("e-cd", "c", "d", 10.0)],
            )
            .unwrap(),
        )
    }

    fn route() -> Arc<Route> {
        Arc::new(Route {
            id: "route-1".into(),
            path: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            edges: vec![edge("e-ab", "a", "b", 10.0), edge("e-bc", "b", "c", 10.0), edge("e-cd", "c", "d", 10.0)],
            metrics: RouteMetrics {
                total_distance_m: 30.0,
                estimated_time_s: 25.0,
                elevation_change: 0,
                accessibility_score: 1.0,
            },
            instructions: vec![],
            meta: ComputeMeta {
                algorithm: "astar".into(),
                compute_ms: 1,
                nodes_expanded: 4,
                graph_version: 1,
            },
            optimization: OptimizationSpec::default(),
            origin_timestamp_ms: 0,
            stale: false,
        })
    }

    fn pose(x: f64, y: f64, t_ms: i64) -> FusedPose {
        FusedPose {
            position: LocalPoint::new(x, y, 0.0, 0),
            covariance: [[0.0; 4]; 4],
            velocity: [0.0; 3],
            weights: SourceWeights::default(),
            confidence: 0.9,
            accuracy_m: 1.0,
            frame: FrameKind::Indoor,
            timestamp_ns: t_ms * 1_000_000,
        }
    }

    fn active_session() -> RouteSession {
        let mut s = RouteSession::new(TrackingConfig::default());
        s.start(route(), LocalPoint::new(20.0, 10.0, 0.0, 0), OptimizationSpec::default());
        s
    }

    #[test]
    fn progress_advances_monotonically() {
        let g = graph().snapshot();
        let mut s = active_session();
        assert!(s.on_pose(&pose(5.0, 0.5, 0), &g).is_empty());
        assert_eq!(s.progress_index(), 0);
        assert!(s.on_pose(&pose(10.0, 5.0, 1_000), &g).is_empty());
        assert_eq!(s.progress_index(), 1);
        // noisy pose near the start does not roll progress back
        assert!(s.on_pose(&pose(9.0, 1.0, 2_000), &g).is_empty());
        assert!(s.progress_index() >= 1);
    }

    #[test]
    fn arrival_completes_route() {
        let g = graph().snapshot();
        let mut s = active_session();
        let actions = s.on_pose(&pose(19.0, 10.0, 0), &g);
        assert_eq!(actions, vec![RouteAction::Completed]);
        assert_eq!(s.status(), RouteSessionStatus::Completed);
        assert!(s.route().is_none());
    }

    #[test]
    fn second_sustained_deviation_triggers_replan() {
        let g = graph().snapshot();
        let mut s = active_session();

        // 12 m off edge a->b, sustained
        assert!(s.on_pose(&pose(5.0, 12.0, 0), &g).is_empty());
        let a1 = s.on_pose(&pose(5.0, 12.0, 2_500), &g);
        assert_eq!(a1, vec![RouteAction::DeviationCounted { count: 1 }]);

        let a2 = s.on_pose(&pose(5.0, 12.0, 5_000), &g);
        assert_eq!(
            a2,
            vec![
                RouteAction::DeviationCounted { count: 2 },
                RouteAction::RequestReplan { reason: ReplanReason::Deviation },
            ]
        );
        assert_eq!(s.status(), RouteSessionStatus::Recomputing);
        assert!(s.replan_pending());

        // success returns to Active with the counter reset
        let new_route = route();
        let installed = s.on_replan_result(Ok(new_route.clone()));
        assert!(installed.is_some());
        assert_eq!(s.status(), RouteSessionStatus::Active);
        assert_eq!(s.progress_index(), 0);
    }

    #[test]
    fn returning_to_route_resets_sustain_timer() {
        let g = graph().snapshot();
        let mut s = active_session();
        assert!(s.on_pose(&pose(5.0, 12.0, 0), &g).is_empty());
        // back on the route before the sustain window elapses
        assert!(s.on_pose(&pose(5.0, 0.5, 1_000), &g).is_empty());
        // deviating again starts a fresh window
        assert!(s.on_pose(&pose(5.0, 12.0, 1_500), &g).is_empty());
        assert!(s.on_pose(&pose(5.0, 12.0, 3_000), &g).is_empty());
        let actions = s.on_pose(&pose(5.0, 12.0, 3_600), &g);
        assert_eq!(actions, vec![RouteAction::DeviationCounted { count: 1 }]);
    }

    #[test]
    fn invalidation_of_remaining_edge_requests_replan_once() {
        let mut s = active_session();
        let changed: HashSet<String> = ["e-bc".to_string()].into();
        let action = s.on_edges_invalidated(&changed, ReplanReason::HazardInvalidated);
        assert_eq!(
            action,
            Some(RouteAction::RequestReplan { reason: ReplanReason::HazardInvalidated })
        );
        assert_eq!(s.status(), RouteSessionStatus::Recomputing);
        // duplicate triggers coalesce while the re-plan is pending
        assert!(s.on_edges_invalidated(&changed, ReplanReason::HazardInvalidated).is_none());
    }

    #[test]
    fn invalidation_behind_progress_is_ignored() {
        let g = graph().snapshot();
        let mut s = active_session();
        s.on_pose(&pose(10.0, 5.0, 0), &g); // progress onto e-bc
        let changed: HashSet<String> = ["e-ab".to_string()].into();
        assert!(s.on_edges_invalidated(&changed, ReplanReason::FacilityInvalidated).is_none());
        assert_eq!(s.status(), RouteSessionStatus::Active);
    }

    #[test]
    fn failed_replan_keeps_stale_route_visible() {
        let mut s = active_session();
        let changed: HashSet<String> = ["e-ab".to_string()].into();
        s.on_edges_invalidated(&changed, ReplanReason::HazardInvalidated);
        let installed = s.on_replan_result(Err(CoreError::NoRouteFound {
            from: "a".into(),
            to: "d".into(),
        }));
        assert!(installed.is_none());
        assert_eq!(s.status(), RouteSessionStatus::Recomputing);
        assert!(s.route().unwrap().stale);
    }

    #[test]
    fn cancel_discards_replan_result() {
        let mut s = active_session();
        let changed: HashSet<String> = ["e-ab".to_string()].into();
        s.on_edges_invalidated(&changed, ReplanReason::HazardInvalidated);
        assert!(s.cancel());
        assert!(s.on_replan_result(Ok(route())).is_none());
        assert_eq!(s.status(), RouteSessionStatus::Cancelled);
    }
}
