//! End-to-end routing scenarios over a hand-built terminal graph: basic
//! shortest-path planning with turn instructions, wheelchair-constrained
//! vertical movement, and cache/determinism behavior.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use wayfind_backend::config::{GraphConfig, RouterConfig};
use wayfind_backend::graph::{EdgePatch, GraphStore};
use wayfind_backend::router::{NoHazards, RoutePlanner};
use wayfind_types::{
    AccessFlags, EdgeStatus, InstructionKind, LocalPoint, NavEdge, NavNode, NodeKind,
    OptimizationSpec, OptimizeCriterion, RouteConstraints, TraversalMode,
};

fn node(id: &str, x: f64, y: f64, floor: i32) -> NavNode {
    NavNode {
        id: id.into(),
        position: LocalPoint::new(x, y, floor as f64 * 4.0, floor),
        kind: NodeKind::Walkway,
        access: AccessFlags { wheelchair: true, elevator_access: true, braille: false },
        name: String::new(),
    }
}

fn walk(id: &str, from: &str, to: &str, dist: f64) -> NavEdge {
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

fn both_ways(id: &str, a: &str, b: &str, dist: f64) -> [NavEdge; 2] {
    [walk(&format!("{id}-f"), a, b, dist), walk(&format!("{id}-r"), b, a, dist)]
}

fn planner_over(nodes: Vec<NavNode>, edges: Vec<NavEdge>) -> (Arc<GraphStore>, RoutePlanner) {
    let graph = Arc::new(GraphStore::new(&GraphConfig::default(), nodes, edges).unwrap());
    let planner = RoutePlanner::new(graph.clone(), RouterConfig::default(), Arc::new(NoHazards));
    (graph, planner)
}

fn shortest() -> OptimizationSpec {
    OptimizationSpec { criterion: OptimizeCriterion::Shortest, ..Default::default() }
}

fn cancel() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

// ── Basic route with instruction synthesis ────────────────────────────────────

#[tokio::test]
async fn basic_route_path_metrics_and_instructions() {
    let nodes = vec![
        node("a", 0.0, 0.0, 0),
        node("b", 10.0, 0.0, 0),
        node("c", 10.0, 10.0, 0),
        node("d", 20.0, 10.0, 0),
    ];
    let edges = vec![
        walk("e-ab", "a", "b", 10.0),
        walk("e-bc", "b", "c", 10.0),
        walk("e-cd", "c", "d", 10.0),
    ];
    let (_, planner) = planner_over(nodes, edges);

    let route = planner
        .plan(
            LocalPoint::new(0.0, 0.0, 0.0, 0),
            LocalPoint::new(20.0, 10.0, 0.0, 0),
            shortest(),
            cancel(),
        )
        .await
        .unwrap();

    assert_eq!(route.path, vec!["a", "b", "c", "d"]);
    assert!((route.metrics.total_distance_m - 30.0).abs() < 1e-9);
    assert!(route.is_consistent());
    assert_eq!(route.meta.algorithm, "astar");

    // East, then north (left turn), then east again (right turn).
    let kinds: Vec<InstructionKind> = route.instructions.iter().map(|i| i.kind).collect();
    assert_eq!(kinds.first(), Some(&InstructionKind::Start));
    assert_eq!(kinds.last(), Some(&InstructionKind::Arrive));
    assert_eq!(kinds[2], InstructionKind::TurnLeft);
    assert_eq!(kinds.len(), 5);
}

// ── Wheelchair constraint: stairs become unusable ─────────────────────────────

#[tokio::test]
async fn wheelchair_route_uses_elevator_despite_faster_stairs() {
    let mut nodes = vec![node("a", 0.0, 0.0, 0), node("b", 10.0, 0.0, 0)];
    nodes.push(node("b2", 10.0, 0.0, 1));

    let mut stairs = walk("stairs-b", "b", "b2", 5.0);
    stairs.mode = TraversalMode::Stairs;
    stairs.base_time_s = 15.0;
    stairs.constraints.insert("wheelchair_inaccessible".to_string());
    stairs.accessibility_score = 0.0;

    let mut lift = walk("elv-b", "b", "b2", 5.0);
    lift.mode = TraversalMode::Elevator;
    lift.base_time_s = 15.0;
    lift.wait_time_s = 45.0; // 60 s total including wait

    let edges = vec![walk("e-ab", "a", "b", 10.0), stairs, lift];
    let (_, planner) = planner_over(nodes, edges);

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
            cancel(),
        )
        .await
        .unwrap();

    assert!(route.edges.iter().any(|e| e.id == "elv-b"));
    assert!(route.edges.iter().all(|e| e.id != "stairs-b"));
    assert!((route.metrics.accessibility_score - 1.0).abs() < 1e-9);
    assert_eq!(route.metrics.elevation_change, 1);

    // Without the constraint the stairs win on time.
    let free = planner
        .plan(
            LocalPoint::new(0.0, 0.0, 0.0, 0),
            LocalPoint::new(10.0, 0.0, 4.0, 1),
            OptimizationSpec { criterion: OptimizeCriterion::Fastest, ..Default::default() },
            cancel(),
        )
        .await
        .unwrap();
    assert!(free.edges.iter().any(|e| e.id == "stairs-b"));
}

// ── Elevator-only constraint ──────────────────────────────────────────────────

#[tokio::test]
async fn elevator_only_forbids_escalators() {
    let nodes = vec![node("a", 0.0, 0.0, 0), node("a2", 0.0, 0.0, 1), node("b", 30.0, 0.0, 0), node("b2", 30.0, 0.0, 1)];
    let mut esc = walk("esc-a", "a", "a2", 5.0);
    esc.mode = TraversalMode::Escalator;
    esc.base_time_s = 12.0;
    let mut lift = walk("elv-b", "b", "b2", 5.0);
    lift.mode = TraversalMode::Elevator;
    lift.base_time_s = 20.0;
    lift.wait_time_s = 45.0;
    let mut edges = vec![esc, lift];
    edges.extend(both_ways("w-ab", "a", "b", 30.0));
    edges.extend(both_ways("w-ab2", "a2", "b2", 30.0));
    let (_, planner) = planner_over(nodes, edges);

    let spec = OptimizationSpec {
        criterion: OptimizeCriterion::Fastest,
        constraints: RouteConstraints { elevator_only: true, ..Default::default() },
        ..Default::default()
    };
    let route = planner
        .plan(
            LocalPoint::new(0.0, 0.0, 0.0, 0),
            LocalPoint::new(0.0, 0.0, 4.0, 1),
            spec,
            cancel(),
        )
        .await
        .unwrap();
    // forced the long way around through the elevator at b
    assert!(route.edges.iter().any(|e| e.id == "elv-b"));
    assert!(route.edges.iter().all(|e| !e.id.starts_with("esc")));
}

// ── Determinism: equal-cost alternatives tie-break on edge id ─────────────────

#[tokio::test]
async fn equal_cost_routes_are_deterministic() {
    // two parallel 20 m paths a -> m1/m2 -> d with identical costs
    let nodes = vec![
        node("a", 0.0, 0.0, 0),
        node("m1", 10.0, 5.0, 0),
        node("m2", 10.0, -5.0, 0),
        node("d", 20.0, 0.0, 0),
    ];
    let edges = vec![
        walk("e-am1", "a", "m1", 10.0),
        walk("e-am2", "a", "m2", 10.0),
        walk("e-m1d", "m1", "d", 10.0),
        walk("e-m2d", "m2", "d", 10.0),
    ];
    let (_, planner) = planner_over(nodes.clone(), edges.clone());

    let mut seen = None;
    for _ in 0..5 {
        let route = planner
            .plan(
                LocalPoint::new(0.0, 0.0, 0.0, 0),
                LocalPoint::new(20.0, 0.0, 0.0, 0),
                shortest(),
                cancel(),
            )
            .await
            .unwrap();
        match &seen {
            None => seen = Some(route.path.clone()),
            Some(path) => assert_eq!(&route.path, path),
        }
    }
    // and a freshly built planner agrees
    let (_, planner2) = planner_over(nodes, edges);
    let route2 = planner2
        .plan(
            LocalPoint::new(0.0, 0.0, 0.0, 0),
            LocalPoint::new(20.0, 0.0, 0.0, 0),
            shortest(),
            cancel(),
        )
        .await
        .unwrap();
    assert_eq!(Some(route2.path.clone()), seen);
}

// ── Cache interacts with graph versioning ─────────────────────────────────────

#[tokio::test]
async fn cache_is_bypassed_after_version_bump() {
    let nodes = vec![
        node("a", 0.0, 0.0, 0),
        node("b", 10.0, 0.0, 0),
        node("c", 20.0, 0.0, 0),
        node("x", 10.0, 30.0, 0),
    ];
    let edges = vec![
        walk("e-ab", "a", "b", 10.0),
        walk("e-bc", "b", "c", 10.0),
        walk("e-ax", "a", "x", 32.0),
        walk("e-xc", "x", "c", 32.0),
    ];
    let (graph, planner) = planner_over(nodes, edges);

    let start = LocalPoint::new(0.0, 0.0, 0.0, 0);
    let dest = LocalPoint::new(20.0, 0.0, 0.0, 0);
    let r1 = planner.plan(start, dest, shortest(), cancel()).await.unwrap();
    assert_eq!(r1.path, vec!["a", "b", "c"]);
    assert_eq!(r1.meta.graph_version, 1);

    graph.patch_edges(&[EdgePatch {
        edge_id: "e-ab".into(),
        status: Some(EdgeStatus::Closed),
        dynamic_weight: None,
    }]);

    let r2 = planner.plan(start, dest, shortest(), cancel()).await.unwrap();
    assert_eq!(r2.path, vec!["a", "x", "c"]);
    assert_eq!(r2.meta.graph_version, 2);
}

// ── Crowd weighting steers fastest routes ─────────────────────────────────────

#[tokio::test]
async fn dynamic_weight_diverts_fastest_route() {
    let nodes = vec![
        node("a", 0.0, 0.0, 0),
        node("m", 10.0, 0.0, 0),
        node("d", 20.0, 0.0, 0),
        node("x", 10.0, 8.0, 0),
    ];
    let edges = vec![
        walk("e-am", "a", "m", 10.0),
        walk("e-md", "m", "d", 10.0),
        walk("e-ax", "a", "x", 13.0),
        walk("e-xd", "x", "d", 13.0),
    ];
    let (graph, planner) = planner_over(nodes, edges);
    let start = LocalPoint::new(0.0, 0.0, 0.0, 0);
    let dest = LocalPoint::new(20.0, 0.0, 0.0, 0);

    let fastest = OptimizationSpec { criterion: OptimizeCriterion::Fastest, ..Default::default() };
    let direct = planner.plan(start, dest, fastest, cancel()).await.unwrap();
    assert_eq!(direct.path, vec!["a", "m", "d"]);

    // congestion triples the direct corridor's effective time
    graph.patch_edges(&[
        EdgePatch { edge_id: "e-am".into(), status: None, dynamic_weight: Some(3.0) },
        EdgePatch { edge_id: "e-md".into(), status: None, dynamic_weight: Some(3.0) },
    ]);
    let diverted = planner.plan(start, dest, fastest, cancel()).await.unwrap();
    assert_eq!(diverted.path, vec!["a", "x", "d"]);
}
