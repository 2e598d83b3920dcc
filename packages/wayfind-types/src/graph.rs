use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::coords::LocalPoint;

// ── Nodes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Walkway,
    Gate,
    Elevator,
    Escalator,
    Stairs,
    Entrance,
    PoiAnchor,
    Transition,
}

/// Per-node accessibility flags from the facility map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AccessFlags {
    #[serde(default)]
    pub wheelchair: bool,
    #[serde(default)]
    pub elevator_access: bool,
    #[serde(default)]
    pub braille: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavNode {
    pub id: String,
    pub position: LocalPoint,
    pub kind: NodeKind,
    #[serde(default)]
    pub access: AccessFlags,
    #[serde(default)]
    pub name: String,
}

// ── Edges ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraversalMode {
    Walk,
    Elevator,
    Escalator,
    MovingWalkway,
    Stairs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeStatus {
    #[default]
    Operational,
    Degraded,
    Closed,
    Maintenance,
}

/// Accessibility-constraint tag: edges carrying it cannot be used by
/// wheelchair-constrained routes.
pub const WHEELCHAIR_INACCESSIBLE: &str = "wheelchair_inaccessible";

/// Directed navigation edge. `dynamic_weight` is a multiplier maintained by
/// the facility broker from crowd density and hazard state (1.0 = unloaded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavEdge {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    pub distance_m: f64,
    /// Base traversal time at walking pace, seconds.
    pub base_time_s: f64,
    pub mode: TraversalMode,
    #[serde(default)]
    pub status: EdgeStatus,
    #[serde(default)]
    pub constraints: BTreeSet<String>,
    /// Carrier waiting-time penalty (elevator/escalator), seconds.
    #[serde(default)]
    pub wait_time_s: f64,
    /// How friendly this edge is to constrained users, in [0, 1].
    #[serde(default = "default_accessibility_score")]
    pub accessibility_score: f64,
    #[serde(default = "default_dynamic_weight")]
    pub dynamic_weight: f64,
}

fn default_accessibility_score() -> f64 {
    1.0
}

fn default_dynamic_weight() -> f64 {
    1.0
}

impl NavEdge {
    /// Closed and maintenance edges are untraversable for routing.
    pub fn is_traversable(&self) -> bool {
        !matches!(self.status, EdgeStatus::Closed | EdgeStatus::Maintenance)
    }

    pub fn is_wheelchair_accessible(&self) -> bool {
        !self.constraints.contains(WHEELCHAIR_INACCESSIBLE)
    }

    /// Estimated traversal time including carrier wait, seconds.
    pub fn estimated_time_s(&self) -> f64 {
        self.base_time_s + self.wait_time_s
    }
}
