use serde::{Deserialize, Serialize};

use crate::graph::{NavEdge, TraversalMode};

// ── Optimization spec ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizeCriterion {
    Shortest,
    #[default]
    Fastest,
    Accessible,
    Safest,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeWeights {
    pub distance: f64,
    pub time: f64,
    pub accessibility: f64,
    pub safety: f64,
}

impl Default for OptimizeWeights {
    fn default() -> Self {
        Self { distance: 1.0, time: 1.0, accessibility: 0.5, safety: 0.5 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RouteConstraints {
    #[serde(default)]
    pub wheelchair_required: bool,
    #[serde(default)]
    pub elevator_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_walking_distance_m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationSpec {
    #[serde(default)]
    pub criterion: OptimizeCriterion,
    #[serde(default)]
    pub weights: OptimizeWeights,
    #[serde(default)]
    pub constraints: RouteConstraints,
}

impl OptimizationSpec {
    /// Stable FNV-1a hash over the parameters' canonical bit pattern; part
    /// of the route-cache key.
    pub fn cache_hash(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut h = OFFSET;
        let mut mix = |bytes: &[u8]| {
            for &b in bytes {
                h ^= b as u64;
                h = h.wrapping_mul(PRIME);
            }
        };
        mix(&[self.criterion as u8]);
        for w in [
            self.weights.distance,
            self.weights.time,
            self.weights.accessibility,
            self.weights.safety,
        ] {
            mix(&w.to_bits().to_le_bytes());
        }
        mix(&[
            self.constraints.wheelchair_required as u8,
            self.constraints.elevator_only as u8,
        ]);
        mix(
            &self
                .constraints
                .max_walking_distance_m
                .unwrap_or(f64::NAN)
                .to_bits()
                .to_le_bytes(),
        );
        h
    }
}

// ── Instructions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstructionKind {
    Start,
    Continue,
    TurnLeft,
    TurnRight,
    FloorChange,
    FacilityUse,
    Arrive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    pub kind: InstructionKind,
    pub text: String,
    /// Node where the instruction applies.
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    /// Distance covered by this leg, meters.
    pub distance_m: f64,
    #[serde(default)]
    pub floor_delta: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<TraversalMode>,
}

// ── Route ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetrics {
    pub total_distance_m: f64,
    pub estimated_time_s: f64,
    /// Net floors climbed (signed).
    pub elevation_change: i32,
    pub accessibility_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeMeta {
    pub algorithm: String,
    pub compute_ms: u64,
    pub nodes_expanded: u64,
    pub graph_version: u64,
}

/// Immutable route snapshot. `path[i] → path[i+1]` is always connected by
/// `edges[i]`; the planner enforces this before publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub path: Vec<String>,
    pub edges: Vec<NavEdge>,
    pub metrics: RouteMetrics,
    pub instructions: Vec<Instruction>,
    pub meta: ComputeMeta,
    pub optimization: OptimizationSpec,
    pub origin_timestamp_ms: i64,
    /// Set when a hazard re-plan failed and this route is kept visible.
    #[serde(default)]
    pub stale: bool,
}

impl Route {
    /// Path/edge chain consistency: endpoints of `edges[i]` match
    /// `path[i] → path[i+1]`.
    pub fn is_consistent(&self) -> bool {
        if self.path.len() != self.edges.len() + 1 {
            return self.path.len() <= 1 && self.edges.is_empty();
        }
        self.edges
            .iter()
            .enumerate()
            .all(|(i, e)| e.from_id == self.path[i] && e.to_id == self.path[i + 1])
    }

    pub fn destination(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hash_distinguishes_specs() {
        let a = OptimizationSpec::default();
        let mut b = a;
        b.criterion = OptimizeCriterion::Safest;
        let mut c = a;
        c.constraints.wheelchair_required = true;
        assert_ne!(a.cache_hash(), b.cache_hash());
        assert_ne!(a.cache_hash(), c.cache_hash());
        assert_eq!(a.cache_hash(), OptimizationSpec::default().cache_hash());
    }
}
