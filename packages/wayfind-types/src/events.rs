use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::coords::FrameKind;
use crate::route::Route;
use crate::zones::Severity;

/// Subscription wire protocol version, sent in the `hello` frame.
pub const PROTOCOL_VERSION: u32 = 1;

// ── Topics ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Pose,
    Route,
    Instruction,
    HazardAlert,
    Transition,
    FacilityChange,
}

impl Topic {
    /// Lossy topics may be dropped/coalesced under backpressure; critical
    /// topics block briefly and then coalesce to latest.
    pub fn is_lossy(&self) -> bool {
        matches!(self, Topic::Pose | Topic::FacilityChange)
    }

    pub const ALL: [Topic; 6] = [
        Topic::Pose,
        Topic::Route,
        Topic::Instruction,
        Topic::HazardAlert,
        Topic::Transition,
        Topic::FacilityChange,
    ];
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One event on the subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrame {
    pub topic: Topic,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Unix milliseconds UTC.
    pub timestamp: i64,
    pub payload: Value,
}

/// First frame on every subscription connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloFrame {
    pub protocol_version: u32,
    pub graph_version: u64,
    pub server_version: String,
}

// ── Typed payloads ────────────────────────────────────────────────────────────

/// Frame handoff committed for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionEvent {
    pub from: FrameKind,
    pub to: FrameKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProximityKind {
    Entered,
    Approaching,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HazardAlertEvent {
    pub zone_id: String,
    pub kind: ProximityKind,
    pub severity: Severity,
    /// Signed distance to the zone boundary, meters (negative inside).
    pub distance_m: f64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteEventKind {
    RouteUpdated,
    RouteCompleted,
    RouteUnavailable,
    RouteCancelled,
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEvent {
    pub kind: RouteEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Route>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ── Error body ────────────────────────────────────────────────────────────────

/// Wire form of every surfaced failure (§ error taxonomy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wire_names() {
        assert_eq!(serde_json::to_string(&Topic::HazardAlert).unwrap(), "\"hazard_alert\"");
        assert_eq!(serde_json::to_string(&Topic::Pose).unwrap(), "\"pose\"");
    }

    #[test]
    fn lossy_split() {
        assert!(Topic::Pose.is_lossy());
        assert!(Topic::FacilityChange.is_lossy());
        assert!(!Topic::Route.is_lossy());
        assert!(!Topic::HazardAlert.is_lossy());
    }
}
