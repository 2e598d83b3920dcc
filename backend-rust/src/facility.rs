//! # facility
//!
//! Facility map loading. The map is an external read-only JSON document
//! holding the navigation graph, transition zones, baseline hazard/restricted
//! zones, and the BLE beacon survey. It is loaded once at startup (and again
//! on an administrative reload); a map that fails validation is a fatal
//! startup error (exit code 64).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use wayfind_types::{
    GeoPoint, HazardZone, LocalPoint, NavEdge, NavNode, RestrictedArea, TransitionZone,
};

use crate::error::{CoreError, CoreResult};

/// Surveyed BLE beacon: fixed transmitter at a known local position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BleBeacon {
    pub id: String,
    pub position: LocalPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measured_power_dbm: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilityMap {
    pub facility_id: String,
    #[serde(default)]
    pub name: String,
    /// WGS-84 reference origin of the local ENU frame.
    pub origin: GeoPoint,
    pub nodes: Vec<NavNode>,
    pub edges: Vec<NavEdge>,
    #[serde(default)]
    pub transition_zones: Vec<TransitionZone>,
    #[serde(default)]
    pub hazard_zones: Vec<HazardZone>,
    #[serde(default)]
    pub restricted_areas: Vec<RestrictedArea>,
    #[serde(default)]
    pub beacons: Vec<BleBeacon>,
}

impl FacilityMap {
    pub fn beacon_index(&self) -> HashMap<String, LocalPoint> {
        self.beacons.iter().map(|b| (b.id.clone(), b.position)).collect()
    }
}

/// Load and structurally validate a facility map. Graph-level validation
/// (dangling edges) happens when the graph store is built; this catches the
/// document-level problems.
pub async fn load_facility_map(path: &Path) -> CoreResult<FacilityMap> {
    let data = tokio::fs::read_to_string(path).await.map_err(|e| {
        CoreError::InvalidInput(format!("facility map unreadable at {}: {e}", path.display()))
    })?;
    let map: FacilityMap = serde_json::from_str(&data).map_err(|e| {
        CoreError::InvalidInput(format!("facility map parse error: {e}"))
    })?;

    if map.nodes.is_empty() {
        return Err(CoreError::InvalidInput("facility map has no nodes".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for node in &map.nodes {
        if !seen.insert(&node.id) {
            return Err(CoreError::InvalidInput(format!("duplicate node id {}", node.id)));
        }
    }
    for zone in &map.hazard_zones {
        for poly in &zone.geometry.polygons {
            if poly.ring.len() < 3 {
                return Err(CoreError::InvalidInput(format!(
                    "hazard zone {} has a degenerate ring",
                    zone.id
                )));
            }
        }
    }
    for zone in &map.transition_zones {
        if zone.radius_m <= 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "transition zone {} has non-positive radius",
                zone.id
            )));
        }
    }

    info!(
        "facility map {} loaded: {} nodes, {} edges, {} transition zones, {} beacons",
        map.facility_id,
        map.nodes.len(),
        map.edges.len(),
        map.transition_zones.len(),
        map.beacons.len()
    );
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfind_types::{FloorPolygon, HazardKind, Severity, ZoneGeometry, ZoneStatus};

    fn minimal_map_json() -> serde_json::Value {
        serde_json::json!({
            "facilityId": "apt-01",
            "name": "Test Terminal",
            "origin": { "lat": 47.43, "lon": 19.26, "alt": 130.0 },
            "nodes": [
                { "id": "a", "position": { "x": 0.0, "y": 0.0, "z": 0.0, "floor": 0 }, "kind": "WALKWAY" },
                { "id": "b", "position": { "x": 10.0, "y": 0.0, "z": 0.0, "floor": 0 }, "kind": "GATE", "name": "Gate B12" }
            ],
            "edges": [
                { "id": "e-ab", "fromId": "a", "toId": "b", "distanceM": 10.0, "baseTimeS": 8.0, "mode": "WALK" }
            ]
        })
    }

    #[tokio::test]
    async fn loads_minimal_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facility.json");
        std::fs::write(&path, minimal_map_json().to_string()).unwrap();
        let map = load_facility_map(&path).await.unwrap();
        assert_eq!(map.facility_id, "apt-01");
        assert_eq!(map.nodes.len(), 2);
        assert_eq!(map.edges[0].from_id, "a");
    }

    #[tokio::test]
    async fn duplicate_node_ids_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facility.json");
        let mut doc = minimal_map_json();
        doc["nodes"][1]["id"] = serde_json::json!("a");
        std::fs::write(&path, doc.to_string()).unwrap();
        assert_eq!(load_facility_map(&path).await.unwrap_err().code(), "invalid_input");
    }

    #[tokio::test]
    async fn missing_file_is_invalid_input() {
        let err = load_facility_map(Path::new("/nonexistent/facility.json")).await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn hazard_zone_serde_shape_matches_map_format() {
        let zone = HazardZone {
            id: "hz-1".into(),
            name: "Spill".into(),
            geometry: ZoneGeometry::single(FloorPolygon::new(0, vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]])),
            severity: Severity::Medium,
            kind: HazardKind::Maintenance,
            status: ZoneStatus::Active,
            proximity_threshold_m: 10.0,
            alert_cooldown_s: 30.0,
            valid_from_ms: None,
            valid_until_ms: None,
            blocked_edges: vec![],
        };
        let v = serde_json::to_value(&zone).unwrap();
        assert_eq!(v["severity"], "MEDIUM");
        assert_eq!(v["kind"], "MAINTENANCE");
        let back: HazardZone = serde_json::from_value(v).unwrap();
        assert_eq!(back, zone);
    }
}
