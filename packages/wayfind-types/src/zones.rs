use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::coords::{GeoPoint, LocalPoint};

// ── Polygon geometry ──────────────────────────────────────────────────────────

/// Closed ring of local xy coordinates on one floor. The ring is implicitly
/// closed; the last vertex connects back to the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloorPolygon {
    pub floor: i32,
    pub ring: Vec<[f64; 2]>,
}

impl FloorPolygon {
    pub fn new(floor: i32, ring: Vec<[f64; 2]>) -> Self {
        Self { floor, ring }
    }

    /// Axis-aligned bounding box: (min_x, min_y, max_x, max_y).
    pub fn bbox(&self) -> (f64, f64, f64, f64) {
        let mut bb = (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for v in &self.ring {
            bb.0 = bb.0.min(v[0]);
            bb.1 = bb.1.min(v[1]);
            bb.2 = bb.2.max(v[0]);
            bb.3 = bb.3.max(v[1]);
        }
        bb
    }

    /// Ray-casting point-in-polygon test (crossing number, xy plane).
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.ring.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (xi, yi) = (self.ring[i][0], self.ring[i][1]);
            let (xj, yj) = (self.ring[j][0], self.ring[j][1]);
            if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Unsigned distance from (x, y) to the polygon boundary: min over edges
    /// of the point-to-segment distance.
    pub fn boundary_distance(&self, x: f64, y: f64) -> f64 {
        let n = self.ring.len();
        if n == 0 {
            return f64::INFINITY;
        }
        if n == 1 {
            let d = ((x - self.ring[0][0]).powi(2) + (y - self.ring[0][1]).powi(2)).sqrt();
            return d;
        }
        let mut best = f64::INFINITY;
        let mut j = n - 1;
        for i in 0..n {
            let d = point_segment_distance(x, y, self.ring[j], self.ring[i]);
            best = best.min(d);
            j = i;
        }
        best
    }

    /// Signed distance: negative inside the polygon, positive outside.
    pub fn signed_distance(&self, x: f64, y: f64) -> f64 {
        let d = self.boundary_distance(x, y);
        if self.contains(x, y) {
            -d
        } else {
            d
        }
    }

    /// Whether the segment a→b (same floor) crosses or lies inside the polygon.
    pub fn intersects_segment(&self, a: [f64; 2], b: [f64; 2]) -> bool {
        if self.contains(a[0], a[1]) || self.contains(b[0], b[1]) {
            return true;
        }
        let n = self.ring.len();
        if n < 2 {
            return false;
        }
        let mut j = n - 1;
        for i in 0..n {
            if segments_intersect(a, b, self.ring[j], self.ring[i]) {
                return true;
            }
            j = i;
        }
        false
    }
}

fn point_segment_distance(x: f64, y: f64, a: [f64; 2], b: [f64; 2]) -> f64 {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    let len_sq = dx * dx + dy * dy;
    let t = if len_sq <= f64::EPSILON {
        0.0
    } else {
        (((x - a[0]) * dx + (y - a[1]) * dy) / len_sq).clamp(0.0, 1.0)
    };
    let (cx, cy) = (a[0] + t * dx, a[1] + t * dy);
    ((x - cx).powi(2) + (y - cy).powi(2)).sqrt()
}

fn segments_intersect(p1: [f64; 2], p2: [f64; 2], p3: [f64; 2], p4: [f64; 2]) -> bool {
    fn orient(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
        (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
    }
    fn on_segment(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> bool {
        p[0] >= a[0].min(b[0]) - 1e-12
            && p[0] <= a[0].max(b[0]) + 1e-12
            && p[1] >= a[1].min(b[1]) - 1e-12
            && p[1] <= a[1].max(b[1]) + 1e-12
    }
    let d1 = orient(p3, p4, p1);
    let d2 = orient(p3, p4, p2);
    let d3 = orient(p1, p2, p3);
    let d4 = orient(p1, p2, p4);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    (d1.abs() < 1e-12 && on_segment(p3, p4, p1))
        || (d2.abs() < 1e-12 && on_segment(p3, p4, p2))
        || (d3.abs() < 1e-12 && on_segment(p1, p2, p3))
        || (d4.abs() < 1e-12 && on_segment(p1, p2, p4))
}

/// Single- or multi-polygon zone footprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneGeometry {
    pub polygons: Vec<FloorPolygon>,
}

impl ZoneGeometry {
    pub fn single(poly: FloorPolygon) -> Self {
        Self { polygons: vec![poly] }
    }

    pub fn floors(&self) -> BTreeSet<i32> {
        self.polygons.iter().map(|p| p.floor).collect()
    }

    pub fn contains(&self, p: &LocalPoint) -> bool {
        self.polygons
            .iter()
            .any(|poly| poly.floor == p.floor && poly.contains(p.x, p.y))
    }

    /// Signed distance on the point's floor; +∞ if no polygon is on that floor.
    pub fn signed_distance(&self, p: &LocalPoint) -> f64 {
        self.polygons
            .iter()
            .filter(|poly| poly.floor == p.floor)
            .map(|poly| poly.signed_distance(p.x, p.y))
            .fold(f64::INFINITY, f64::min)
    }
}

// ── Hazard zones ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Safety-penalty score used by the safest-route cost function.
    pub fn score(&self) -> f64 {
        match self {
            Severity::Low => 0.25,
            Severity::Medium => 0.5,
            Severity::High => 0.75,
            Severity::Critical => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HazardKind {
    Construction,
    Security,
    Emergency,
    Maintenance,
    Weather,
    Capacity,
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneStatus {
    #[default]
    Active,
    Inactive,
    Pending,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HazardZone {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub geometry: ZoneGeometry,
    pub severity: Severity,
    pub kind: HazardKind,
    #[serde(default)]
    pub status: ZoneStatus,
    /// Approach alerts fire within this many meters of the boundary.
    #[serde(default = "default_proximity_threshold")]
    pub proximity_threshold_m: f64,
    /// Per-(user, zone) re-alert cooldown, seconds.
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_until_ms: Option<i64>,
    /// Edge IDs blocked by this zone, cached from the last recompute.
    #[serde(default)]
    pub blocked_edges: Vec<String>,
}

fn default_proximity_threshold() -> f64 {
    10.0
}

fn default_alert_cooldown() -> f64 {
    30.0
}

impl HazardZone {
    /// Active and inside the effective window at `now_ms`.
    pub fn is_effective(&self, now_ms: i64) -> bool {
        if self.status != ZoneStatus::Active {
            return false;
        }
        if let Some(from) = self.valid_from_ms {
            if now_ms < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until_ms {
            if now_ms > until {
                return false;
            }
        }
        true
    }
}

// ── Restricted areas ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessLevel {
    Public,
    Restricted,
    AuthorizedOnly,
    EmergencyOnly,
}

/// Open window for one weekday, minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayWindow {
    pub open_min: u16,
    pub close_min: u16,
}

/// Date-specific override, `date` as `YYYY-MM-DD` in the zone's timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateException {
    pub date: String,
    /// `None` = closed all day.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<DayWindow>,
}

/// Weekly schedule in a named timezone. The UTC offset is resolved at map
/// load; the name is retained for operator display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklySchedule {
    pub timezone: String,
    pub utc_offset_min: i32,
    /// Monday-first, `None` = closed that day.
    pub days: [Option<DayWindow>; 7],
    #[serde(default)]
    pub exceptions: Vec<DateException>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictedArea {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub geometry: ZoneGeometry,
    pub access_level: AccessLevel,
    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule: Option<WeeklySchedule>,
}

// ── Transition zones ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    Entrance,
    Exit,
    Gateway,
    Hybrid,
}

/// Affine correction between the raw ENU projection and the calibrated local
/// frame inside one transition zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneCalibration {
    /// 4×4 affine, row-major.
    pub affine: [[f64; 4]; 4],
    /// Scalar yaw correction, radians.
    pub rotation_rad: f64,
    pub offset: [f64; 3],
    pub calibrated_at_ms: i64,
}

impl ZoneCalibration {
    /// Identity calibration (fresh zones before any survey).
    pub fn identity(calibrated_at_ms: i64) -> Self {
        let mut affine = [[0.0; 4]; 4];
        for (i, row) in affine.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self { affine, rotation_rad: 0.0, offset: [0.0; 3], calibrated_at_ms }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionZone {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: TransitionKind,
    pub indoor_anchor: LocalPoint,
    pub outdoor_anchor: GeoPoint,
    pub radius_m: f64,
    pub calibration: ZoneCalibration,
    /// GPS accuracy must be at or below this to switch outdoor, meters.
    #[serde(default = "default_gps_min_accuracy")]
    pub gps_min_accuracy_m: f64,
    /// Indoor source confidence must be at or above this to switch indoor.
    #[serde(default = "default_indoor_min_confidence")]
    pub indoor_min_confidence: f64,
    /// Dual-frame transition commits after this long, milliseconds.
    #[serde(default = "default_switch_timeout")]
    pub switch_timeout_ms: u64,
}

fn default_gps_min_accuracy() -> f64 {
    10.0
}

fn default_indoor_min_confidence() -> f64 {
    0.4
}

fn default_switch_timeout() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_square(floor: i32) -> FloorPolygon {
        FloorPolygon::new(floor, vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]])
    }

    #[test]
    fn ray_cast_containment() {
        let poly = unit_square(0);
        assert!(poly.contains(5.0, 5.0));
        assert!(!poly.contains(15.0, 5.0));
        assert!(!poly.contains(-0.1, 5.0));
    }

    #[test]
    fn signed_distance_sign_convention() {
        let poly = unit_square(0);
        assert!((poly.signed_distance(5.0, 5.0) + 5.0).abs() < 1e-9);
        assert!((poly.signed_distance(13.0, 5.0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn segment_through_polygon_intersects() {
        let poly = unit_square(0);
        assert!(poly.intersects_segment([-5.0, 5.0], [15.0, 5.0]));
        assert!(poly.intersects_segment([5.0, 5.0], [5.0, 6.0])); // fully inside
        assert!(!poly.intersects_segment([-5.0, -5.0], [-1.0, -1.0]));
    }

    #[test]
    fn geometry_respects_floor() {
        let geom = ZoneGeometry::single(unit_square(2));
        assert!(geom.contains(&LocalPoint::new(5.0, 5.0, 0.0, 2)));
        assert!(!geom.contains(&LocalPoint::new(5.0, 5.0, 0.0, 0)));
        assert!(geom.signed_distance(&LocalPoint::new(5.0, 5.0, 0.0, 1)).is_infinite());
    }

    #[test]
    fn hazard_effective_window() {
        let mut z = HazardZone {
            id: "h1".into(),
            name: String::new(),
            geometry: ZoneGeometry::single(unit_square(0)),
            severity: Severity::High,
            kind: HazardKind::Construction,
            status: ZoneStatus::Active,
            proximity_threshold_m: 10.0,
            alert_cooldown_s: 30.0,
            valid_from_ms: Some(1_000),
            valid_until_ms: Some(2_000),
            blocked_edges: vec![],
        };
        assert!(!z.is_effective(500));
        assert!(z.is_effective(1_500));
        assert!(!z.is_effective(2_500));
        z.status = ZoneStatus::Resolved;
        assert!(!z.is_effective(1_500));
    }
}
