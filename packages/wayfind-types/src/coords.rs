use serde::{Deserialize, Serialize};

// ── Frames ────────────────────────────────────────────────────────────────────

/// Reference frame a fused pose is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    #[default]
    Indoor,
    Outdoor,
    /// Both frames simultaneously valid inside a transition zone.
    Transition,
}

// ── Points ────────────────────────────────────────────────────────────────────

/// Local facility-frame point (ENU meters, signed floor index).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LocalPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub floor: i32,
}

impl LocalPoint {
    pub fn new(x: f64, y: f64, z: f64, floor: i32) -> Self {
        Self { x, y, z, floor }
    }

    /// Horizontal (xy-plane) distance in meters, ignoring floor.
    pub fn horizontal_distance(&self, other: &LocalPoint) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    /// Full 3D Euclidean distance in meters.
    pub fn distance(&self, other: &LocalPoint) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }

    /// Compass bearing toward `other` in degrees: 0 = north (+y), 90 = east (+x).
    pub fn bearing_to(&self, other: &LocalPoint) -> f64 {
        let deg = (other.x - self.x).atan2(other.y - self.y).to_degrees();
        if deg < 0.0 {
            deg + 360.0
        } else {
            deg
        }
    }
}

/// Geodetic WGS-84 point. Altitude in meters above the ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
}

// ── Tagged position ───────────────────────────────────────────────────────────

/// A point in exactly one frame. Mixing frames requires the handoff transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionFix {
    Local(LocalPoint),
    Geo(GeoPoint),
}

impl PositionFix {
    pub fn as_local(&self) -> Option<&LocalPoint> {
        match self {
            PositionFix::Local(p) => Some(p),
            PositionFix::Geo(_) => None,
        }
    }

    pub fn as_geo(&self) -> Option<&GeoPoint> {
        match self {
            PositionFix::Geo(g) => Some(g),
            PositionFix::Local(_) => None,
        }
    }
}

/// A stored position: one frame, a monotonic timestamp, a 1-σ accuracy radius.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    #[serde(flatten)]
    pub fix: PositionFix,
    /// Nanoseconds since epoch, monotonic per producer.
    pub timestamp_ns: i64,
    /// 1-σ accuracy radius, meters.
    pub accuracy_m: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearing_cardinal_directions() {
        let origin = LocalPoint::new(0.0, 0.0, 0.0, 0);
        let north = LocalPoint::new(0.0, 10.0, 0.0, 0);
        let east = LocalPoint::new(10.0, 0.0, 0.0, 0);
        let west = LocalPoint::new(-10.0, 0.0, 0.0, 0);
        assert!((origin.bearing_to(&north) - 0.0).abs() < 1e-9);
        assert!((origin.bearing_to(&east) - 90.0).abs() < 1e-9);
        assert!((origin.bearing_to(&west) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn horizontal_distance_ignores_z_and_floor() {
        let a = LocalPoint::new(0.0, 0.0, 0.0, 0);
        let b = LocalPoint::new(3.0, 4.0, 12.0, 3);
        assert!((a.horizontal_distance(&b) - 5.0).abs() < 1e-12);
        assert!((a.distance(&b) - 13.0).abs() < 1e-12);
    }

    #[test]
    fn position_fix_serde_frame_tag() {
        let p = PositionFix::Local(LocalPoint::new(1.0, 2.0, 0.0, 1));
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["frame"], "LOCAL");
        let back: PositionFix = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }
}
