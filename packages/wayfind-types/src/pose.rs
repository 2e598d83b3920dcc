use serde::{Deserialize, Serialize};

use crate::coords::{FrameKind, LocalPoint, PositionFix};

// ── Sensor input ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorSource {
    Slam,
    Ble,
    Cv,
    Gps,
    Imu,
}

impl SensorSource {
    /// Base observation noise, meters (1-σ). Tunable via fusion config;
    /// these are the shipping defaults.
    pub fn base_noise_m(&self) -> f64 {
        match self {
            SensorSource::Slam => 0.5,
            SensorSource::Cv => 0.3,
            SensorSource::Ble => 2.0,
            SensorSource::Gps => 3.0,
            SensorSource::Imu => 1.0,
        }
    }
}

/// One BLE beacon observation inside a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeaconReading {
    pub beacon_id: String,
    pub rssi_dbm: f64,
    /// Calibrated RSSI at 1 m, if the beacon advertises one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measured_power_dbm: Option<f64>,
}

/// One raw sensor sample as ingested from a device.
///
/// BLE samples may carry only `beacons` (the hub trilaterates); every other
/// source carries a `position` in its native frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSample {
    pub source: SensorSource,
    pub timestamp_ns: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionFix>,
    /// Sensor-reported 1-σ accuracy, meters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    /// Tracking confidence in [0, 1] (SLAM/CV report this natively).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub beacons: Vec<BeaconReading>,
}

// ── Fused output ──────────────────────────────────────────────────────────────

/// Per-source contribution weights; the engine normalizes them to sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SourceWeights {
    pub slam: f64,
    pub ble: f64,
    pub cv: f64,
    pub gps: f64,
    pub imu: f64,
}

impl SourceWeights {
    pub fn sum(&self) -> f64 {
        self.slam + self.ble + self.cv + self.gps + self.imu
    }

    /// Scale so the weights sum to 1. A zero vector is left unchanged.
    pub fn normalized(mut self) -> Self {
        let s = self.sum();
        if s > f64::EPSILON {
            self.slam /= s;
            self.ble /= s;
            self.cv /= s;
            self.gps /= s;
            self.imu /= s;
        }
        self
    }

    pub fn set(&mut self, source: SensorSource, w: f64) {
        match source {
            SensorSource::Slam => self.slam = w,
            SensorSource::Ble => self.ble = w,
            SensorSource::Cv => self.cv = w,
            SensorSource::Gps => self.gps = w,
            SensorSource::Imu => self.imu = w,
        }
    }
}

/// Fused pose emitted downstream at up to 10 Hz per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusedPose {
    pub position: LocalPoint,
    /// 4×4 covariance over (x, y, z, heading), row-major.
    pub covariance: [[f64; 4]; 4],
    /// Velocity (vx, vy, vz), m/s.
    pub velocity: [f64; 3],
    pub weights: SourceWeights,
    /// Overall confidence in [0.1, 1.0], derived from the covariance trace.
    pub confidence: f64,
    /// Reported accuracy radius, meters.
    pub accuracy_m: f64,
    pub frame: FrameKind,
    pub timestamp_ns: i64,
}

impl FusedPose {
    /// Trace of the position+heading covariance block.
    pub fn covariance_trace(&self) -> f64 {
        (0..4).map(|i| self.covariance[i][i]).sum()
    }

    pub fn speed_mps(&self) -> f64 {
        (self.velocity[0].powi(2) + self.velocity[1].powi(2) + self.velocity[2].powi(2)).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_normalize_to_one() {
        let w = SourceWeights { slam: 2.0, ble: 1.0, cv: 1.0, gps: 0.0, imu: 0.0 }.normalized();
        assert!((w.sum() - 1.0).abs() < 1e-12);
        assert!((w.slam - 0.5).abs() < 1e-12);
    }

    #[test]
    fn zero_weights_stay_zero() {
        let w = SourceWeights::default().normalized();
        assert_eq!(w.sum(), 0.0);
    }

    #[test]
    fn sample_roundtrip_with_beacons() {
        let s = SensorSample {
            source: SensorSource::Ble,
            timestamp_ns: 42,
            position: None,
            accuracy_m: None,
            confidence: None,
            beacons: vec![BeaconReading {
                beacon_id: "b-7".into(),
                rssi_dbm: -71.0,
                measured_power_dbm: Some(-59.0),
            }],
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: SensorSample = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
