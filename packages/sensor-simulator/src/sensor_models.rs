//! sensor_models.rs — Per-sensor noise and dropout models
//!
//! Turns a walker's ground-truth position into the sample batch a real
//! device would report:
//! 1. SLAM: position + Gaussian drift, confidence decaying with distance
//!    from the last "anchor relocalization"
//! 2. BLE: RSSI per in-range surveyed beacon via log-distance path loss
//!    with shadowing noise
//! 3. GPS: only emitted near the outdoor boundary, accuracy ramping with
//!    indoor depth
//!
//! The hub applies its own acceptance rules; this module deliberately emits
//! borderline-bad samples (stale CV, weak RSSI) so those paths get exercised.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use wayfind_types::{BeaconReading, GeoPoint, LocalPoint, PositionFix, SensorSample, SensorSource};

#[derive(Debug, Clone)]
pub struct SensorNoiseConfig {
    /// 1-σ SLAM position drift, meters.
    pub slam_sigma_m: f64,
    /// SLAM confidence range emitted while tracking normally.
    pub slam_confidence: (f64, f64),
    /// 1-σ RSSI shadowing noise, dB.
    pub rssi_sigma_db: f64,
    /// Path-loss exponent used to synthesize RSSI.
    pub path_loss_exponent: f64,
    /// Beacon transmit power at 1 m, dBm.
    pub measured_power_dbm: f64,
    /// Beacons farther than this do not appear in a scan, meters.
    pub ble_range_m: f64,
    /// GPS accuracy indoors deep in the building, meters.
    pub gps_accuracy_deep_m: f64,
    /// GPS accuracy right at the entrance, meters.
    pub gps_accuracy_door_m: f64,
    /// Probability a given source drops out of one batch entirely.
    pub dropout_probability: f64,
}

impl Default for SensorNoiseConfig {
    fn default() -> Self {
        Self {
            slam_sigma_m: 0.3,
            slam_confidence: (0.7, 0.95),
            rssi_sigma_db: 4.0,
            path_loss_exponent: 2.2,
            measured_power_dbm: -59.0,
            ble_range_m: 25.0,
            gps_accuracy_deep_m: 45.0,
            gps_accuracy_door_m: 4.0,
            dropout_probability: 0.05,
        }
    }
}

/// Surveyed beacon in the simulated facility.
#[derive(Debug, Clone)]
pub struct SimBeacon {
    pub id: String,
    pub position: LocalPoint,
}

/// A transition doorway: GPS quality improves as walkers come near.
#[derive(Debug, Clone)]
pub struct SimDoorway {
    pub position: LocalPoint,
    pub geo: GeoPoint,
    pub radius_m: f64,
}

/// Per-walker sensor overrides driven by the scenario (SLAM degradation in
/// the doorway, forced GPS, ...).
#[derive(Debug, Clone, Default)]
pub struct SensorOverrides {
    pub slam_confidence: Option<f64>,
    pub force_gps: bool,
    pub suppress_slam: bool,
}

pub fn synth_rssi(
    distance_m: f64,
    config: &SensorNoiseConfig,
    rng: &mut impl Rng,
) -> f64 {
    let noise = Normal::new(0.0, config.rssi_sigma_db).expect("valid sigma");
    config.measured_power_dbm - 10.0 * config.path_loss_exponent * distance_m.max(0.1).log10()
        + noise.sample(rng)
}

/// Build one sample batch for a walker at `truth`.
pub fn sample_batch(
    truth: &LocalPoint,
    timestamp_ns: i64,
    beacons: &[SimBeacon],
    doorways: &[SimDoorway],
    overrides: &SensorOverrides,
    config: &SensorNoiseConfig,
    rng: &mut impl Rng,
) -> Vec<SensorSample> {
    let mut batch = Vec::new();
    let drift = Normal::new(0.0, config.slam_sigma_m).expect("valid sigma");

    // SLAM
    if !overrides.suppress_slam && !rng.gen_bool(config.dropout_probability) {
        let confidence = overrides
            .slam_confidence
            .unwrap_or_else(|| rng.gen_range(config.slam_confidence.0..config.slam_confidence.1));
        batch.push(SensorSample {
            source: SensorSource::Slam,
            timestamp_ns,
            position: Some(PositionFix::Local(LocalPoint::new(
                truth.x + drift.sample(rng),
                truth.y + drift.sample(rng),
                truth.z,
                truth.floor,
            ))),
            accuracy_m: Some(config.slam_sigma_m),
            confidence: Some(confidence),
            beacons: vec![],
        });
    }

    // BLE scan over in-range beacons
    if !rng.gen_bool(config.dropout_probability) {
        let readings: Vec<BeaconReading> = beacons
            .iter()
            .filter(|b| b.position.floor == truth.floor)
            .filter_map(|b| {
                let d = b.position.horizontal_distance(truth);
                if d > config.ble_range_m {
                    return None;
                }
                Some(BeaconReading {
                    beacon_id: b.id.clone(),
                    rssi_dbm: synth_rssi(d, config, rng),
                    measured_power_dbm: Some(config.measured_power_dbm),
                })
            })
            .collect();
        if !readings.is_empty() {
            batch.push(SensorSample {
                source: SensorSource::Ble,
                timestamp_ns,
                position: None,
                accuracy_m: None,
                confidence: None,
                beacons: readings,
            });
        }
    }

    // GPS near doorways (or forced by the scenario)
    let nearest_door = doorways
        .iter()
        .map(|d| (d, d.position.horizontal_distance(truth)))
        .min_by(|a, b| a.1.total_cmp(&b.1));
    if let Some((door, dist)) = nearest_door {
        let in_reach = dist <= door.radius_m * 2.0;
        if overrides.force_gps || in_reach {
            // accuracy interpolates from door-grade to useless with depth
            let frac = (dist / (door.radius_m * 2.0)).clamp(0.0, 1.0);
            let accuracy = config.gps_accuracy_door_m
                + frac * (config.gps_accuracy_deep_m - config.gps_accuracy_door_m);
            let lat_noise = Normal::new(0.0, accuracy / 111_111.0 / 3.0).expect("valid sigma");
            batch.push(SensorSample {
                source: SensorSource::Gps,
                timestamp_ns,
                position: Some(PositionFix::Geo(GeoPoint {
                    lat: door.geo.lat + lat_noise.sample(rng),
                    lon: door.geo.lon + lat_noise.sample(rng),
                    alt: door.geo.alt,
                })),
                accuracy_m: Some(accuracy),
                confidence: None,
                beacons: vec![],
            });
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }

    #[test]
    fn rssi_decays_with_distance() {
        let config = SensorNoiseConfig { rssi_sigma_db: 0.0, ..Default::default() };
        let mut r = rng();
        let near = synth_rssi(1.0, &config, &mut r);
        let far = synth_rssi(20.0, &config, &mut r);
        assert!((near - config.measured_power_dbm).abs() < 1e-9);
        assert!(far < near - 20.0);
    }

    #[test]
    fn batch_contains_slam_and_ble_when_in_range() {
        let config = SensorNoiseConfig { dropout_probability: 0.0, ..Default::default() };
        let beacons = vec![SimBeacon { id: "b1".into(), position: LocalPoint::new(5.0, 0.0, 0.0, 0) }];
        let truth = LocalPoint::new(0.0, 0.0, 0.0, 0);
        let batch = sample_batch(
            &truth,
            0,
            &beacons,
            &[],
            &SensorOverrides::default(),
            &config,
            &mut rng(),
        );
        assert!(batch.iter().any(|s| s.source == SensorSource::Slam));
        assert!(batch.iter().any(|s| s.source == SensorSource::Ble));
        assert!(batch.iter().all(|s| s.source != SensorSource::Gps));
    }

    #[test]
    fn gps_appears_only_near_doorways() {
        let config = SensorNoiseConfig { dropout_probability: 0.0, ..Default::default() };
        let doors = vec![SimDoorway {
            position: LocalPoint::new(100.0, 0.0, 0.0, 0),
            geo: GeoPoint { lat: 47.45, lon: 19.06, alt: 120.0 },
            radius_m: 15.0,
        }];
        let deep = sample_batch(
            &LocalPoint::new(0.0, 0.0, 0.0, 0),
            0,
            &[],
            &doors,
            &SensorOverrides::default(),
            &config,
            &mut rng(),
        );
        assert!(deep.iter().all(|s| s.source != SensorSource::Gps));

        let near = sample_batch(
            &LocalPoint::new(95.0, 0.0, 0.0, 0),
            0,
            &[],
            &doors,
            &SensorOverrides::default(),
            &config,
            &mut rng(),
        );
        let gps = near.iter().find(|s| s.source == SensorSource::Gps).expect("gps near door");
        assert!(gps.accuracy_m.unwrap() < 15.0);
    }
}
