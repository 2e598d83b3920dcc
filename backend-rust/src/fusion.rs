//! # fusion
//!
//! Pose Fusion Engine — one Kalman filter per user over a constant-velocity
//! model, fed by heterogeneous, asynchronous sensor samples.
//!
//! State vector: `[x, y, z, heading, vx, vy, vz, vh]`. Each surviving
//! measurement applies as a position observation whose noise is the sensor's
//! base noise scaled by 1/confidence. Rejections never kill the filter; they
//! are counted, and sustained silence walks the tracking state machine
//! through Degraded to Lost.

use std::collections::VecDeque;

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};
use tracing::{debug, warn};
use wayfind_types::{
    BeaconReading, FrameKind, FusedPose, LocalPoint, SensorSample, SensorSource, SourceWeights,
};

use crate::config::FusionConfig;
use crate::handoff::HandoffEngine;

// ── BLE ranging ───────────────────────────────────────────────────────────────

/// Log-distance path-loss model: d = 10^((P_measured − RSSI) / (10·n)).
pub fn rssi_to_distance_m(rssi_dbm: f64, measured_power_dbm: f64, exponent: f64) -> f64 {
    10f64.powf((measured_power_dbm - rssi_dbm) / (10.0 * exponent))
}

/// Inverse-square weighted centroid over beacon fixes. Coarse next to the
/// filter's SLAM input, but it keeps tracking alive in beacon-dense halls.
/// Returns the fix and an accuracy estimate (mean beacon distance spread).
fn trilaterate(
    readings: &[(BeaconReading, LocalPoint, f64)],
) -> Option<(LocalPoint, f64)> {
    if readings.is_empty() {
        return None;
    }
    let mut wx = 0.0;
    let mut wy = 0.0;
    let mut wz = 0.0;
    let mut wsum = 0.0;
    for (_, pos, dist) in readings {
        let w = 1.0 / dist.max(0.5).powi(2);
        wx += pos.x * w;
        wy += pos.y * w;
        wz += pos.z * w;
        wsum += w;
    }
    let floor = readings[0].1.floor;
    let fix = LocalPoint::new(wx / wsum, wy / wsum, wz / wsum, floor);
    let spread = readings
        .iter()
        .map(|(_, pos, dist)| (pos.horizontal_distance(&fix) - dist).abs())
        .sum::<f64>()
        / readings.len() as f64;
    Some((fix, spread.max(1.0)))
}

// ── Prepared measurements ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Measurement {
    pub source: SensorSource,
    pub point: LocalPoint,
    pub noise_m: f64,
    pub confidence: f64,
    pub timestamp_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LowConfidence,
    WeakRssi,
    RangeOutOfBounds,
    Stale,
    PoorGpsAccuracy,
    Outlier,
    MissingPosition,
}

/// Context the session actor supplies per batch.
pub struct PrepContext<'a> {
    pub handoff: &'a HandoffEngine,
    pub beacons: &'a std::collections::HashMap<String, LocalPoint>,
    pub in_transition_zone: bool,
    pub floor_hint: i32,
    pub now_ns: i64,
}

/// Apply the per-source acceptance rules and resolve every surviving sample
/// into the local frame.
pub fn prepare_samples(
    samples: &[SensorSample],
    config: &FusionConfig,
    ctx: &PrepContext<'_>,
) -> (Vec<Measurement>, Vec<(SensorSource, RejectReason)>) {
    let mut accepted = Vec::with_capacity(samples.len());
    let mut rejected = Vec::new();

    for sample in samples {
        let confidence = sample.confidence.unwrap_or(0.5).clamp(0.0, 1.0);
        match sample.source {
            SensorSource::Slam => {
                if confidence < config.min_slam_confidence {
                    rejected.push((SensorSource::Slam, RejectReason::LowConfidence));
                    continue;
                }
                let Some(fix) = &sample.position else {
                    rejected.push((SensorSource::Slam, RejectReason::MissingPosition));
                    continue;
                };
                accepted.push(Measurement {
                    source: SensorSource::Slam,
                    point: ctx.handoff.resolve_local(fix, ctx.floor_hint),
                    noise_m: SensorSource::Slam.base_noise_m(),
                    confidence,
                    timestamp_ns: sample.timestamp_ns,
                });
            }
            SensorSource::Ble => {
                let usable: Vec<(BeaconReading, LocalPoint, f64)> = sample
                    .beacons
                    .iter()
                    .filter_map(|r| {
                        if r.rssi_dbm < config.min_ble_rssi_dbm {
                            rejected.push((SensorSource::Ble, RejectReason::WeakRssi));
                            return None;
                        }
                        let pos = ctx.beacons.get(&r.beacon_id)?;
                        let mp = r.measured_power_dbm.unwrap_or(config.ble_default_measured_power_dbm);
                        let d = rssi_to_distance_m(r.rssi_dbm, mp, config.ble_path_loss_exponent);
                        if d <= 0.0 || d > config.max_ble_distance_m {
                            rejected.push((SensorSource::Ble, RejectReason::RangeOutOfBounds));
                            return None;
                        }
                        Some((r.clone(), *pos, d))
                    })
                    .collect();
                if let Some((fix, spread)) = trilaterate(&usable) {
                    accepted.push(Measurement {
                        source: SensorSource::Ble,
                        point: fix,
                        noise_m: SensorSource::Ble.base_noise_m().max(spread),
                        confidence: (1.0 / (1.0 + spread)).clamp(0.1, 0.9),
                        timestamp_ns: sample.timestamp_ns,
                    });
                } else if let Some(fix) = &sample.position {
                    // Device-side fix without readings
                    accepted.push(Measurement {
                        source: SensorSource::Ble,
                        point: ctx.handoff.resolve_local(fix, ctx.floor_hint),
                        noise_m: SensorSource::Ble.base_noise_m(),
                        confidence,
                        timestamp_ns: sample.timestamp_ns,
                    });
                }
            }
            SensorSource::Cv => {
                let age_ms = (ctx.now_ns - sample.timestamp_ns) / 1_000_000;
                if age_ms > config.cv_staleness_ms as i64 {
                    rejected.push((SensorSource::Cv, RejectReason::Stale));
                    continue;
                }
                let Some(fix) = &sample.position else {
                    rejected.push((SensorSource::Cv, RejectReason::MissingPosition));
                    continue;
                };
                accepted.push(Measurement {
                    source: SensorSource::Cv,
                    point: ctx.handoff.resolve_local(fix, ctx.floor_hint),
                    noise_m: SensorSource::Cv.base_noise_m(),
                    confidence,
                    timestamp_ns: sample.timestamp_ns,
                });
            }
            SensorSource::Gps => {
                let accuracy = sample.accuracy_m.unwrap_or(f64::INFINITY);
                if accuracy > config.max_gps_accuracy_m && !ctx.in_transition_zone {
                    rejected.push((SensorSource::Gps, RejectReason::PoorGpsAccuracy));
                    continue;
                }
                let Some(fix) = &sample.position else {
                    rejected.push((SensorSource::Gps, RejectReason::MissingPosition));
                    continue;
                };
                accepted.push(Measurement {
                    source: SensorSource::Gps,
                    point: ctx.handoff.resolve_local(fix, ctx.floor_hint),
                    noise_m: SensorSource::Gps.base_noise_m().max(accuracy / 2.0),
                    confidence: (1.0 - accuracy / 30.0).clamp(0.1, 1.0),
                    timestamp_ns: sample.timestamp_ns,
                });
            }
            SensorSource::Imu => {
                // IMU is dead-reckoning support; without a position fix it
                // only tightens the predict step, which the CV model covers.
                if sample.position.is_none() {
                    continue;
                }
                let fix = sample.position.as_ref().expect("checked above");
                accepted.push(Measurement {
                    source: SensorSource::Imu,
                    point: ctx.handoff.resolve_local(fix, ctx.floor_hint),
                    noise_m: SensorSource::Imu.base_noise_m(),
                    confidence: confidence.min(0.5),
                    timestamp_ns: sample.timestamp_ns,
                });
            }
        }
    }

    accepted.sort_by_key(|m| m.timestamp_ns);
    (accepted, rejected)
}

// ── Strategy table ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionStrategy {
    SlamBleCv,
    SlamBle,
    SlamOnly,
    BleOnly,
    CvAnchor,
    GpsOnly,
    FusedHandoff,
}

/// Deterministic priority table over source availability. Dual-frame batches
/// inside a transition zone fuse both frames.
pub fn select_strategy(measurements: &[Measurement], in_transition_zone: bool) -> Option<FusionStrategy> {
    if measurements.is_empty() {
        return None;
    }
    let has = |s: SensorSource| measurements.iter().any(|m| m.source == s);
    let indoor = has(SensorSource::Slam) || has(SensorSource::Ble) || has(SensorSource::Cv);
    if in_transition_zone && has(SensorSource::Gps) && indoor {
        return Some(FusionStrategy::FusedHandoff);
    }
    Some(match (has(SensorSource::Slam), has(SensorSource::Ble), has(SensorSource::Cv)) {
        (true, true, true) => FusionStrategy::SlamBleCv,
        (true, true, false) => FusionStrategy::SlamBle,
        (true, false, _) => FusionStrategy::SlamOnly,
        (false, false, true) => FusionStrategy::CvAnchor,
        (false, true, _) => FusionStrategy::BleOnly,
        (false, false, false) => FusionStrategy::GpsOnly,
    })
}

// ── Filter ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Uninitialized,
    Tracking,
    Degraded,
    Lost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterEvent {
    PoseLost,
    PoseReset,
    Degraded,
    Recovered,
}

pub struct FusionOutcome {
    pub pose: Option<FusedPose>,
    pub strategy: Option<FusionStrategy>,
    pub events: Vec<FilterEvent>,
}

const STATE_DIM: usize = 8;
type StateVector = SVector<f64, STATE_DIM>;
type StateMatrix = SMatrix<f64, STATE_DIM, STATE_DIM>;

pub struct PoseFilter {
    config: FusionConfig,
    tracking: TrackingState,
    x: StateVector,
    p: StateMatrix,
    frame: FrameKind,
    last_measurement_ns: Option<i64>,
    last_emit_ns: Option<i64>,
    ring: VecDeque<FusedPose>,
    pub rejected_total: u64,
    pub outliers_total: u64,
    pub resets_total: u64,
}

impl PoseFilter {
    pub fn new(config: FusionConfig) -> Self {
        Self {
            config,
            tracking: TrackingState::Uninitialized,
            x: StateVector::zeros(),
            p: StateMatrix::identity() * 100.0,
            frame: FrameKind::Indoor,
            last_measurement_ns: None,
            last_emit_ns: None,
            ring: VecDeque::new(),
            rejected_total: 0,
            outliers_total: 0,
            resets_total: 0,
        }
    }

    pub fn tracking_state(&self) -> TrackingState {
        self.tracking
    }

    pub fn set_frame(&mut self, frame: FrameKind) {
        self.frame = frame;
    }

    pub fn frame(&self) -> FrameKind {
        self.frame
    }

    pub fn latest(&self) -> Option<&FusedPose> {
        self.ring.back()
    }

    pub fn ring(&self) -> impl Iterator<Item = &FusedPose> {
        self.ring.iter()
    }

    /// Constant-velocity predict over `dt` seconds.
    fn predict(&mut self, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        let mut f = StateMatrix::identity();
        for i in 0..4 {
            f[(i, i + 4)] = dt;
        }
        let mut q = StateMatrix::zeros();
        for i in 0..3 {
            q[(i, i)] = 0.05 * dt;
            q[(i + 4, i + 4)] = 0.5 * dt;
        }
        // Heading is only pseudo-observed from motion; keep its noise small
        // so stillness does not bleed confidence away.
        q[(3, 3)] = 0.001 * dt;
        q[(7, 7)] = 0.01 * dt;
        self.x = f * self.x;
        self.p = f * self.p * f.transpose() + q;
    }

    /// Position observation with noise σ = base × (1/confidence).
    fn update(&mut self, m: &Measurement) -> bool {
        let sigma = m.noise_m * (1.0 / m.confidence.max(0.05));
        let z = Vector3::new(m.point.x, m.point.y, m.point.z);

        let mut h = SMatrix::<f64, 3, STATE_DIM>::zeros();
        h[(0, 0)] = 1.0;
        h[(1, 1)] = 1.0;
        h[(2, 2)] = 1.0;

        let r = Matrix3::identity() * sigma * sigma;
        let y = z - h * self.x;
        let s = h * self.p * h.transpose() + r;
        let Some(s_inv) = s.try_inverse() else {
            warn!("innovation covariance singular; skipping update");
            return false;
        };
        let k = self.p * h.transpose() * s_inv;
        self.x += k * y;
        self.p = (StateMatrix::identity() - k * h) * self.p;

        // Heading pseudo-measurement from the motion direction once the user
        // is actually walking.
        let (vx, vy) = (self.x[4], self.x[5]);
        if (vx * vx + vy * vy).sqrt() > 0.5 {
            let measured = vx.atan2(vy);
            let mut innovation = measured - self.x[3];
            while innovation > std::f64::consts::PI {
                innovation -= 2.0 * std::f64::consts::PI;
            }
            while innovation < -std::f64::consts::PI {
                innovation += 2.0 * std::f64::consts::PI;
            }
            let s_h = self.p[(3, 3)] + 0.25;
            let k_h = self.p[(3, 3)] / s_h;
            self.x[3] += k_h * innovation;
            self.p[(3, 3)] *= 1.0 - k_h;
        }
        true
    }

    fn position_trace(&self) -> f64 {
        (0..4).map(|i| self.p[(i, i)]).sum()
    }

    fn reset_from(&mut self, m: &Measurement) {
        self.x = StateVector::zeros();
        self.x[0] = m.point.x;
        self.x[1] = m.point.y;
        self.x[2] = m.point.z;
        let mut p = StateMatrix::zeros();
        for (i, var) in [10.0, 10.0, 10.0, 1.0, 5.0, 5.0, 5.0, 0.5].iter().enumerate() {
            p[(i, i)] = *var;
        }
        self.p = p;
    }

    /// Process one prepared batch. Emits at most one pose, rate-capped.
    pub fn ingest(&mut self, measurements: &[Measurement], in_transition_zone: bool, floor: i32) -> FusionOutcome {
        let mut events = Vec::new();
        let strategy = select_strategy(measurements, in_transition_zone);

        if measurements.is_empty() {
            return FusionOutcome { pose: None, strategy, events };
        }

        let mut applied = 0usize;
        let mut weights = SourceWeights::default();
        let mut accuracy_num = 0.0;
        let mut active_sources: Vec<SensorSource> = Vec::new();

        for m in measurements {
            // Gate on tracking confidence before the filter is primed.
            if self.tracking == TrackingState::Uninitialized {
                if m.confidence < 0.1 {
                    continue;
                }
                self.reset_from(m);
                self.tracking = TrackingState::Tracking;
                self.last_measurement_ns = Some(m.timestamp_ns);
            }

            let last = self.last_measurement_ns.unwrap_or(m.timestamp_ns);
            let dt = ((m.timestamp_ns - last) as f64 / 1e9).max(0.0);

            // Outlier clamp on the implied velocity.
            if dt > 0.0 {
                let predicted = LocalPoint::new(self.x[0], self.x[1], self.x[2], floor);
                let implied = m.point.distance(&predicted) / dt.max(1e-3);
                if implied > self.config.max_velocity_mps && dt < 5.0 {
                    self.outliers_total += 1;
                    debug!(
                        "outlier from {:?}: implied velocity {implied:.1} m/s",
                        m.source
                    );
                    continue;
                }
            }

            self.predict(dt);
            if !self.update(m) {
                continue;
            }
            self.last_measurement_ns = Some(m.timestamp_ns);
            applied += 1;
            weights.set(m.source, weight_of(&weights, m.source) + m.confidence);
            accuracy_num += m.noise_m;
            if !active_sources.contains(&m.source) {
                active_sources.push(m.source);
            }
        }

        if applied == 0 {
            return FusionOutcome { pose: None, strategy, events };
        }

        if self.tracking != TrackingState::Tracking {
            events.push(FilterEvent::Recovered);
            self.tracking = TrackingState::Tracking;
        }

        // Divergence reset: re-prime from the best measurement seen now.
        if self.position_trace() > self.config.divergence_trace {
            let best = measurements
                .iter()
                .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
                .expect("non-empty batch");
            warn!("filter diverged (trace {:.1}); resetting", self.position_trace());
            self.reset_from(best);
            self.resets_total += 1;
            events.push(FilterEvent::PoseReset);
        }

        // Rate cap at the configured emit interval.
        let now_ns = self.last_measurement_ns.unwrap_or(0);
        if let Some(last_emit) = self.last_emit_ns {
            if (now_ns - last_emit) < self.config.min_emit_interval_ms as i64 * 1_000_000 {
                return FusionOutcome { pose: None, strategy, events };
            }
        }
        self.last_emit_ns = Some(now_ns);

        let trace = self.position_trace();
        let confidence = (1.0 / (1.0 + trace)).clamp(0.1, 1.0);
        let n_active = active_sources.len().max(1) as f64;
        let accuracy_m = (accuracy_num / applied as f64) / n_active.sqrt();

        let mut covariance = [[0.0; 4]; 4];
        for (i, row) in covariance.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = self.p[(i, j)];
            }
        }

        let pose = FusedPose {
            position: LocalPoint::new(self.x[0], self.x[1], self.x[2], floor),
            covariance,
            velocity: [self.x[4], self.x[5], self.x[6]],
            weights: weights.normalized(),
            confidence,
            accuracy_m,
            frame: self.frame,
            timestamp_ns: now_ns,
        };
        self.ring.push_back(pose.clone());
        while self.ring.len() > self.config.ring_buffer_len {
            self.ring.pop_front();
        }

        FusionOutcome { pose: Some(pose), strategy, events }
    }

    /// Timer-driven state walk; called from the session tick. Returns the
    /// transition events produced at this instant.
    pub fn tick(&mut self, now_ns: i64) -> Vec<FilterEvent> {
        let mut events = Vec::new();
        let Some(last) = self.last_measurement_ns else {
            return events;
        };
        let silence_ms = (now_ns - last) / 1_000_000;
        match self.tracking {
            TrackingState::Tracking => {
                if silence_ms >= self.config.lost_timeout_ms as i64 {
                    self.tracking = TrackingState::Lost;
                    events.push(FilterEvent::PoseLost);
                } else if silence_ms >= self.config.max_inter_sample_gap_ms as i64 {
                    self.tracking = TrackingState::Degraded;
                    events.push(FilterEvent::Degraded);
                }
            }
            TrackingState::Degraded => {
                if silence_ms >= self.config.lost_timeout_ms as i64 {
                    self.tracking = TrackingState::Lost;
                    events.push(FilterEvent::PoseLost);
                }
            }
            TrackingState::Lost | TrackingState::Uninitialized => {}
        }
        events
    }
}

fn weight_of(w: &SourceWeights, s: SensorSource) -> f64 {
    match s {
        SensorSource::Slam => w.slam,
        SensorSource::Ble => w.ble,
        SensorSource::Cv => w.cv,
        SensorSource::Gps => w.gps,
        SensorSource::Imu => w.imu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HandoffConfig;
    use std::collections::HashMap;
    use wayfind_types::{GeoPoint, PositionFix};

    fn handoff() -> HandoffEngine {
        HandoffEngine::new(
            HandoffConfig::default(),
            GeoPoint { lat: 47.45, lon: 19.06, alt: 100.0 },
            vec![],
        )
        .unwrap()
    }

    fn slam_sample(t_ms: i64, x: f64, y: f64, conf: f64) -> SensorSample {
        SensorSample {
            source: SensorSource::Slam,
            timestamp_ns: t_ms * 1_000_000,
            position: Some(PositionFix::Local(LocalPoint::new(x, y, 0.0, 0))),
            accuracy_m: Some(0.5),
            confidence: Some(conf),
            beacons: vec![],
        }
    }

    fn prep<'a>(h: &'a HandoffEngine, beacons: &'a HashMap<String, LocalPoint>, now_ms: i64) -> PrepContext<'a> {
        PrepContext {
            handoff: h,
            beacons,
            in_transition_zone: false,
            floor_hint: 0,
            now_ns: now_ms * 1_000_000,
        }
    }

    #[test]
    fn low_confidence_slam_is_rejected() {
        let h = handoff();
        let beacons = HashMap::new();
        let (acc, rej) = prepare_samples(
            &[slam_sample(0, 1.0, 1.0, 0.05)],
            &FusionConfig::default(),
            &prep(&h, &beacons, 0),
        );
        assert!(acc.is_empty());
        assert_eq!(rej, vec![(SensorSource::Slam, RejectReason::LowConfidence)]);
    }

    #[test]
    fn stale_cv_and_poor_gps_are_dropped() {
        let h = handoff();
        let beacons = HashMap::new();
        let cv = SensorSample {
            source: SensorSource::Cv,
            timestamp_ns: 0,
            position: Some(PositionFix::Local(LocalPoint::new(0.0, 0.0, 0.0, 0))),
            accuracy_m: None,
            confidence: Some(0.9),
            beacons: vec![],
        };
        let gps = SensorSample {
            source: SensorSource::Gps,
            timestamp_ns: 6_000 * 1_000_000,
            position: Some(PositionFix::Geo(GeoPoint { lat: 47.45, lon: 19.06, alt: 100.0 })),
            accuracy_m: Some(35.0),
            confidence: None,
            beacons: vec![],
        };
        let (acc, rej) =
            prepare_samples(&[cv, gps], &FusionConfig::default(), &prep(&h, &beacons, 6_000));
        assert!(acc.is_empty());
        assert!(rej.contains(&(SensorSource::Cv, RejectReason::Stale)));
        assert!(rej.contains(&(SensorSource::Gps, RejectReason::PoorGpsAccuracy)));
    }

    #[test]
    fn gps_accepted_inside_transition_zone() {
        let h = handoff();
        let beacons = HashMap::new();
        let gps = SensorSample {
            source: SensorSource::Gps,
            timestamp_ns: 0,
            position: Some(PositionFix::Geo(GeoPoint { lat: 47.45, lon: 19.06, alt: 100.0 })),
            accuracy_m: Some(35.0),
            confidence: None,
            beacons: vec![],
        };
        let mut ctx = prep(&h, &beacons, 0);
        ctx.in_transition_zone = true;
        let (acc, _) = prepare_samples(&[gps], &FusionConfig::default(), &ctx);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn rssi_distance_model_matches_reference_points() {
        // at measured power the distance is 1 m
        assert!((rssi_to_distance_m(-59.0, -59.0, 2.2) - 1.0).abs() < 1e-9);
        // each -22 dB decade at n=2.2 is 10×
        assert!((rssi_to_distance_m(-81.0, -59.0, 2.2) - 10.0).abs() < 1e-6);
    }

    #[test]
    fn filter_converges_toward_repeated_fix() {
        let h = handoff();
        let beacons = HashMap::new();
        let mut filter = PoseFilter::new(FusionConfig::default());
        let cfg = FusionConfig::default();
        for i in 0..20 {
            let (acc, _) = prepare_samples(
                &[slam_sample(i * 200, 10.0, 5.0, 0.9)],
                &cfg,
                &prep(&h, &beacons, i * 200),
            );
            filter.ingest(&acc, false, 0);
        }
        let pose = filter.latest().expect("pose emitted");
        assert!(pose.position.horizontal_distance(&LocalPoint::new(10.0, 5.0, 0.0, 0)) < 0.5);
        assert!(pose.confidence > 0.3);
        assert_eq!(filter.tracking_state(), TrackingState::Tracking);
    }

    #[test]
    fn teleport_is_rejected_as_outlier() {
        let h = handoff();
        let beacons = HashMap::new();
        let cfg = FusionConfig::default();
        let mut filter = PoseFilter::new(cfg.clone());
        for i in 0..5 {
            let (acc, _) =
                prepare_samples(&[slam_sample(i * 200, 0.0, 0.0, 0.9)], &cfg, &prep(&h, &beacons, i * 200));
            filter.ingest(&acc, false, 0);
        }
        // 500 m jump in 200 ms = 2500 m/s
        let (acc, _) =
            prepare_samples(&[slam_sample(1_200, 500.0, 0.0, 0.9)], &cfg, &prep(&h, &beacons, 1_200));
        let out = filter.ingest(&acc, false, 0);
        assert!(out.pose.is_none());
        assert_eq!(filter.outliers_total, 1);
        let pose = filter.latest().unwrap();
        assert!(pose.position.horizontal_distance(&LocalPoint::new(0.0, 0.0, 0.0, 0)) < 1.0);
    }

    #[test]
    fn silence_walks_degraded_then_lost() {
        let h = handoff();
        let beacons = HashMap::new();
        let cfg = FusionConfig::default();
        let mut filter = PoseFilter::new(cfg.clone());
        let (acc, _) = prepare_samples(&[slam_sample(0, 0.0, 0.0, 0.9)], &cfg, &prep(&h, &beacons, 0));
        filter.ingest(&acc, false, 0);

        assert!(filter.tick(1_000 * 1_000_000).is_empty());
        let ev = filter.tick(3_000 * 1_000_000);
        assert_eq!(ev, vec![FilterEvent::Degraded]);
        let ev = filter.tick(11_000 * 1_000_000);
        assert_eq!(ev, vec![FilterEvent::PoseLost]);
        assert_eq!(filter.tracking_state(), TrackingState::Lost);

        // A fresh sample recovers tracking
        let (acc, _) =
            prepare_samples(&[slam_sample(12_000, 1.0, 0.0, 0.9)], &cfg, &prep(&h, &beacons, 12_000));
        let out = filter.ingest(&acc, false, 0);
        assert!(out.events.contains(&FilterEvent::Recovered));
        assert_eq!(filter.tracking_state(), TrackingState::Tracking);
    }

    #[test]
    fn strategy_table_is_deterministic() {
        let m = |s: SensorSource| Measurement {
            source: s,
            point: LocalPoint::default(),
            noise_m: 1.0,
            confidence: 0.8,
            timestamp_ns: 0,
        };
        let all = vec![m(SensorSource::Slam), m(SensorSource::Ble), m(SensorSource::Cv)];
        assert_eq!(select_strategy(&all, false), Some(FusionStrategy::SlamBleCv));
        assert_eq!(
            select_strategy(&[m(SensorSource::Slam), m(SensorSource::Ble)], false),
            Some(FusionStrategy::SlamBle)
        );
        assert_eq!(select_strategy(&[m(SensorSource::Slam)], false), Some(FusionStrategy::SlamOnly));
        assert_eq!(select_strategy(&[m(SensorSource::Ble)], false), Some(FusionStrategy::BleOnly));
        assert_eq!(select_strategy(&[m(SensorSource::Cv)], false), Some(FusionStrategy::CvAnchor));
        assert_eq!(select_strategy(&[m(SensorSource::Gps)], false), Some(FusionStrategy::GpsOnly));
        assert_eq!(
            select_strategy(&[m(SensorSource::Gps), m(SensorSource::Slam)], true),
            Some(FusionStrategy::FusedHandoff)
        );
        assert_eq!(select_strategy(&[], false), None);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let h = handoff();
        let beacons = HashMap::new();
        let cfg = FusionConfig { ring_buffer_len: 8, ..Default::default() };
        let mut filter = PoseFilter::new(cfg.clone());
        for i in 0..40 {
            let (acc, _) = prepare_samples(
                &[slam_sample(i * 200, i as f64, 0.0, 0.9)],
                &cfg,
                &prep(&h, &beacons, i * 200),
            );
            filter.ingest(&acc, false, 0);
        }
        assert!(filter.ring().count() <= 8);
    }

    #[test]
    fn beacon_trilateration_lands_between_beacons() {
        let h = handoff();
        let mut beacons = HashMap::new();
        beacons.insert("b1".to_string(), LocalPoint::new(0.0, 0.0, 0.0, 0));
        beacons.insert("b2".to_string(), LocalPoint::new(10.0, 0.0, 0.0, 0));
        let sample = SensorSample {
            source: SensorSource::Ble,
            timestamp_ns: 0,
            position: None,
            accuracy_m: None,
            confidence: None,
            beacons: vec![
                BeaconReading { beacon_id: "b1".into(), rssi_dbm: -65.0, measured_power_dbm: Some(-59.0) },
                BeaconReading { beacon_id: "b2".into(), rssi_dbm: -65.0, measured_power_dbm: Some(-59.0) },
            ],
        };
        let (acc, _) = prepare_samples(&[sample], &FusionConfig::default(), &prep(&h, &beacons, 0));
        assert_eq!(acc.len(), 1);
        let p = acc[0].point;
        assert!((p.x - 5.0).abs() < 0.5);
        assert!(p.y.abs() < 0.5);
    }
}
