//! # handoff
//!
//! Indoor/Outdoor Handoff — reference-frame bookkeeping per user, coordinate
//! transforms between WGS-84 and the facility's local ENU frame, and the
//! transition-zone switch policy.
//!
//! ## Frames
//! The base transform is an equirectangular ENU projection about the facility
//! origin. Inside a transition zone a calibrated affine correction is applied
//! on top, surveyed per zone and re-fit administratively from paired
//! indoor/GPS samples. Calibrations are validated on load: the rotation block
//! must be orthonormal to 1e-6 and the matrix invertible.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use nalgebra::{Matrix2, Matrix4, Vector2, Vector4};
use tracing::{info, warn};
use wayfind_types::{
    FrameKind, GeoPoint, LocalPoint, PositionFix, TransitionZone, ZoneCalibration,
};

use crate::config::HandoffConfig;
use crate::error::{CoreError, CoreResult};

/// WGS-84 semi-major axis, meters.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

// ── Base projection ───────────────────────────────────────────────────────────

/// Stateless WGS-84 ↔ ENU projection about the facility origin.
#[derive(Debug, Clone)]
pub struct FrameTransformer {
    origin: GeoPoint,
    cos_lat0: f64,
}

impl FrameTransformer {
    pub fn new(origin: GeoPoint) -> Self {
        let cos_lat0 = origin.lat.to_radians().cos();
        Self { origin, cos_lat0 }
    }

    /// Geodetic → raw local ENU. The floor index is supplied by the caller
    /// (GPS knows nothing about floors).
    pub fn to_local(&self, geo: &GeoPoint, floor: i32) -> LocalPoint {
        let x = (geo.lon - self.origin.lon).to_radians() * self.cos_lat0 * EARTH_RADIUS_M;
        let y = (geo.lat - self.origin.lat).to_radians() * EARTH_RADIUS_M;
        let z = geo.alt - self.origin.alt;
        LocalPoint::new(x, y, z, floor)
    }

    /// Local ENU → geodetic.
    pub fn to_geo(&self, local: &LocalPoint) -> GeoPoint {
        GeoPoint {
            lat: self.origin.lat + (local.y / EARTH_RADIUS_M).to_degrees(),
            lon: self.origin.lon + (local.x / (EARTH_RADIUS_M * self.cos_lat0)).to_degrees(),
            alt: self.origin.alt + local.z,
        }
    }
}

// ── Calibration ───────────────────────────────────────────────────────────────

fn affine_matrix(cal: &ZoneCalibration) -> Matrix4<f64> {
    Matrix4::from_fn(|r, c| cal.affine[r][c])
}

/// `‖R·Rᵀ − I‖_max ≤ 1e-6` over the rotation block, and the full affine must
/// invert back to identity within the same bound.
pub fn validate_calibration(cal: &ZoneCalibration) -> CoreResult<()> {
    let a = affine_matrix(cal);
    let r = a.fixed_view::<3, 3>(0, 0).into_owned();
    let ortho_err = (r * r.transpose() - nalgebra::Matrix3::identity()).abs().max();
    if ortho_err > 1e-6 {
        return Err(CoreError::InvalidInput(format!(
            "calibration rotation not orthonormal (error {ortho_err:.2e})"
        )));
    }
    let inv = a
        .try_inverse()
        .ok_or_else(|| CoreError::InvalidInput("calibration affine is singular".into()))?;
    let roundtrip_err = (a * inv - Matrix4::identity()).abs().max();
    if roundtrip_err > 1e-6 {
        return Err(CoreError::InvalidInput(format!(
            "calibration affine poorly conditioned (error {roundtrip_err:.2e})"
        )));
    }
    Ok(())
}

fn apply_affine(cal: &ZoneCalibration, p: &LocalPoint) -> LocalPoint {
    let v = affine_matrix(cal) * Vector4::new(p.x, p.y, p.z, 1.0);
    LocalPoint::new(v.x, v.y, v.z, p.floor)
}

fn apply_affine_inverse(cal: &ZoneCalibration, p: &LocalPoint) -> LocalPoint {
    let Some(inv) = affine_matrix(cal).try_inverse() else {
        // validated on load; an unexpected singular matrix degrades to raw
        warn!("singular calibration affine applied; returning raw coordinates");
        return *p;
    };
    let v = inv * Vector4::new(p.x, p.y, p.z, 1.0);
    LocalPoint::new(v.x, v.y, v.z, p.floor)
}

/// Weighted least-squares fit of a rigid 2D correction (yaw + translation)
/// from paired (GPS-projected, surveyed-indoor) samples. Weights are inverse
/// sample accuracies. Needs at least two pairs with spread.
pub fn fit_calibration(
    raw_local: &[LocalPoint],
    surveyed: &[LocalPoint],
    weights: &[f64],
    calibrated_at_ms: i64,
) -> CoreResult<ZoneCalibration> {
    if raw_local.len() != surveyed.len() || raw_local.len() != weights.len() {
        return Err(CoreError::InvalidInput("calibration pair/weight length mismatch".into()));
    }
    if raw_local.len() < 2 {
        return Err(CoreError::InvalidInput("calibration needs at least two pairs".into()));
    }
    let w_sum: f64 = weights.iter().sum();
    if w_sum <= f64::EPSILON {
        return Err(CoreError::InvalidInput("calibration weights sum to zero".into()));
    }

    let centroid = |pts: &[LocalPoint]| {
        let mut c = Vector2::zeros();
        for (p, w) in pts.iter().zip(weights) {
            c += Vector2::new(p.x, p.y) * *w;
        }
        c / w_sum
    };
    let c_raw = centroid(raw_local);
    let c_sur = centroid(surveyed);

    // Weighted cross-covariance of the centered pairs.
    let mut h = Matrix2::zeros();
    for ((r, s), w) in raw_local.iter().zip(surveyed).zip(weights) {
        let dr = Vector2::new(r.x, r.y) - c_raw;
        let ds = Vector2::new(s.x, s.y) - c_sur;
        h += ds * dr.transpose() * *w;
    }
    if h.norm() <= f64::EPSILON {
        return Err(CoreError::InvalidInput("calibration pairs are degenerate".into()));
    }

    // Optimal rotation angle for the rigid fit.
    let theta = (h[(1, 0)] - h[(0, 1)]).atan2(h[(0, 0)] + h[(1, 1)]);
    let (sin_t, cos_t) = theta.sin_cos();
    let t = c_sur - Matrix2::new(cos_t, -sin_t, sin_t, cos_t) * c_raw;

    let mut affine = [[0.0; 4]; 4];
    affine[0] = [cos_t, -sin_t, 0.0, t.x];
    affine[1] = [sin_t, cos_t, 0.0, t.y];
    affine[2] = [0.0, 0.0, 1.0, 0.0];
    affine[3] = [0.0, 0.0, 0.0, 1.0];

    let cal = ZoneCalibration {
        affine,
        rotation_rad: theta,
        offset: [t.x, t.y, 0.0],
        calibrated_at_ms,
    };
    validate_calibration(&cal)?;
    Ok(cal)
}

// ── Per-user frame state ──────────────────────────────────────────────────────

/// Owned by the user's session actor.
#[derive(Debug)]
pub struct UserFrameState {
    pub frame: FrameKind,
    pub active_zone: Option<String>,
    /// Frame held when the current transition started; lets the session emit
    /// a single from→to event when the transition commits.
    pub entered_from: Option<FrameKind>,
    /// Since when the outdoor-switch condition has held, wall-clock ms.
    outdoor_hold_since: Option<i64>,
    indoor_hold_since: Option<i64>,
    transition_since: Option<i64>,
}

impl Default for UserFrameState {
    fn default() -> Self {
        Self {
            frame: FrameKind::Indoor,
            active_zone: None,
            entered_from: None,
            outdoor_hold_since: None,
            indoor_hold_since: None,
            transition_since: None,
        }
    }
}

/// Summarized sensor quality for one frame-arbitration step.
#[derive(Debug, Clone, Copy)]
pub struct FrameSignals {
    /// Best current local position.
    pub position: LocalPoint,
    pub gps_accuracy_m: Option<f64>,
    pub slam_confidence: Option<f64>,
    pub ble_confidence: Option<f64>,
    pub now_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecision {
    Stay,
    SwitchIndoor { zone_id: String },
    SwitchOutdoor { zone_id: String },
    EnterTransition { zone_id: String },
    ExitTransition { committed: FrameKind, zone_id: String },
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct HandoffEngine {
    config: HandoffConfig,
    transformer: FrameTransformer,
    zones: RwLock<Arc<HashMap<String, Arc<TransitionZone>>>>,
}

impl HandoffEngine {
    pub fn new(config: HandoffConfig, origin: GeoPoint, zones: Vec<TransitionZone>) -> CoreResult<Self> {
        let mut map = HashMap::new();
        for zone in zones {
            validate_calibration(&zone.calibration).map_err(|e| {
                CoreError::InvalidInput(format!("transition zone {}: {e}", zone.id))
            })?;
            map.insert(zone.id.clone(), Arc::new(zone));
        }
        info!("handoff engine: {} transition zones", map.len());
        Ok(Self {
            config,
            transformer: FrameTransformer::new(origin),
            zones: RwLock::new(Arc::new(map)),
        })
    }

    pub fn transformer(&self) -> &FrameTransformer {
        &self.transformer
    }

    /// Swap in a new zone set (facility reload). All calibrations are
    /// validated before anything is replaced.
    pub fn replace_zones(&self, zones: Vec<TransitionZone>) -> CoreResult<()> {
        let mut map = HashMap::new();
        for zone in zones {
            validate_calibration(&zone.calibration).map_err(|e| {
                CoreError::InvalidInput(format!("transition zone {}: {e}", zone.id))
            })?;
            map.insert(zone.id.clone(), Arc::new(zone));
        }
        info!("transition zones replaced: {} zones", map.len());
        *self.zones.write().expect("zone map lock") = Arc::new(map);
        Ok(())
    }

    pub fn zone(&self, id: &str) -> Option<Arc<TransitionZone>> {
        self.zones.read().expect("zone map lock").get(id).cloned()
    }

    /// Transition zone whose radius covers the local point, if any.
    pub fn zone_for_local(&self, p: &LocalPoint) -> Option<Arc<TransitionZone>> {
        let zones = self.zones.read().expect("zone map lock").clone();
        zones
            .values()
            .filter(|z| z.indoor_anchor.horizontal_distance(p) <= z.radius_m)
            .min_by(|a, b| {
                a.indoor_anchor
                    .horizontal_distance(p)
                    .total_cmp(&b.indoor_anchor.horizontal_distance(p))
            })
            .cloned()
    }

    /// Convert any position fix to the local frame, applying the zone's
    /// affine correction when the fix lands inside a transition zone.
    pub fn resolve_local(&self, fix: &PositionFix, floor_hint: i32) -> LocalPoint {
        match fix {
            PositionFix::Local(p) => *p,
            PositionFix::Geo(g) => {
                let raw = self.transformer.to_local(g, floor_hint);
                match self.zone_for_local(&raw) {
                    Some(zone) => {
                        let corrected = apply_affine(&zone.calibration, &raw);
                        LocalPoint::new(corrected.x, corrected.y, corrected.z, zone.indoor_anchor.floor)
                    }
                    None => raw,
                }
            }
        }
    }

    /// Convert a local point to geodetic, undoing the zone correction first
    /// when inside a transition zone.
    pub fn resolve_geo(&self, p: &LocalPoint) -> GeoPoint {
        match self.zone_for_local(p) {
            Some(zone) => {
                let raw = apply_affine_inverse(&zone.calibration, p);
                self.transformer.to_geo(&raw)
            }
            None => self.transformer.to_geo(p),
        }
    }

    /// One arbitration step. Mutates hold timers inside `state`; commits a
    /// frame change only when the policy's hold has been satisfied.
    pub fn evaluate(&self, state: &mut UserFrameState, signals: &FrameSignals) -> FrameDecision {
        let Some(zone) = self.zone_for_local(&signals.position) else {
            state.outdoor_hold_since = None;
            state.indoor_hold_since = None;
            // Leaving a zone mid-transition commits the better frame.
            if state.frame == FrameKind::Transition {
                let committed = self.better_frame(signals);
                let zone_id = state.active_zone.take().unwrap_or_default();
                state.frame = committed;
                state.transition_since = None;
                return FrameDecision::ExitTransition { committed, zone_id };
            }
            state.active_zone = None;
            return FrameDecision::Stay;
        };

        let now = signals.now_ms;
        let hold = self.config.switch_hold_ms as i64;

        let gps_good = signals
            .gps_accuracy_m
            .map(|a| a <= zone.gps_min_accuracy_m)
            .unwrap_or(false);
        let indoor_conf = signals
            .slam_confidence
            .into_iter()
            .chain(signals.ble_confidence)
            .fold(0.0_f64, f64::max);
        let indoor_good = indoor_conf >= zone.indoor_min_confidence;
        let slam_weak = signals
            .slam_confidence
            .map(|c| c < self.config.outdoor_slam_ceiling)
            .unwrap_or(true);

        match state.frame {
            FrameKind::Indoor => {
                if gps_good && indoor_good {
                    state.active_zone = Some(zone.id.clone());
                    state.entered_from = Some(FrameKind::Indoor);
                    state.frame = FrameKind::Transition;
                    state.transition_since = Some(now);
                    state.outdoor_hold_since = None;
                    return FrameDecision::EnterTransition { zone_id: zone.id.clone() };
                }
                if gps_good && slam_weak {
                    let since = *state.outdoor_hold_since.get_or_insert(now);
                    if now - since >= hold {
                        state.frame = FrameKind::Outdoor;
                        state.active_zone = None;
                        state.outdoor_hold_since = None;
                        return FrameDecision::SwitchOutdoor { zone_id: zone.id.clone() };
                    }
                } else {
                    state.outdoor_hold_since = None;
                }
                FrameDecision::Stay
            }
            FrameKind::Outdoor => {
                if gps_good && indoor_good {
                    state.active_zone = Some(zone.id.clone());
                    state.entered_from = Some(FrameKind::Outdoor);
                    state.frame = FrameKind::Transition;
                    state.transition_since = Some(now);
                    state.indoor_hold_since = None;
                    return FrameDecision::EnterTransition { zone_id: zone.id.clone() };
                }
                if indoor_good {
                    let since = *state.indoor_hold_since.get_or_insert(now);
                    if now - since >= hold {
                        state.frame = FrameKind::Indoor;
                        state.active_zone = None;
                        state.indoor_hold_since = None;
                        return FrameDecision::SwitchIndoor { zone_id: zone.id.clone() };
                    }
                } else {
                    state.indoor_hold_since = None;
                }
                FrameDecision::Stay
            }
            FrameKind::Transition => {
                let since = state.transition_since.unwrap_or(now);
                let timed_out = now - since >= zone.switch_timeout_ms as i64;
                let lost_one_side = !(gps_good && indoor_good);
                if timed_out || lost_one_side {
                    let committed = self.better_frame(signals);
                    state.frame = committed;
                    state.transition_since = None;
                    let zone_id = state.active_zone.take().unwrap_or_else(|| zone.id.clone());
                    return FrameDecision::ExitTransition { committed, zone_id };
                }
                FrameDecision::Stay
            }
        }
    }

    /// The single frame with the currently higher-confidence source.
    fn better_frame(&self, signals: &FrameSignals) -> FrameKind {
        let indoor_conf = signals
            .slam_confidence
            .into_iter()
            .chain(signals.ble_confidence)
            .fold(0.0_f64, f64::max);
        // GPS confidence proxy: 1 at 0 m accuracy, 0 at 30 m.
        let gps_conf = signals
            .gps_accuracy_m
            .map(|a| (1.0 - a / 30.0).clamp(0.0, 1.0))
            .unwrap_or(0.0);
        if indoor_conf >= gps_conf {
            FrameKind::Indoor
        } else {
            FrameKind::Outdoor
        }
    }

    /// Administrative re-calibration: fit a new affine from paired samples
    /// and swap it in atomically.
    pub fn recalibrate(
        &self,
        zone_id: &str,
        pairs: &[(GeoPoint, LocalPoint)],
        accuracies_m: &[f64],
        now_ms: i64,
    ) -> CoreResult<ZoneCalibration> {
        let zones = self.zones.read().expect("zone map lock").clone();
        let Some(zone) = zones.get(zone_id) else {
            return Err(CoreError::ZoneNotFound(zone_id.to_string()));
        };

        let floor = zone.indoor_anchor.floor;
        let raw: Vec<LocalPoint> =
            pairs.iter().map(|(g, _)| self.transformer.to_local(g, floor)).collect();
        let surveyed: Vec<LocalPoint> = pairs.iter().map(|(_, l)| *l).collect();
        let weights: Vec<f64> = accuracies_m
            .iter()
            .map(|a| 1.0 / a.max(0.1).powi(2))
            .collect();

        let cal = fit_calibration(&raw, &surveyed, &weights, now_ms)?;

        let mut next = (**zone).clone();
        next.calibration = cal.clone();
        let mut map = (*zones).clone();
        map.insert(zone_id.to_string(), Arc::new(next));
        *self.zones.write().expect("zone map lock") = Arc::new(map);

        info!(
            "transition zone {zone_id} recalibrated from {} pairs (yaw {:.4} rad)",
            pairs.len(),
            cal.rotation_rad
        );
        Ok(cal)
    }
}
