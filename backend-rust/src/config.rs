//! # config
//!
//! Env-var-driven tunables, grouped per engine. Every knob has a shipping
//! default; `WAYFIND_*` variables override at startup. Values are read once
//! and cloned into the engines that need them.

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Fusion (PFE) ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// No valid sample for this long → Degraded, milliseconds.
    pub max_inter_sample_gap_ms: u64,
    /// No sample at all for this long → Lost, milliseconds.
    pub lost_timeout_ms: u64,
    /// GPS samples above this accuracy are dropped outside transition zones.
    pub max_gps_accuracy_m: f64,
    /// Implied velocity above this rejects the measurement as an outlier.
    pub max_velocity_mps: f64,
    /// CV detections older than this are stale, milliseconds.
    pub cv_staleness_ms: u64,
    /// SLAM tracking confidence below this is rejected.
    pub min_slam_confidence: f64,
    /// BLE readings weaker than this are dropped, dBm.
    pub min_ble_rssi_dbm: f64,
    /// BLE-implied distances outside (0, this] are dropped, meters.
    pub max_ble_distance_m: f64,
    /// Log-distance path-loss exponent for RSSI → distance.
    pub ble_path_loss_exponent: f64,
    /// Calibrated RSSI at 1 m when a beacon does not advertise one, dBm.
    pub ble_default_measured_power_dbm: f64,
    /// Covariance trace above this resets the filter.
    pub divergence_trace: f64,
    /// Minimum output interval per user (10 Hz cap), milliseconds.
    pub min_emit_interval_ms: u64,
    /// Fused-pose ring buffer depth per user.
    pub ring_buffer_len: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            max_inter_sample_gap_ms: env_u64("WAYFIND_MAX_INTER_SAMPLE_GAP_MS", 2_000),
            lost_timeout_ms: env_u64("WAYFIND_LOST_TIMEOUT_MS", 10_000),
            max_gps_accuracy_m: env_f64("WAYFIND_MAX_GPS_ACCURACY_M", 20.0),
            max_velocity_mps: env_f64("WAYFIND_MAX_VELOCITY_MPS", 15.0),
            cv_staleness_ms: env_u64("WAYFIND_CV_STALENESS_MS", 5_000),
            min_slam_confidence: env_f64("WAYFIND_MIN_SLAM_CONFIDENCE", 0.1),
            min_ble_rssi_dbm: env_f64("WAYFIND_MIN_BLE_RSSI_DBM", -100.0),
            max_ble_distance_m: env_f64("WAYFIND_MAX_BLE_DISTANCE_M", 50.0),
            ble_path_loss_exponent: env_f64("WAYFIND_BLE_PATH_LOSS_EXPONENT", 2.2),
            ble_default_measured_power_dbm: env_f64("WAYFIND_BLE_MEASURED_POWER_DBM", -59.0),
            divergence_trace: env_f64("WAYFIND_DIVERGENCE_TRACE", 1e4),
            min_emit_interval_ms: env_u64("WAYFIND_MIN_EMIT_INTERVAL_MS", 100),
            ring_buffer_len: env_usize("WAYFIND_POSE_RING_LEN", 256),
        }
    }
}

// ── Router (RP) ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Heuristic floor-change penalty, seconds per floor.
    pub floor_penalty_s: f64,
    /// Elevator waiting penalty, seconds.
    pub elevator_penalty_s: f64,
    /// Escalator time multiplier (standing ride beats walking).
    pub escalator_bonus: f64,
    /// Stairs time multiplier.
    pub stairs_penalty: f64,
    /// Weight of (1 − accessibilityScore) under the accessible criterion.
    pub accessibility_weight: f64,
    /// Weight of the hazard-severity score under the safest criterion.
    pub safety_weight: f64,
    /// Hard computation deadline, milliseconds.
    pub max_computation_ms: u64,
    /// Node-visitation guard.
    pub max_expansions: u64,
    /// Start/end snap radius, meters.
    pub max_search_radius_m: f64,
    /// Cache entry TTL, milliseconds.
    pub cache_ttl_ms: u64,
    /// Global concurrent computation cap.
    pub max_concurrent: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            floor_penalty_s: env_f64("WAYFIND_FLOOR_PENALTY_S", 60.0),
            elevator_penalty_s: env_f64("WAYFIND_ELEVATOR_PENALTY_S", 45.0),
            escalator_bonus: env_f64("WAYFIND_ESCALATOR_BONUS", 0.8),
            stairs_penalty: env_f64("WAYFIND_STAIRS_PENALTY", 1.2),
            accessibility_weight: env_f64("WAYFIND_ACCESSIBILITY_WEIGHT", 30.0),
            safety_weight: env_f64("WAYFIND_SAFETY_WEIGHT", 120.0),
            max_computation_ms: env_u64("WAYFIND_MAX_COMPUTATION_MS", 5_000),
            max_expansions: env_u64("WAYFIND_MAX_EXPANSIONS", 200_000),
            max_search_radius_m: env_f64("WAYFIND_MAX_SEARCH_RADIUS_M", 500.0),
            cache_ttl_ms: env_u64("WAYFIND_ROUTE_CACHE_TTL_MS", 300_000),
            max_concurrent: env_usize("WAYFIND_MAX_CONCURRENT_ROUTES", 256),
        }
    }
}

// ── Route sessions (RSM) ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Distance to destination that completes the route, meters.
    pub arrival_radius_m: f64,
    /// Perpendicular distance off the current edge that counts as deviating.
    pub deviation_threshold_m: f64,
    /// Deviation must persist this long to count, milliseconds.
    pub deviation_sustain_ms: u64,
    /// Sustained deviations before a re-plan fires.
    pub deviations_before_replan: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            arrival_radius_m: env_f64("WAYFIND_ARRIVAL_RADIUS_M", 3.0),
            deviation_threshold_m: env_f64("WAYFIND_DEVIATION_THRESHOLD_M", 8.0),
            deviation_sustain_ms: env_u64("WAYFIND_DEVIATION_SUSTAIN_MS", 2_000),
            deviations_before_replan: env_u64("WAYFIND_DEVIATIONS_BEFORE_REPLAN", 2) as u32,
        }
    }
}

// ── Geofence (HGE) ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GeofenceConfig {
    /// Bounding-box pre-filter distance for candidate zones, meters.
    pub alert_proximity_threshold_m: f64,
    /// Exit hysteresis multiplier over the zone's proximity threshold.
    pub exit_hysteresis: f64,
    /// Per-user alert budget per minute; overflow is dropped and counted.
    pub batch_alert_threshold: u32,
    /// Spatial-index grid cell, meters.
    pub grid_cell_m: f64,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            alert_proximity_threshold_m: env_f64("WAYFIND_ALERT_PROXIMITY_M", 10.0),
            exit_hysteresis: env_f64("WAYFIND_EXIT_HYSTERESIS", 1.25),
            batch_alert_threshold: env_u64("WAYFIND_BATCH_ALERT_THRESHOLD", 10) as u32,
            grid_cell_m: env_f64("WAYFIND_ZONE_GRID_CELL_M", 10.0),
        }
    }
}

// ── Handoff (IOH) ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Switch conditions must hold this long before a frame commit, ms.
    pub switch_hold_ms: u64,
    /// Dual-frame transition commits after this long, milliseconds.
    pub transition_timeout_ms: u64,
    /// SLAM confidence below this allows the indoor→outdoor switch.
    pub outdoor_slam_ceiling: f64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            switch_hold_ms: env_u64("WAYFIND_SWITCH_HOLD_MS", 3_000),
            transition_timeout_ms: env_u64("WAYFIND_TRANSITION_TIMEOUT_MS", 30_000),
            outdoor_slam_ceiling: env_f64("WAYFIND_OUTDOOR_SLAM_CEILING", 0.4),
        }
    }
}

// ── Broker (FSB) ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Cubic crowd-penalty coefficient: weight = base × (1 + k·density³).
    pub crowd_penalty: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { crowd_penalty: env_f64("WAYFIND_CROWD_PENALTY", 2.0) }
    }
}

// ── Sessions & bus (SEB) ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Subscriber outbound queue depth.
    pub subscriber_queue_len: usize,
    /// Blocking-send timeout for critical topics, milliseconds.
    pub critical_send_timeout_ms: u64,
    /// Session actor mailbox depth.
    pub mailbox_len: usize,
    /// Sessions idle longer than this are reaped, milliseconds.
    pub idle_ttl_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_len: env_usize("WAYFIND_SUBSCRIBER_QUEUE_LEN", 256),
            critical_send_timeout_ms: env_u64("WAYFIND_CRITICAL_SEND_TIMEOUT_MS", 100),
            mailbox_len: env_usize("WAYFIND_SESSION_MAILBOX_LEN", 128),
            idle_ttl_ms: env_u64("WAYFIND_SESSION_IDLE_TTL_MS", 600_000),
        }
    }
}

// ── Graph store (NGS) ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Spatial-index grid cell, meters.
    pub grid_cell_m: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self { grid_cell_m: env_f64("WAYFIND_GRID_CELL_M", 10.0) }
    }
}

// ── Top-level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub fusion: FusionConfig,
    pub router: RouterConfig,
    pub tracking: TrackingConfig,
    pub geofence: GeofenceConfig,
    pub handoff: HandoffConfig,
    pub broker: BrokerConfig,
    pub session: SessionConfig,
    pub graph: GraphConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipping_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.fusion.lost_timeout_ms, 10_000);
        assert_eq!(cfg.router.max_expansions, 200_000);
        assert!((cfg.router.escalator_bonus - 0.8).abs() < f64::EPSILON);
        assert!((cfg.tracking.deviation_threshold_m - 8.0).abs() < f64::EPSILON);
        assert_eq!(cfg.session.subscriber_queue_len, 256);
    }
}
