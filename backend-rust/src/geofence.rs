//! # geofence
//!
//! Hazard & Geofence Engine — zone storage, proximity classification, and the
//! per-user enter/approach/exit state machine.
//!
//! ## Architecture
//! Zone reads are hot (every fused pose); CRUD is rare. Reads take an
//! `Arc<ZoneSnapshot>` rebuilt behind a single writer lock. Every accepted
//! runtime mutation is committed to the hash-chained WAL *before* the store
//! mutates, and geometry changes recompute the zone's blocked-edge list and
//! push it to the facility broker.
//!
//! ## Alert semantics
//! A user is *engaged* with a zone while within its proximity threshold (or
//! inside the polygon). `ENTERED` fires on polygon crossing, `APPROACHING`
//! inside the proximity band subject to the per-(user, zone) cooldown, and
//! `EXITED` once the distance exceeds threshold × 1.25 (hysteresis).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use chrono::{Datelike, FixedOffset, TimeZone, Timelike, Utc};
use tracing::{debug, info, warn};
use wayfind_types::{
    HazardAlertEvent, HazardZone, LocalPoint, NavEdge, ProximityKind, RestrictedArea, Severity,
    WeeklySchedule, ZoneStatus,
};

use crate::broker::FacilityBroker;
use crate::config::GeofenceConfig;
use crate::error::{CoreError, CoreResult};
use crate::graph::GraphStore;
use crate::router::HazardScore;
use crate::zone_wal::{ZoneOp, ZoneWal};

// ── Snapshot ──────────────────────────────────────────────────────────────────

type GridKey = (i32, i64, i64);

/// Immutable view of all zones plus the bounding-box spatial pre-filter.
pub struct ZoneSnapshot {
    hazards: HashMap<String, Arc<HazardZone>>,
    restricted: HashMap<String, Arc<RestrictedArea>>,
    /// Grid cell → hazard zone ids whose padded bbox overlaps the cell.
    grid: HashMap<GridKey, Vec<String>>,
    cell_m: f64,
}

impl ZoneSnapshot {
    fn build(
        hazards: HashMap<String, Arc<HazardZone>>,
        restricted: HashMap<String, Arc<RestrictedArea>>,
        config: &GeofenceConfig,
    ) -> Self {
        let cell_m = config.grid_cell_m;
        let pad = config.alert_proximity_threshold_m;
        let mut grid: HashMap<GridKey, Vec<String>> = HashMap::new();
        for zone in hazards.values() {
            for poly in &zone.geometry.polygons {
                let (min_x, min_y, max_x, max_y) = poly.bbox();
                let x0 = ((min_x - pad) / cell_m).floor() as i64;
                let x1 = ((max_x + pad) / cell_m).floor() as i64;
                let y0 = ((min_y - pad) / cell_m).floor() as i64;
                let y1 = ((max_y + pad) / cell_m).floor() as i64;
                for cx in x0..=x1 {
                    for cy in y0..=y1 {
                        let ids = grid.entry((poly.floor, cx, cy)).or_default();
                        if !ids.iter().any(|id| id == &zone.id) {
                            ids.push(zone.id.clone());
                        }
                    }
                }
            }
        }
        Self { hazards, restricted, grid, cell_m }
    }

    pub fn hazard(&self, id: &str) -> Option<&Arc<HazardZone>> {
        self.hazards.get(id)
    }

    pub fn restricted(&self, id: &str) -> Option<&Arc<RestrictedArea>> {
        self.restricted.get(id)
    }

    pub fn hazards(&self) -> impl Iterator<Item = &Arc<HazardZone>> {
        self.hazards.values()
    }

    /// Hazards whose padded bbox covers the point's grid cell.
    pub fn candidates(&self, p: &LocalPoint) -> Vec<Arc<HazardZone>> {
        let key = (p.floor, (p.x / self.cell_m).floor() as i64, (p.y / self.cell_m).floor() as i64);
        let mut out = Vec::new();
        if let Some(ids) = self.grid.get(&key) {
            for id in ids {
                if let Some(zone) = self.hazards.get(id) {
                    out.push(zone.clone());
                }
            }
        }
        out
    }
}

// ── Per-user alert state ──────────────────────────────────────────────────────

/// Owned by the user's session actor; never shared across tasks.
#[derive(Debug, Default)]
pub struct UserZoneState {
    /// Zones whose polygon the user is currently inside.
    inside: HashSet<String>,
    /// Zones the user is engaged with (polygon or proximity band).
    engaged: HashSet<String>,
    /// Last alert wall-clock per zone, for cooldown enforcement.
    last_alert_ms: HashMap<String, i64>,
    /// Timestamps of alerts in the rolling one-minute window.
    alert_window_ms: VecDeque<i64>,
    /// Alerts dropped by the per-user rate cap.
    pub dropped_alerts: u64,
}

impl UserZoneState {
    /// Drop cooldown entries older than the longest plausible cooldown.
    /// Called by the session tick to bound memory for roaming users.
    pub fn gc(&mut self, now_ms: i64, max_age_ms: i64) {
        self.last_alert_ms.retain(|_, t| now_ms - *t <= max_age_ms);
        while let Some(front) = self.alert_window_ms.front() {
            if now_ms - front > 60_000 {
                self.alert_window_ms.pop_front();
            } else {
                break;
            }
        }
    }

    /// Cooldown gate for restricted-area alerts, which share this state's
    /// bookkeeping under a reserved key prefix.
    pub fn restricted_alert_allowed(&mut self, area_id: &str, now_ms: i64, cooldown_ms: i64) -> bool {
        let key = format!("ra:{area_id}");
        let allowed = self
            .last_alert_ms
            .get(&key)
            .map(|t| now_ms - t >= cooldown_ms)
            .unwrap_or(true);
        if allowed {
            self.last_alert_ms.insert(key, now_ms);
        }
        allowed
    }

    fn cap_allows(&mut self, now_ms: i64, cap: u32) -> bool {
        while let Some(front) = self.alert_window_ms.front() {
            if now_ms - front > 60_000 {
                self.alert_window_ms.pop_front();
            } else {
                break;
            }
        }
        if self.alert_window_ms.len() >= cap as usize {
            self.dropped_alerts += 1;
            return false;
        }
        self.alert_window_ms.push_back(now_ms);
        true
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct GeofenceEngine {
    config: GeofenceConfig,
    graph: Arc<GraphStore>,
    broker: Arc<FacilityBroker>,
    snapshot: RwLock<Arc<ZoneSnapshot>>,
    /// Serializes CRUD and guards the WAL writer. `None` = persistence
    /// disabled (tests).
    writer: tokio::sync::Mutex<Option<ZoneWal>>,
}

impl GeofenceEngine {
    pub fn new(config: GeofenceConfig, graph: Arc<GraphStore>, broker: Arc<FacilityBroker>) -> Self {
        let snapshot = ZoneSnapshot::build(HashMap::new(), HashMap::new(), &config);
        Self {
            config,
            graph,
            broker,
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    /// Install baseline zones from the facility map, replay the WAL over
    /// them, and start persisting. Blocked-edge lists are recomputed for
    /// every effective zone and pushed to the broker.
    pub async fn bootstrap(
        &self,
        baseline_hazards: Vec<HazardZone>,
        restricted: Vec<RestrictedArea>,
        wal: Option<ZoneWal>,
        replayed: Vec<ZoneOp>,
        now_ms: i64,
    ) {
        let mut hazards: HashMap<String, Arc<HazardZone>> = baseline_hazards
            .into_iter()
            .map(|z| (z.id.clone(), Arc::new(z)))
            .collect();
        for op in replayed {
            apply_op(&mut hazards, op);
        }
        let restricted: HashMap<String, Arc<RestrictedArea>> =
            restricted.into_iter().map(|z| (z.id.clone(), Arc::new(z))).collect();

        let count = hazards.len();
        self.install(hazards, restricted);
        *self.writer.lock().await = wal;

        // Push blocked edges for everything effective at boot.
        let snapshot = self.snapshot();
        for zone in snapshot.hazards() {
            if zone.is_effective(now_ms) && blocks_edges(zone) {
                let blocked = self.compute_blocked_edges(zone);
                self.broker.apply_hazard_blocks(&zone.id, blocked);
            }
        }
        info!("geofence bootstrapped: {count} hazard zones, {} restricted areas",
            snapshot.restricted.len());
    }

    pub fn snapshot(&self) -> Arc<ZoneSnapshot> {
        self.snapshot.read().expect("zone snapshot lock poisoned").clone()
    }

    fn install(
        &self,
        hazards: HashMap<String, Arc<HazardZone>>,
        restricted: HashMap<String, Arc<RestrictedArea>>,
    ) {
        let next = ZoneSnapshot::build(hazards, restricted, &self.config);
        *self.snapshot.write().expect("zone snapshot lock poisoned") = Arc::new(next);
    }

    // ── CRUD (serialized behind the writer lock) ──────────────────────────

    pub async fn create_zone(&self, mut zone: HazardZone, now_ms: i64) -> CoreResult<()> {
        let mut writer = self.writer.lock().await;
        let snapshot = self.snapshot();
        if snapshot.hazards.contains_key(&zone.id) {
            return Err(CoreError::ZoneConflict(zone.id));
        }
        zone.blocked_edges = if zone.is_effective(now_ms) && blocks_edges(&zone) {
            self.compute_blocked_edges(&zone)
        } else {
            Vec::new()
        };

        let op = ZoneOp::Create { zone: zone.clone() };
        if let Some(wal) = writer.as_mut() {
            wal.commit(&op, now_ms).await?;
        }

        let blocked = zone.blocked_edges.clone();
        let mut hazards = snapshot.hazards.clone();
        hazards.insert(zone.id.clone(), Arc::new(zone.clone()));
        self.install(hazards, snapshot.restricted.clone());
        if !blocked.is_empty() {
            self.broker.apply_hazard_blocks(&zone.id, blocked);
        }
        info!("hazard zone {} created ({:?}, {:?})", zone.id, zone.kind, zone.severity);
        Ok(())
    }

    pub async fn update_zone(&self, mut zone: HazardZone, now_ms: i64) -> CoreResult<()> {
        let mut writer = self.writer.lock().await;
        let snapshot = self.snapshot();
        if !snapshot.hazards.contains_key(&zone.id) {
            return Err(CoreError::ZoneNotFound(zone.id));
        }
        zone.blocked_edges = if zone.is_effective(now_ms) && blocks_edges(&zone) {
            self.compute_blocked_edges(&zone)
        } else {
            Vec::new()
        };

        let op = ZoneOp::Update { zone: zone.clone() };
        if let Some(wal) = writer.as_mut() {
            wal.commit(&op, now_ms).await?;
        }

        let blocked = zone.blocked_edges.clone();
        let mut hazards = snapshot.hazards.clone();
        hazards.insert(zone.id.clone(), Arc::new(zone.clone()));
        self.install(hazards, snapshot.restricted.clone());
        self.broker.apply_hazard_blocks(&zone.id, blocked);
        Ok(())
    }

    pub async fn delete_zone(&self, zone_id: &str, now_ms: i64) -> CoreResult<()> {
        let mut writer = self.writer.lock().await;
        let snapshot = self.snapshot();
        if !snapshot.hazards.contains_key(zone_id) {
            return Err(CoreError::ZoneNotFound(zone_id.to_string()));
        }
        let op = ZoneOp::Delete { zone_id: zone_id.to_string() };
        if let Some(wal) = writer.as_mut() {
            wal.commit(&op, now_ms).await?;
        }
        let mut hazards = snapshot.hazards.clone();
        hazards.remove(zone_id);
        self.install(hazards, snapshot.restricted.clone());
        self.broker.apply_hazard_blocks(zone_id, Vec::new());
        info!("hazard zone {zone_id} deleted");
        Ok(())
    }

    pub async fn set_zone_status(&self, zone_id: &str, status: ZoneStatus, now_ms: i64) -> CoreResult<()> {
        let mut writer = self.writer.lock().await;
        let snapshot = self.snapshot();
        let Some(existing) = snapshot.hazards.get(zone_id) else {
            return Err(CoreError::ZoneNotFound(zone_id.to_string()));
        };
        let op = ZoneOp::Activate { zone_id: zone_id.to_string(), status };
        if let Some(wal) = writer.as_mut() {
            wal.commit(&op, now_ms).await?;
        }

        let mut zone = (**existing).clone();
        zone.status = status;
        let blocked = if zone.is_effective(now_ms) && blocks_edges(&zone) {
            self.compute_blocked_edges(&zone)
        } else {
            Vec::new()
        };
        zone.blocked_edges = blocked.clone();

        let mut hazards = snapshot.hazards.clone();
        hazards.insert(zone_id.to_string(), Arc::new(zone));
        self.install(hazards, snapshot.restricted.clone());
        self.broker.apply_hazard_blocks(zone_id, blocked);
        Ok(())
    }

    /// Job-wheel sweep: zones past their effective window resolve and
    /// release their blocked edges.
    pub async fn sweep_expired(&self, now_ms: i64) {
        let expired: Vec<String> = self
            .snapshot()
            .hazards()
            .filter(|z| {
                z.status == ZoneStatus::Active
                    && z.valid_until_ms.map(|t| now_ms > t).unwrap_or(false)
            })
            .map(|z| z.id.clone())
            .collect();
        for id in expired {
            debug!("hazard zone {id} expired; resolving");
            if let Err(e) = self.set_zone_status(&id, ZoneStatus::Resolved, now_ms).await {
                warn!("expiry sweep failed for {id}: {e}");
            }
        }
    }

    // ── Geometry vs the graph ─────────────────────────────────────────────

    /// Every graph edge whose xy segment crosses the zone on a matching
    /// floor. O(edges × polygons); zone mutations are rare enough.
    pub fn compute_blocked_edges(&self, zone: &HazardZone) -> Vec<String> {
        let graph = self.graph.snapshot();
        let mut blocked = Vec::new();
        for edge in graph.edges() {
            let (Some(from), Some(to)) = (graph.node(&edge.from_id), graph.node(&edge.to_id))
            else {
                continue;
            };
            let crossed = zone.geometry.polygons.iter().any(|poly| {
                (poly.floor == from.position.floor || poly.floor == to.position.floor)
                    && poly.intersects_segment(
                        [from.position.x, from.position.y],
                        [to.position.x, to.position.y],
                    )
            });
            if crossed {
                blocked.push(edge.id.clone());
            }
        }
        blocked.sort();
        blocked
    }

    // ── Per-pose evaluation ───────────────────────────────────────────────

    /// Classify one fused pose against all candidate zones. Events respect
    /// the per-(user, zone) cooldown and the per-user per-minute cap.
    pub fn evaluate_pose(
        &self,
        state: &mut UserZoneState,
        p: &LocalPoint,
        now_ms: i64,
    ) -> Vec<HazardAlertEvent> {
        let snapshot = self.snapshot();
        let mut events = Vec::new();

        for zone in snapshot.candidates(p) {
            if !zone.is_effective(now_ms) {
                continue;
            }
            let d = zone.geometry.signed_distance(p);
            if !d.is_finite() {
                continue;
            }
            let was_inside = state.inside.contains(&zone.id);
            let was_engaged = state.engaged.contains(&zone.id);
            let cooldown_ms = (zone.alert_cooldown_s * 1000.0) as i64;
            let cooldown_ok = state
                .last_alert_ms
                .get(&zone.id)
                .map(|t| now_ms - t >= cooldown_ms)
                .unwrap_or(true);

            if d <= 0.0 {
                // Inside the polygon
                state.engaged.insert(zone.id.clone());
                if !was_inside {
                    state.inside.insert(zone.id.clone());
                    if state.cap_allows(now_ms, self.config.batch_alert_threshold) {
                        state.last_alert_ms.insert(zone.id.clone(), now_ms);
                        events.push(alert(&zone, ProximityKind::Entered, d));
                    }
                }
            } else if d <= zone.proximity_threshold_m {
                // Proximity band
                state.inside.remove(&zone.id);
                state.engaged.insert(zone.id.clone());
                if cooldown_ok && state.cap_allows(now_ms, self.config.batch_alert_threshold) {
                    state.last_alert_ms.insert(zone.id.clone(), now_ms);
                    events.push(alert(&zone, ProximityKind::Approaching, d));
                }
            } else if was_engaged && d > zone.proximity_threshold_m * self.config.exit_hysteresis {
                // Beyond the hysteresis band
                state.inside.remove(&zone.id);
                state.engaged.remove(&zone.id);
                if state.cap_allows(now_ms, self.config.batch_alert_threshold) {
                    events.push(alert(&zone, ProximityKind::Exited, d));
                }
            }
        }
        events
    }

    // ── Restricted areas ──────────────────────────────────────────────────

    /// Restricted areas the user is inside without clearance right now.
    pub fn restricted_violations(
        &self,
        p: &LocalPoint,
        roles: &HashSet<String>,
        now_ms: i64,
    ) -> Vec<Arc<RestrictedArea>> {
        let snapshot = self.snapshot();
        snapshot
            .restricted
            .values()
            .filter(|area| area.geometry.contains(p))
            .filter(|area| !self.access_allowed(area, roles, now_ms))
            .cloned()
            .collect()
    }

    pub fn access_allowed(&self, area: &RestrictedArea, roles: &HashSet<String>, now_ms: i64) -> bool {
        use wayfind_types::AccessLevel;
        match area.access_level {
            AccessLevel::Public => true,
            AccessLevel::EmergencyOnly => roles.contains("emergency"),
            AccessLevel::AuthorizedOnly => {
                !area.allowed_roles.is_disjoint(&roles.iter().cloned().collect())
            }
            AccessLevel::Restricted => {
                let role_ok = area.allowed_roles.is_empty()
                    || !area.allowed_roles.is_disjoint(&roles.iter().cloned().collect());
                let schedule_ok = area
                    .schedule
                    .as_ref()
                    .map(|s| schedule_open(s, now_ms))
                    .unwrap_or(true);
                role_ok && schedule_ok
            }
        }
    }
}

fn alert(zone: &HazardZone, kind: ProximityKind, distance_m: f64) -> HazardAlertEvent {
    let verb = match kind {
        ProximityKind::Entered => "entered",
        ProximityKind::Approaching => "approaching",
        ProximityKind::Exited => "left",
    };
    let label = if zone.name.is_empty() { zone.id.clone() } else { zone.name.clone() };
    HazardAlertEvent {
        zone_id: zone.id.clone(),
        kind,
        severity: zone.severity,
        distance_m,
        message: format!("You have {verb} {label}"),
    }
}

/// Only zones severe enough to make their footprint untraversable close
/// edges; lower severities alert and weight routes without closing anything.
fn blocks_edges(zone: &HazardZone) -> bool {
    matches!(zone.severity, Severity::High | Severity::Critical)
}

fn apply_op(hazards: &mut HashMap<String, Arc<HazardZone>>, op: ZoneOp) {
    match op {
        ZoneOp::Create { zone } | ZoneOp::Update { zone } => {
            hazards.insert(zone.id.clone(), Arc::new(zone));
        }
        ZoneOp::Delete { zone_id } => {
            hazards.remove(&zone_id);
        }
        ZoneOp::Activate { zone_id, status } => {
            if let Some(existing) = hazards.get(&zone_id) {
                let mut zone = (**existing).clone();
                zone.status = status;
                hazards.insert(zone_id, Arc::new(zone));
            }
        }
    }
}

// ── Schedules ─────────────────────────────────────────────────────────────────

/// Evaluate a weekly schedule at `now_ms`, date exceptions first. Windows
/// with close < open span midnight.
pub fn schedule_open(schedule: &WeeklySchedule, now_ms: i64) -> bool {
    let Some(offset) = FixedOffset::east_opt(schedule.utc_offset_min * 60) else {
        warn!("schedule for tz {} has invalid offset", schedule.timezone);
        return false;
    };
    let Some(utc) = Utc.timestamp_millis_opt(now_ms).single() else {
        return false;
    };
    let local = utc.with_timezone(&offset);
    let date_str = local.format("%Y-%m-%d").to_string();
    let minutes = (local.hour() * 60 + local.minute()) as u16;

    let window = schedule
        .exceptions
        .iter()
        .find(|e| e.date == date_str)
        .map(|e| e.window)
        .unwrap_or_else(|| {
            let day_idx = local.weekday().num_days_from_monday() as usize;
            schedule.days[day_idx]
        });

    match window {
        None => false,
        Some(w) => {
            if w.close_min >= w.open_min {
                minutes >= w.open_min && minutes < w.close_min
            } else {
                minutes >= w.open_min || minutes < w.close_min
            }
        }
    }
}

// ── Safest-route severity lookup ──────────────────────────────────────────────

impl HazardScore for GeofenceEngine {
    fn edge_severity(&self, edge: &NavEdge) -> f64 {
        let graph = self.graph.snapshot();
        let (Some(from), Some(to)) = (graph.node(&edge.from_id), graph.node(&edge.to_id)) else {
            return 0.0;
        };
        let mid = LocalPoint::new(
            (from.position.x + to.position.x) / 2.0,
            (from.position.y + to.position.y) / 2.0,
            (from.position.z + to.position.z) / 2.0,
            from.position.floor,
        );
        let now_ms = chrono::Utc::now().timestamp_millis();
        let snapshot = self.snapshot();
        let mut score: f64 = 0.0;
        for zone in snapshot.candidates(&mid) {
            if !zone.is_effective(now_ms) {
                continue;
            }
            let d = zone.geometry.signed_distance(&mid);
            if d <= zone.proximity_threshold_m {
                score = score.max(zone.severity.score());
            }
        }
        score
    }
}
