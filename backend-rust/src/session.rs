//! # session
//!
//! Session & Event Bus — one actor task per active user owning every piece of
//! that user's mutable state (pose filter, route session, zone cooldowns,
//! frame state), plus the subscription fan-out.
//!
//! ## Concurrency model
//! External calls are message-passed into the actor's mailbox; nothing
//! mutates a user's state from two tasks. Events derived from one pose are
//! delivered before events from the next, and a pose that triggers a re-plan
//! is delivered before the resulting route update (the re-plan completes on
//! a later mailbox turn by construction).
//!
//! ## Backpressure
//! Each subscriber has a bounded queue. Pose/facility frames are lossy:
//! overflow collapses to the latest frame. Route/instruction/alert frames
//! block briefly; on timeout the subscription is marked slow and frames
//! coalesce (latest route wins, alerts keep a bounded backlog).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wayfind_types::{
    EventFrame, FrameKind, FusedPose, LocalPoint, OptimizationSpec, Route, RouteEvent,
    RouteEventKind, SensorSample, Topic, TransitionEvent,
};

use crate::broker::{FacilityBroker, FacilityChange};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::fusion::{prepare_samples, FilterEvent, PoseFilter, PrepContext};
use crate::geofence::{GeofenceEngine, UserZoneState};
use crate::graph::GraphStore;
use crate::handoff::{FrameDecision, FrameSignals, HandoffEngine, UserFrameState};
use crate::route_session::{ReplanReason, RouteAction, RouteSession, RouteSessionStatus};
use crate::router::RoutePlanner;

// ── Shared engine bundle ──────────────────────────────────────────────────────

/// Everything a session actor needs, constructed once at boot.
pub struct Engines {
    pub config: CoreConfig,
    pub graph: Arc<GraphStore>,
    pub planner: Arc<RoutePlanner>,
    pub geofence: Arc<GeofenceEngine>,
    pub handoff: Arc<HandoffEngine>,
    pub broker: Arc<FacilityBroker>,
    pub beacons: HashMap<String, LocalPoint>,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub enum SessionCommand {
    IngestSamples {
        samples: Vec<SensorSample>,
        /// Synchronous callers receive the fused pose; UDP ingest passes None.
        reply: Option<oneshot::Sender<CoreResult<Option<FusedPose>>>>,
    },
    PlanRoute {
        destination: LocalPoint,
        optimization: OptimizationSpec,
        reply: oneshot::Sender<CoreResult<Route>>,
    },
    CancelRoute {
        reply: oneshot::Sender<bool>,
    },
    PauseRoute,
    ResumeRoute,
    ActiveRoute {
        reply: oneshot::Sender<Option<Route>>,
    },
    Subscribe {
        topics: HashSet<Topic>,
        tx: mpsc::Sender<EventFrame>,
        reply: oneshot::Sender<String>,
    },
    Unsubscribe {
        subscription_id: String,
    },
    SetRoles {
        roles: HashSet<String>,
    },
    ReplanDone {
        generation: u64,
        result: CoreResult<Arc<Route>>,
    },
    Tick {
        now_ms: i64,
    },
    Shutdown,
}

// ── Subscriptions ─────────────────────────────────────────────────────────────

struct Subscription {
    id: String,
    topics: HashSet<Topic>,
    tx: mpsc::Sender<EventFrame>,
    slow: bool,
    /// Latest coalesced frame per topic, replayed before new sends.
    pending: HashMap<Topic, EventFrame>,
    /// Bounded alert backlog for slow subscribers.
    pending_alerts: VecDeque<EventFrame>,
    dropped: u64,
}

const PENDING_ALERT_CAP: usize = 32;

impl Subscription {
    fn new(id: String, topics: HashSet<Topic>, tx: mpsc::Sender<EventFrame>) -> Self {
        Self {
            id,
            topics,
            tx,
            slow: false,
            pending: HashMap::new(),
            pending_alerts: VecDeque::new(),
            dropped: 0,
        }
    }

    fn wants(&self, topic: Topic) -> bool {
        self.topics.is_empty() || self.topics.contains(&topic)
    }

    /// Retry whatever was coalesced while the queue was full.
    fn flush_pending(&mut self) {
        while let Some(frame) = self.pending_alerts.front() {
            match self.tx.try_send(frame.clone()) {
                Ok(()) => {
                    self.pending_alerts.pop_front();
                }
                Err(_) => return,
            }
        }
        let topics: Vec<Topic> = self.pending.keys().copied().collect();
        for topic in topics {
            let frame = self.pending.remove(&topic).expect("key just listed");
            if let Err(mpsc::error::TrySendError::Full(frame)) = self.tx.try_send(frame) {
                self.pending.insert(topic, frame);
                return;
            }
        }
        if self.pending.is_empty() && self.pending_alerts.is_empty() {
            self.slow = false;
        }
    }

    async fn deliver(&mut self, frame: EventFrame, critical_timeout: Duration) -> bool {
        if !self.wants(frame.topic) {
            return true;
        }
        self.flush_pending();

        if frame.topic.is_lossy() {
            match self.tx.try_send(frame) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    // replaceable: keep only the newest
                    self.pending.insert(frame.topic, frame);
                    self.dropped += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        } else {
            match tokio::time::timeout(critical_timeout, self.tx.send(frame.clone())).await {
                Ok(Ok(())) => true,
                Ok(Err(_)) => false,
                Err(_) => {
                    if !self.slow {
                        warn!("subscriber {} is slow; coalescing events", self.id);
                        self.slow = true;
                    }
                    match frame.topic {
                        Topic::HazardAlert => {
                            if self.pending_alerts.len() >= PENDING_ALERT_CAP {
                                self.pending_alerts.pop_front();
                                self.dropped += 1;
                            }
                            self.pending_alerts.push_back(frame);
                        }
                        _ => {
                            // route/instruction: latest wins
                            self.pending.insert(frame.topic, frame);
                        }
                    }
                    true
                }
            }
        }
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

fn now_wall_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn frame_for(topic: Topic, user_id: &str, timestamp_ms: i64, payload: serde_json::Value) -> EventFrame {
    EventFrame { topic, user_id: Some(user_id.to_string()), timestamp: timestamp_ms, payload }
}

struct SessionActor {
    user_id: String,
    engines: Arc<Engines>,
    filter: PoseFilter,
    route: RouteSession,
    zone_state: UserZoneState,
    frame_state: UserFrameState,
    roles: HashSet<String>,
    subscriptions: Vec<Subscription>,
    /// Supersession counter: only the newest re-plan's result is applied.
    replan_generation: u64,
    replan_cancel: Option<Arc<AtomicBool>>,
    last_activity_ms: Arc<AtomicI64>,
    self_tx: mpsc::Sender<SessionCommand>,
    rejected_samples: u64,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        debug!("session actor for {} started", self.user_id);
        let mut changes = self.engines.broker.subscribe_changes();
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if self.handle(cmd).await {
                        break;
                    }
                }
                change = changes.recv() => {
                    match change {
                        Ok(change) => self.on_facility_change(change).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!("session {} missed {n} facility changes", self.user_id);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                    }
                }
            }
        }
        // Cancel any in-flight re-plan on the way out.
        if let Some(cancel) = &self.replan_cancel {
            cancel.store(true, Ordering::Relaxed);
        }
        debug!(
            "session actor for {} stopped ({} samples rejected over its lifetime)",
            self.user_id, self.rejected_samples
        );
    }

    /// Returns true when the actor should stop.
    async fn handle(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::IngestSamples { samples, reply } => {
                let result = self.on_samples(&samples).await;
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                false
            }
            SessionCommand::PlanRoute { destination, optimization, reply } => {
                let result = self.on_plan_route(destination, optimization).await;
                let _ = reply.send(result);
                false
            }
            SessionCommand::CancelRoute { reply } => {
                let cancelled = self.route.cancel();
                if cancelled {
                    if let Some(cancel) = &self.replan_cancel {
                        cancel.store(true, Ordering::Relaxed);
                    }
                    self.emit_route_event(RouteEventKind::RouteCancelled, None, None).await;
                }
                let _ = reply.send(cancelled);
                false
            }
            SessionCommand::PauseRoute => {
                self.route.pause();
                false
            }
            SessionCommand::ResumeRoute => {
                self.route.resume();
                false
            }
            SessionCommand::ActiveRoute { reply } => {
                let _ = reply.send(self.route.route().map(|r| (**r).clone()));
                false
            }
            SessionCommand::Subscribe { topics, tx, reply } => {
                let id = format!("sub-{}", Uuid::new_v4());
                self.subscriptions.push(Subscription::new(id.clone(), topics, tx));
                let _ = reply.send(id);
                false
            }
            SessionCommand::Unsubscribe { subscription_id } => {
                self.subscriptions.retain(|s| s.id != subscription_id);
                false
            }
            SessionCommand::SetRoles { roles } => {
                self.roles = roles;
                false
            }
            SessionCommand::ReplanDone { generation, result } => {
                self.on_replan_done(generation, result).await;
                false
            }
            SessionCommand::Tick { now_ms } => {
                self.on_tick(now_ms).await;
                false
            }
            SessionCommand::Shutdown => true,
        }
    }

    // ── Pose pipeline ─────────────────────────────────────────────────────

    async fn on_samples(&mut self, samples: &[SensorSample]) -> CoreResult<Option<FusedPose>> {
        if samples.is_empty() {
            return Err(CoreError::InvalidInput("empty sample batch".into()));
        }
        let now_ms = now_wall_ms();
        self.last_activity_ms.store(now_ms, Ordering::Relaxed);

        let floor_hint = self.filter.latest().map(|p| p.position.floor).unwrap_or(0);
        let anchor = self
            .filter
            .latest()
            .map(|p| p.position)
            .unwrap_or_else(|| LocalPoint::new(0.0, 0.0, 0.0, floor_hint));
        let in_transition_zone = self.engines.handoff.zone_for_local(&anchor).is_some()
            || self.frame_state.frame == FrameKind::Transition;

        let ctx = PrepContext {
            handoff: &self.engines.handoff,
            beacons: &self.engines.beacons,
            in_transition_zone,
            floor_hint,
            now_ns: now_ms * 1_000_000,
        };
        let (measurements, rejected) =
            prepare_samples(samples, &self.engines.config.fusion, &ctx);
        self.rejected_samples += rejected.len() as u64;

        let outcome = self.filter.ingest(&measurements, in_transition_zone, floor_hint);
        for event in &outcome.events {
            self.emit_filter_event(event, now_ms).await;
        }

        let Some(mut pose) = outcome.pose else {
            return Ok(None);
        };

        // Frame arbitration on the fresh pose.
        let signals = FrameSignals {
            position: pose.position,
            gps_accuracy_m: samples
                .iter()
                .filter(|s| s.source == wayfind_types::SensorSource::Gps)
                .filter_map(|s| s.accuracy_m)
                .fold(None, |acc: Option<f64>, a| Some(acc.map_or(a, |b| b.min(a)))),
            slam_confidence: samples
                .iter()
                .filter(|s| s.source == wayfind_types::SensorSource::Slam)
                .filter_map(|s| s.confidence)
                .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |b| b.max(c)))),
            ble_confidence: samples
                .iter()
                .filter(|s| s.source == wayfind_types::SensorSource::Ble)
                .filter_map(|s| s.confidence)
                .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |b| b.max(c)))),
            now_ms,
        };
        let decision = self.engines.handoff.evaluate(&mut self.frame_state, &signals);
        self.filter.set_frame(self.frame_state.frame);
        pose.frame = self.frame_state.frame;
        self.emit_frame_decision(&decision, now_ms).await;

        // Pose out first; everything derived from it follows in order.
        let payload = serde_json::to_value(&pose).unwrap_or_default();
        self.emit(frame_for(Topic::Pose, &self.user_id, now_ms, payload)).await;

        // Hazard / restricted-area engagement.
        let alerts = self
            .engines
            .geofence
            .evaluate_pose(&mut self.zone_state, &pose.position, now_ms);
        for alert in alerts {
            let payload = serde_json::to_value(&alert).unwrap_or_default();
            self.emit(frame_for(Topic::HazardAlert, &self.user_id, now_ms, payload)).await;
        }
        let violations = self
            .engines
            .geofence
            .restricted_violations(&pose.position, &self.roles, now_ms);
        for area in violations {
            if !self.zone_state.restricted_alert_allowed(&area.id, now_ms, 30_000) {
                continue;
            }
            self.emit(frame_for(
                Topic::HazardAlert,
                &self.user_id,
                now_ms,
                json!({
                    "zoneId": area.id,
                    "kind": "RESTRICTED_ACCESS",
                    "message": format!("Access to {} is restricted", if area.name.is_empty() { &area.id } else { &area.name }),
                }),
            ))
            .await;
        }

        // Route tracking.
        let graph = self.engines.graph.snapshot();
        let progress_before = self.route.progress_index();
        let actions = self.route.on_pose(&pose, &graph);
        let progress_after = self.route.progress_index();
        // Crossing onto a new edge surfaces its turn-by-turn instruction.
        let next_instruction = if progress_after > progress_before {
            self.route
                .route()
                .and_then(|r| r.instructions.get(progress_after + 1).cloned())
        } else {
            None
        };
        for action in actions {
            match action {
                RouteAction::Completed => {
                    self.emit_route_event(RouteEventKind::RouteCompleted, None, None).await;
                }
                RouteAction::DeviationCounted { count } => {
                    debug!("user {} deviation #{count}", self.user_id);
                }
                RouteAction::RequestReplan { reason } => {
                    self.spawn_replan(reason).await;
                }
            }
        }
        if let Some(instruction) = next_instruction {
            let payload = serde_json::to_value(&instruction).unwrap_or_default();
            self.emit(frame_for(Topic::Instruction, &self.user_id, now_ms, payload)).await;
        }

        Ok(Some(pose))
    }

    async fn emit_filter_event(&mut self, event: &FilterEvent, now_ms: i64) {
        let name = match event {
            FilterEvent::PoseLost => "pose_lost",
            FilterEvent::PoseReset => "pose_reset",
            FilterEvent::Degraded => "pose_degraded",
            FilterEvent::Recovered => "pose_recovered",
        };
        self.emit(frame_for(Topic::Pose, &self.user_id, now_ms, json!({ "event": name })))
            .await;
    }

    async fn emit_frame_decision(&mut self, decision: &FrameDecision, now_ms: i64) {
        let event = match decision {
            FrameDecision::Stay | FrameDecision::EnterTransition { .. } => None,
            FrameDecision::SwitchOutdoor { zone_id } => Some(TransitionEvent {
                from: FrameKind::Indoor,
                to: FrameKind::Outdoor,
                zone_id: Some(zone_id.clone()),
            }),
            FrameDecision::SwitchIndoor { zone_id } => Some(TransitionEvent {
                from: FrameKind::Outdoor,
                to: FrameKind::Indoor,
                zone_id: Some(zone_id.clone()),
            }),
            FrameDecision::ExitTransition { committed, zone_id } => {
                let from = self.frame_state.entered_from.take().unwrap_or(FrameKind::Transition);
                if from == *committed {
                    None // transition resolved back to where it started
                } else {
                    Some(TransitionEvent {
                        from,
                        to: *committed,
                        zone_id: Some(zone_id.clone()),
                    })
                }
            }
        };
        if let Some(event) = event {
            info!(
                "user {} frame handoff {:?} -> {:?} via {:?}",
                self.user_id, event.from, event.to, event.zone_id
            );
            let payload = serde_json::to_value(&event).unwrap_or_default();
            self.emit(frame_for(Topic::Transition, &self.user_id, now_ms, payload)).await;
        }
    }

    // ── Routing ───────────────────────────────────────────────────────────

    async fn on_plan_route(
        &mut self,
        destination: LocalPoint,
        optimization: OptimizationSpec,
    ) -> CoreResult<Route> {
        self.last_activity_ms.store(now_wall_ms(), Ordering::Relaxed);
        let Some(pose) = self.filter.latest().cloned() else {
            return Err(CoreError::InvalidInput(format!(
                "user {} has no fused pose yet",
                self.user_id
            )));
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let route = self
            .engines
            .planner
            .plan(pose.position, destination, optimization, cancel)
            .await?;

        self.route.start(route.clone(), destination, optimization);
        self.emit_route_event(RouteEventKind::RouteUpdated, Some((*route).clone()), None).await;
        Ok((*route).clone())
    }

    async fn spawn_replan(&mut self, reason: ReplanReason) {
        let Some(start) = self.filter.latest().map(|p| p.position) else {
            return;
        };
        let Some(destination) = self.route.destination() else {
            return;
        };
        // Supersede any in-flight computation.
        if let Some(old) = self.replan_cancel.take() {
            old.store(true, Ordering::Relaxed);
        }
        self.replan_generation += 1;
        let generation = self.replan_generation;
        let cancel = Arc::new(AtomicBool::new(false));
        self.replan_cancel = Some(cancel.clone());

        // Advisory goes out before the new route, always.
        if matches!(reason, ReplanReason::HazardInvalidated | ReplanReason::FacilityInvalidated) {
            self.emit_route_event(
                RouteEventKind::Advisory,
                None,
                Some("your route is affected by a facility change; recalculating".to_string()),
            )
            .await;
        }

        let planner = self.engines.planner.clone();
        let optimization = *self.route.optimization();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = planner.plan(start, destination, optimization, cancel).await;
            let _ = tx.send(SessionCommand::ReplanDone { generation, result }).await;
        });
    }

    async fn on_replan_done(&mut self, generation: u64, result: CoreResult<Arc<Route>>) {
        if generation != self.replan_generation {
            debug!("stale re-plan result (gen {generation}) discarded");
            return;
        }
        self.replan_cancel = None;
        let failed_code = result.as_ref().err().map(|e| e.code().to_string());
        match self.route.on_replan_result(result) {
            Some(route) => {
                self.emit_route_event(RouteEventKind::RouteUpdated, Some((*route).clone()), None)
                    .await;
            }
            None => {
                if self.route.status() == RouteSessionStatus::Recomputing {
                    self.emit(frame_for(
                        Topic::Route,
                        &self.user_id,
                        now_wall_ms(),
                        serde_json::to_value(RouteEvent {
                            kind: RouteEventKind::RouteUnavailable,
                            route: self.route.route().map(|r| (**r).clone()),
                            code: failed_code,
                            message: Some("no viable route right now; keeping the previous route flagged stale".into()),
                        })
                        .unwrap_or_default(),
                    ))
                    .await;
                }
            }
        }
    }

    async fn on_facility_change(&mut self, change: FacilityChange) {
        let now_ms = now_wall_ms();
        self.emit(frame_for(
            Topic::FacilityChange,
            &self.user_id,
            now_ms,
            json!({
                "graphVersion": change.graph_version,
                "reason": change.reason,
                "changedEdges": change.changed_edges.len(),
            }),
        ))
        .await;

        let reason = if change.reason.starts_with("hazard") {
            ReplanReason::HazardInvalidated
        } else {
            ReplanReason::FacilityInvalidated
        };
        if let Some(RouteAction::RequestReplan { reason }) =
            self.route.on_edges_invalidated(&change.changed_edges, reason)
        {
            self.spawn_replan(reason).await;
        }
    }

    async fn emit_route_event(
        &mut self,
        kind: RouteEventKind,
        route: Option<Route>,
        message: Option<String>,
    ) {
        let payload = serde_json::to_value(RouteEvent { kind, route, code: None, message })
            .unwrap_or_default();
        self.emit(frame_for(Topic::Route, &self.user_id, now_wall_ms(), payload)).await;
    }

    // ── Fan-out ───────────────────────────────────────────────────────────

    async fn emit(&mut self, frame: EventFrame) {
        let timeout = Duration::from_millis(self.engines.config.session.critical_send_timeout_ms);
        let mut alive = Vec::with_capacity(self.subscriptions.len());
        for mut sub in self.subscriptions.drain(..) {
            if sub.deliver(frame.clone(), timeout).await {
                alive.push(sub);
            } else {
                debug!("subscriber {} disconnected", sub.id);
            }
        }
        self.subscriptions = alive;
    }

    async fn on_tick(&mut self, now_ms: i64) {
        for event in self.filter.tick(now_ms * 1_000_000) {
            self.emit_filter_event(&event, now_ms).await;
        }
        self.zone_state.gc(now_ms, 3_600_000);
        for sub in &mut self.subscriptions {
            sub.flush_pending();
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct SessionHandle {
    pub cmd_tx: mpsc::Sender<SessionCommand>,
    last_activity_ms: Arc<AtomicI64>,
}

/// Process-wide registry of user sessions, created at boot and torn down on
/// shutdown. Sessions are created on first use and reaped after the idle TTL.
pub struct SessionRegistry {
    engines: Arc<Engines>,
    sessions: tokio::sync::RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(engines: Arc<Engines>) -> Arc<Self> {
        Arc::new(Self { engines, sessions: tokio::sync::RwLock::new(HashMap::new()) })
    }

    pub fn engines(&self) -> &Arc<Engines> {
        &self.engines
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Sender for the user's actor, spawning it on first touch.
    pub async fn ensure(&self, user_id: &str) -> mpsc::Sender<SessionCommand> {
        if let Some(handle) = self.sessions.read().await.get(user_id) {
            return handle.cmd_tx.clone();
        }
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(user_id) {
            return handle.cmd_tx.clone();
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(self.engines.config.session.mailbox_len);
        let last_activity_ms = Arc::new(AtomicI64::new(now_wall_ms()));
        let actor = SessionActor {
            user_id: user_id.to_string(),
            engines: self.engines.clone(),
            filter: PoseFilter::new(self.engines.config.fusion.clone()),
            route: RouteSession::new(self.engines.config.tracking.clone()),
            zone_state: UserZoneState::default(),
            frame_state: UserFrameState::default(),
            roles: HashSet::new(),
            subscriptions: Vec::new(),
            replan_generation: 0,
            replan_cancel: None,
            last_activity_ms: last_activity_ms.clone(),
            self_tx: cmd_tx.clone(),
            rejected_samples: 0,
        };
        tokio::spawn(actor.run(cmd_rx));
        info!("session created for user {user_id}");
        sessions.insert(user_id.to_string(), SessionHandle { cmd_tx: cmd_tx.clone(), last_activity_ms });
        cmd_tx
    }

    pub async fn send(&self, user_id: &str, cmd: SessionCommand) -> CoreResult<()> {
        let tx = self.ensure(user_id).await;
        tx.send(cmd)
            .await
            .map_err(|_| CoreError::internal(&format!("session mailbox closed for {user_id}")))
    }

    /// Route a command to an existing session only; unknown users error.
    pub async fn send_existing(&self, user_id: &str, cmd: SessionCommand) -> CoreResult<()> {
        let sessions = self.sessions.read().await;
        let Some(handle) = sessions.get(user_id) else {
            return Err(CoreError::InvalidInput(format!("unknown user {user_id}")));
        };
        handle
            .cmd_tx
            .send(cmd)
            .await
            .map_err(|_| CoreError::internal(&format!("session mailbox closed for {user_id}")))
    }

    /// Explicit logout: stop the actor and drop the handle.
    pub async fn remove(&self, user_id: &str) {
        let handle = self.sessions.write().await.remove(user_id);
        if let Some(handle) = handle {
            let _ = handle.cmd_tx.send(SessionCommand::Shutdown).await;
            info!("session removed for user {user_id}");
        }
    }

    /// Job-wheel tick: drive per-session timers (Degraded/Lost walks,
    /// cooldown GC, pending-frame flushes).
    pub async fn tick_all(&self, now_ms: i64) {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            let _ = handle.cmd_tx.try_send(SessionCommand::Tick { now_ms });
        }
    }

    /// Job-wheel sweep: shut down sessions idle past the configured TTL.
    pub async fn reap_idle(&self, now_ms: i64) {
        let idle_ttl = self.engines.config.session.idle_ttl_ms as i64;
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, handle)| {
                    now_ms - handle.last_activity_ms.load(Ordering::Relaxed) > idle_ttl
                })
                .map(|(user_id, _)| user_id.clone())
                .collect()
        };
        for user_id in expired {
            info!("session for {user_id} idle past TTL; reaping");
            self.remove(&user_id).await;
        }
    }

    pub async fn shutdown_all(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, handle) in sessions.drain() {
            let _ = handle.cmd_tx.send(SessionCommand::Shutdown).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(topic: Topic) -> EventFrame {
        EventFrame { topic, user_id: Some("u1".into()), timestamp: 0, payload: json!({}) }
    }

    #[tokio::test]
    async fn lossy_topic_overflow_coalesces_to_latest() {
        let (tx, mut rx) = mpsc::channel(2);
        let mut sub = Subscription::new("s1".into(), HashSet::new(), tx);
        let timeout = Duration::from_millis(10);

        for i in 0..5 {
            let mut f = frame(Topic::Pose);
            f.timestamp = i;
            assert!(sub.deliver(f, timeout).await);
        }
        // queue held 2, the rest coalesced into one pending frame
        assert_eq!(rx.recv().await.unwrap().timestamp, 0);
        assert_eq!(rx.recv().await.unwrap().timestamp, 1);
        assert!(sub.dropped > 0);
        sub.flush_pending();
        assert_eq!(rx.recv().await.unwrap().timestamp, 4);
    }

    #[tokio::test]
    async fn critical_topic_marks_slow_and_replays_latest_route() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sub = Subscription::new("s1".into(), HashSet::new(), tx);
        let timeout = Duration::from_millis(20);

        let mut r1 = frame(Topic::Route);
        r1.timestamp = 1;
        assert!(sub.deliver(r1, timeout).await);
        // queue is now full; the next two route frames coalesce, latest wins
        let mut r2 = frame(Topic::Route);
        r2.timestamp = 2;
        assert!(sub.deliver(r2, timeout).await);
        assert!(sub.slow);
        let mut r3 = frame(Topic::Route);
        r3.timestamp = 3;
        assert!(sub.deliver(r3, timeout).await);

        assert_eq!(rx.recv().await.unwrap().timestamp, 1);
        sub.flush_pending();
        assert_eq!(rx.recv().await.unwrap().timestamp, 3);
        assert!(!sub.slow);
    }

    #[tokio::test]
    async fn alert_backlog_is_bounded() {
        let (tx, _rx) = mpsc::channel(1);
        let mut sub = Subscription::new("s1".into(), HashSet::new(), tx);
        let timeout = Duration::from_millis(5);
        for i in 0..(PENDING_ALERT_CAP + 5) {
            let mut f = frame(Topic::HazardAlert);
            f.timestamp = i as i64;
            sub.deliver(f, timeout).await;
        }
        assert!(sub.pending_alerts.len() <= PENDING_ALERT_CAP);
        assert!(sub.dropped > 0);
    }

    #[tokio::test]
    async fn closed_subscriber_is_removed_on_delivery() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sub = Subscription::new("s1".into(), HashSet::new(), tx);
        assert!(!sub.deliver(frame(Topic::Route), Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn topic_filter_applies() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut topics = HashSet::new();
        topics.insert(Topic::HazardAlert);
        let mut sub = Subscription::new("s1".into(), topics, tx);
        let timeout = Duration::from_millis(5);
        assert!(sub.deliver(frame(Topic::Pose), timeout).await);
        assert!(sub.deliver(frame(Topic::HazardAlert), timeout).await);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.topic, Topic::HazardAlert);
        assert!(rx.try_recv().is_err());
    }
}
