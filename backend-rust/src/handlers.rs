use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use socketioxide::extract::{Data, SocketRef};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use wayfind_types::{
    EventFrame, HazardZone, HelloFrame, LocalPoint, OptimizationSpec, SensorSample, Topic,
    ZoneStatus, PROTOCOL_VERSION,
};

use crate::auth::AuthEngine;
use crate::broker::{AssetStatusUpdate, CrowdDensityUpdate};
use crate::error::CoreError;
use crate::facility::load_facility_map;
use crate::session::{SessionCommand, SessionRegistry};

// ─── Shared app state ─────────────────────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub auth: Arc<AuthEngine>,
    pub facility_path: PathBuf,
    /// Administrative optimization-default override.
    pub default_optimization: RwLock<OptimizationSpec>,
    /// socket id → (user id, subscription id) pairs, cleaned on disconnect.
    subscriptions: RwLock<HashMap<String, Vec<(String, String)>>>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, auth: Arc<AuthEngine>, facility_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            registry,
            auth,
            facility_path,
            default_optimization: RwLock::new(OptimizationSpec::default()),
            subscriptions: RwLock::new(HashMap::new()),
        })
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn emit_error(s: &SocketRef, err: &CoreError) {
    let _ = s.emit("error", &err.to_body());
}

fn parse_local_point(v: &Value) -> Option<LocalPoint> {
    Some(LocalPoint::new(
        v["x"].as_f64()?,
        v["y"].as_f64()?,
        v["z"].as_f64().unwrap_or(0.0),
        v["floor"].as_i64().unwrap_or(0) as i32,
    ))
}

fn parse_topics(v: &Value) -> HashSet<Topic> {
    v.as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|t| serde_json::from_value::<Topic>(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

async fn require_role(s: &SocketRef, state: &AppState, role: &str) -> bool {
    if state.auth.has_role(&s.id.to_string(), role).await {
        return true;
    }
    warn!("unauthorized {role} operation attempted by {}", s.id);
    emit_error(s, &CoreError::Unauthorized);
    false
}

// ─── Main connection handler ──────────────────────────────────────────────────

pub async fn on_connect(socket: SocketRef, state: Arc<AppState>) {
    let socket_id = socket.id.to_string();
    info!("client connected: {socket_id}");

    // hello frame: protocol + graph version, sent before registration
    let hello = HelloFrame {
        protocol_version: PROTOCOL_VERSION,
        graph_version: state.registry.engines().graph.version(),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let _ = socket.emit("hello", &hello);

    // Cleanup on disconnect: drop role and tear down this socket's
    // subscriptions so the session actors stop queueing for it.
    socket.on_disconnect({
        let state = state.clone();
        let sid = socket_id.clone();
        move |_: SocketRef| async move {
            state.auth.remove_role(&sid).await;
            let subs = state.subscriptions.write().await.remove(&sid).unwrap_or_default();
            for (user_id, subscription_id) in subs {
                let _ = state
                    .registry
                    .send_existing(&user_id, SessionCommand::Unsubscribe { subscription_id })
                    .await;
            }
            info!("client disconnected: {sid}");
        }
    });

    // ── register ──────────────────────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("register", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                let token = data["token"].as_str().unwrap_or("");
                let Some(role) = state.auth.resolve_role(token) else {
                    warn!("client {}: invalid authentication token", s.id);
                    let _ = s.emit("error", &CoreError::Unauthorized.to_body());
                    let _ = s.disconnect();
                    return;
                };
                state.auth.set_role(&s.id.to_string(), &role).await;
                let _ = s.join(role.clone());

                // Client devices bind to a user session; the role set feeds
                // restricted-area access checks on that user's poses.
                if let Some(user_id) = data["userId"].as_str() {
                    let mut roles = HashSet::new();
                    roles.insert(role.clone());
                    let _ = state
                        .registry
                        .send(user_id, SessionCommand::SetRoles { roles })
                        .await;
                }

                info!("client {} registered as {role}", s.id);
                let _ = s.emit("registered", &json!({ "role": role }));
            }
        });
    }

    // ── latency-ping ──────────────────────────────────────────────────────────
    {
        socket.on("latency-ping", move |s: SocketRef, Data::<Value>(data)| async move {
            let _ = s.emit("latency-pong", &data);
        });
    }

    // ── position-update (synchronous ingest path) ─────────────────────────────
    {
        let state = state.clone();
        socket.on("position-update", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                let Some(user_id) = data["userId"].as_str().map(str::to_string) else {
                    emit_error(&s, &CoreError::InvalidInput("userId required".into()));
                    return;
                };
                let samples: Vec<SensorSample> =
                    match serde_json::from_value(data["samples"].clone()) {
                        Ok(samples) => samples,
                        Err(e) => {
                            emit_error(&s, &CoreError::InvalidInput(format!("bad samples: {e}")));
                            return;
                        }
                    };

                let (tx, rx) = oneshot::channel();
                let cmd = SessionCommand::IngestSamples { samples, reply: Some(tx) };
                if let Err(e) = state.registry.send(&user_id, cmd).await {
                    emit_error(&s, &e);
                    return;
                }
                match rx.await {
                    Ok(Ok(Some(pose))) => {
                        let _ = s.emit("pose", &json!({ "userId": user_id, "pose": pose }));
                    }
                    Ok(Ok(None)) => {
                        let _ = s.emit("pose-ack", &json!({ "userId": user_id }));
                    }
                    Ok(Err(e)) => emit_error(&s, &e),
                    Err(_) => emit_error(&s, &CoreError::internal("session dropped reply")),
                }
            }
        });
    }

    // ── plan-route ────────────────────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("plan-route", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                let Some(user_id) = data["userId"].as_str().map(str::to_string) else {
                    emit_error(&s, &CoreError::InvalidInput("userId required".into()));
                    return;
                };
                let Some(destination) = parse_local_point(&data["destination"]) else {
                    emit_error(&s, &CoreError::InvalidInput("destination required".into()));
                    return;
                };
                let optimization = if data["optimization"].is_object() {
                    match serde_json::from_value(data["optimization"].clone()) {
                        Ok(spec) => spec,
                        Err(e) => {
                            emit_error(&s, &CoreError::InvalidInput(format!("bad optimization: {e}")));
                            return;
                        }
                    }
                } else {
                    *state.default_optimization.read().await
                };

                let (tx, rx) = oneshot::channel();
                let cmd = SessionCommand::PlanRoute { destination, optimization, reply: tx };
                if let Err(e) = state.registry.send(&user_id, cmd).await {
                    emit_error(&s, &e);
                    return;
                }
                match rx.await {
                    Ok(Ok(route)) => {
                        let _ = s.emit("route-result", &json!({ "userId": user_id, "route": route }));
                    }
                    Ok(Err(e)) => emit_error(&s, &e),
                    Err(_) => emit_error(&s, &CoreError::internal("session dropped reply")),
                }
            }
        });
    }

    // ── cancel-route ──────────────────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("cancel-route", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                let Some(user_id) = data["userId"].as_str().map(str::to_string) else {
                    emit_error(&s, &CoreError::InvalidInput("userId required".into()));
                    return;
                };
                let (tx, rx) = oneshot::channel();
                if let Err(e) =
                    state.registry.send_existing(&user_id, SessionCommand::CancelRoute { reply: tx }).await
                {
                    emit_error(&s, &e);
                    return;
                }
                let cancelled = rx.await.unwrap_or(false);
                let _ = s.emit("route-cancelled", &json!({ "userId": user_id, "cancelled": cancelled }));
            }
        });
    }

    // ── pause-route / resume-route ────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("pause-route", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if let Some(user_id) = data["userId"].as_str() {
                    if let Err(e) =
                        state.registry.send_existing(user_id, SessionCommand::PauseRoute).await
                    {
                        emit_error(&s, &e);
                    }
                }
            }
        });
    }
    {
        let state = state.clone();
        socket.on("resume-route", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if let Some(user_id) = data["userId"].as_str() {
                    if let Err(e) =
                        state.registry.send_existing(user_id, SessionCommand::ResumeRoute).await
                    {
                        emit_error(&s, &e);
                    }
                }
            }
        });
    }

    // ── get-active-route ──────────────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("get-active-route", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                let Some(user_id) = data["userId"].as_str().map(str::to_string) else {
                    emit_error(&s, &CoreError::InvalidInput("userId required".into()));
                    return;
                };
                let (tx, rx) = oneshot::channel();
                if let Err(e) =
                    state.registry.send_existing(&user_id, SessionCommand::ActiveRoute { reply: tx }).await
                {
                    emit_error(&s, &e);
                    return;
                }
                let route = rx.await.ok().flatten();
                let _ = s.emit("active-route", &json!({ "userId": user_id, "route": route }));
            }
        });
    }

    // ── subscribe / unsubscribe ───────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("subscribe", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                // No user: the facility-wide broadcast channel (graph/zone
                // changes), fed by the global forwarder via the room.
                let Some(user_id) = data["userId"].as_str().map(str::to_string) else {
                    let _ = s.join("facility");
                    let _ = s.emit("subscribed", &json!({ "channel": "facility" }));
                    return;
                };
                let topics = parse_topics(&data["topics"]);

                let queue_len = state.registry.engines().config.session.subscriber_queue_len;
                let (tx, mut rx) = mpsc::channel::<EventFrame>(queue_len);
                let (id_tx, id_rx) = oneshot::channel();
                let cmd = SessionCommand::Subscribe { topics, tx, reply: id_tx };
                if let Err(e) = state.registry.send(&user_id, cmd).await {
                    emit_error(&s, &e);
                    return;
                }
                let Ok(subscription_id) = id_rx.await else {
                    emit_error(&s, &CoreError::internal("subscribe reply dropped"));
                    return;
                };

                state
                    .subscriptions
                    .write()
                    .await
                    .entry(s.id.to_string())
                    .or_default()
                    .push((user_id.clone(), subscription_id.clone()));

                // Forwarder: session actor queue → socket. Ends when the
                // actor drops the sender (unsubscribe or session teardown).
                let forward_socket = s.clone();
                tokio::spawn(async move {
                    while let Some(frame) = rx.recv().await {
                        if forward_socket.emit("event", &frame).is_err() {
                            break;
                        }
                    }
                });

                let _ = s.emit(
                    "subscribed",
                    &json!({ "userId": user_id, "subscriptionId": subscription_id }),
                );
            }
        });
    }
    {
        let state = state.clone();
        socket.on("unsubscribe", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                let user_id = data["userId"].as_str().unwrap_or_default().to_string();
                let subscription_id = data["subscriptionId"].as_str().unwrap_or_default().to_string();
                if user_id.is_empty() || subscription_id.is_empty() {
                    emit_error(&s, &CoreError::InvalidInput("userId and subscriptionId required".into()));
                    return;
                }
                if let Some(list) = state.subscriptions.write().await.get_mut(&s.id.to_string()) {
                    list.retain(|(_, sid)| sid != &subscription_id);
                }
                let _ = state
                    .registry
                    .send_existing(&user_id, SessionCommand::Unsubscribe { subscription_id })
                    .await;
            }
        });
    }

    // ── logout ────────────────────────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("logout", move |_s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if let Some(user_id) = data["userId"].as_str() {
                    state.registry.remove(user_id).await;
                }
            }
        });
    }

    // ── operations: asset-status ──────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("asset-status", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                let sid = s.id.to_string();
                let is_ops = state.auth.has_role(&sid, "operations").await
                    || state.auth.has_role(&sid, "admin").await;
                if !is_ops {
                    emit_error(&s, &CoreError::Unauthorized);
                    return;
                }
                let update: AssetStatusUpdate = match serde_json::from_value(data) {
                    Ok(u) => u,
                    Err(e) => {
                        emit_error(&s, &CoreError::InvalidInput(format!("bad asset status: {e}")));
                        return;
                    }
                };
                let version = state.registry.engines().broker.apply_asset_status(&update);
                let _ = s.emit("asset-status-applied", &json!({ "graphVersion": version }));
            }
        });
    }

    // ── operations: crowd-density ─────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("crowd-density", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                let sid = s.id.to_string();
                let is_ops = state.auth.has_role(&sid, "operations").await
                    || state.auth.has_role(&sid, "admin").await;
                if !is_ops {
                    emit_error(&s, &CoreError::Unauthorized);
                    return;
                }
                let update: CrowdDensityUpdate = match serde_json::from_value(data) {
                    Ok(u) => u,
                    Err(e) => {
                        emit_error(&s, &CoreError::InvalidInput(format!("bad density update: {e}")));
                        return;
                    }
                };
                state.registry.engines().broker.apply_crowd_density(&update);
            }
        });
    }

    // ── admin: zone CRUD ──────────────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("zone-create", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if !require_role(&s, &state, "admin").await {
                    return;
                }
                let zone: HazardZone = match serde_json::from_value(data["zone"].clone()) {
                    Ok(z) => z,
                    Err(e) => {
                        emit_error(&s, &CoreError::InvalidInput(format!("bad zone: {e}")));
                        return;
                    }
                };
                let zone_id = zone.id.clone();
                match state.registry.engines().geofence.create_zone(zone, now_ms()).await {
                    Ok(()) => {
                        let _ = s.emit("zone-created", &json!({ "zoneId": zone_id }));
                    }
                    Err(e) => emit_error(&s, &e),
                }
            }
        });
    }
    {
        let state = state.clone();
        socket.on("zone-update", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if !require_role(&s, &state, "admin").await {
                    return;
                }
                let zone: HazardZone = match serde_json::from_value(data["zone"].clone()) {
                    Ok(z) => z,
                    Err(e) => {
                        emit_error(&s, &CoreError::InvalidInput(format!("bad zone: {e}")));
                        return;
                    }
                };
                let zone_id = zone.id.clone();
                match state.registry.engines().geofence.update_zone(zone, now_ms()).await {
                    Ok(()) => {
                        let _ = s.emit("zone-updated", &json!({ "zoneId": zone_id }));
                    }
                    Err(e) => emit_error(&s, &e),
                }
            }
        });
    }
    {
        let state = state.clone();
        socket.on("zone-delete", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if !require_role(&s, &state, "admin").await {
                    return;
                }
                let Some(zone_id) = data["zoneId"].as_str() else {
                    emit_error(&s, &CoreError::InvalidInput("zoneId required".into()));
                    return;
                };
                match state.registry.engines().geofence.delete_zone(zone_id, now_ms()).await {
                    Ok(()) => {
                        let _ = s.emit("zone-deleted", &json!({ "zoneId": zone_id }));
                    }
                    Err(e) => emit_error(&s, &e),
                }
            }
        });
    }
    {
        let state = state.clone();
        socket.on("zone-activate", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if !require_role(&s, &state, "admin").await {
                    return;
                }
                let Some(zone_id) = data["zoneId"].as_str() else {
                    emit_error(&s, &CoreError::InvalidInput("zoneId required".into()));
                    return;
                };
                let status: ZoneStatus = serde_json::from_value(data["status"].clone())
                    .unwrap_or(ZoneStatus::Active);
                match state
                    .registry
                    .engines()
                    .geofence
                    .set_zone_status(zone_id, status, now_ms())
                    .await
                {
                    Ok(()) => {
                        let _ = s.emit("zone-activated", &json!({ "zoneId": zone_id, "status": status }));
                    }
                    Err(e) => emit_error(&s, &e),
                }
            }
        });
    }

    // ── admin: facility reload ────────────────────────────────────────────────
    {
        let state = state.clone();
        socket.on("facility-reload", move |s: SocketRef| {
            let state = state.clone();
            async move {
                if !require_role(&s, &state, "admin").await {
                    return;
                }
                let engines = state.registry.engines();
                let map = match load_facility_map(&state.facility_path).await {
                    Ok(m) => m,
                    Err(e) => {
                        emit_error(&s, &e);
                        return;
                    }
                };
                if let Err(e) = engines.handoff.replace_zones(map.transition_zones.clone()) {
                    emit_error(&s, &e);
                    return;
                }
                match engines.graph.reload(map.nodes.clone(), map.edges.clone(), &engines.config.graph) {
                    Ok(version) => {
                        info!("facility reloaded by {}", s.id);
                        let _ = s.emit("facility-reloaded", &json!({ "graphVersion": version }));
                    }
                    Err(e) => emit_error(&s, &e),
                }
            }
        });
    }

    // ── admin: transition-zone re-calibration ─────────────────────────────────
    {
        let state = state.clone();
        socket.on("zone-recalibrate", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if !require_role(&s, &state, "admin").await {
                    return;
                }
                let Some(zone_id) = data["zoneId"].as_str() else {
                    emit_error(&s, &CoreError::InvalidInput("zoneId required".into()));
                    return;
                };
                let pairs: Vec<(wayfind_types::GeoPoint, LocalPoint)> =
                    match serde_json::from_value(data["pairs"].clone()) {
                        Ok(p) => p,
                        Err(e) => {
                            emit_error(&s, &CoreError::InvalidInput(format!("bad pairs: {e}")));
                            return;
                        }
                    };
                let accuracies: Vec<f64> = serde_json::from_value(data["accuracies"].clone())
                    .unwrap_or_else(|_| vec![1.0; pairs.len()]);
                match state
                    .registry
                    .engines()
                    .handoff
                    .recalibrate(zone_id, &pairs, &accuracies, now_ms())
                {
                    Ok(cal) => {
                        let _ = s.emit("zone-recalibrated", &json!({ "zoneId": zone_id, "calibration": cal }));
                    }
                    Err(e) => emit_error(&s, &e),
                }
            }
        });
    }

    // ── admin: optimization default override ──────────────────────────────────
    {
        let state = state.clone();
        socket.on("set-defaults", move |s: SocketRef, Data::<Value>(data)| {
            let state = state.clone();
            async move {
                if !require_role(&s, &state, "admin").await {
                    return;
                }
                let spec: OptimizationSpec = match serde_json::from_value(data["optimization"].clone()) {
                    Ok(spec) => spec,
                    Err(e) => {
                        emit_error(&s, &CoreError::InvalidInput(format!("bad optimization: {e}")));
                        return;
                    }
                };
                *state.default_optimization.write().await = spec;
                info!("optimization defaults overridden by {}", s.id);
                let _ = s.emit("defaults-set", &json!({ "optimization": spec }));
            }
        });
    }
}
