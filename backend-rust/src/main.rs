use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use socketioxide::SocketIo;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use wayfind_backend::auth::AuthEngine;
use wayfind_backend::broker::FacilityBroker;
use wayfind_backend::config::CoreConfig;
use wayfind_backend::error::CoreError;
use wayfind_backend::facility::load_facility_map;
use wayfind_backend::geofence::GeofenceEngine;
use wayfind_backend::graph::GraphStore;
use wayfind_backend::handlers::{on_connect, AppState};
use wayfind_backend::handoff::HandoffEngine;
use wayfind_backend::ingest::{start_ingest_hub, IngestHubConfig};
use wayfind_backend::router::{HazardScore, RoutePlanner};
use wayfind_backend::scheduler::Scheduler;
use wayfind_backend::session::{Engines, SessionRegistry};
use wayfind_backend::zone_wal::ZoneWal;

// ─── Exit codes ───────────────────────────────────────────────────────────────

const EXIT_BAD_FACILITY_MAP: i32 = 64;
const EXIT_BIND_FAILURE: i32 = 65;
const EXIT_INTERNAL: i32 = 70;

// ─── Global startup time (for uptime reporting) ──────────────────────────────

static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

fn wall_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

// ─── Time sync endpoint ───────────────────────────────────────────────────────

async fn time_sync() -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "serverTime": wall_ms() }))
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    STARTUP_MS.store(wall_ms(), Ordering::Relaxed);

    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wayfind_backend=info,socketioxide=warn".into()),
        )
        .init();

    info!("Wayfind core v{} starting", env!("CARGO_PKG_VERSION"));

    let config = CoreConfig::default();

    // Facility map (read-only external store). A bad map is fatal.
    let facility_path = PathBuf::from(
        std::env::var("WAYFIND_FACILITY_MAP").unwrap_or_else(|_| "facility.json".to_string()),
    );
    let map = match load_facility_map(&facility_path).await {
        Ok(m) => m,
        Err(e) => {
            error!("facility map rejected: {e}");
            std::process::exit(EXIT_BAD_FACILITY_MAP);
        }
    };

    let graph = match GraphStore::new(&config.graph, map.nodes.clone(), map.edges.clone()) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!("navigation graph rejected: {e}");
            std::process::exit(EXIT_BAD_FACILITY_MAP);
        }
    };

    let handoff = match HandoffEngine::new(
        config.handoff.clone(),
        map.origin,
        map.transition_zones.clone(),
    ) {
        Ok(h) => Arc::new(h),
        Err(e) => {
            error!("transition zones rejected: {e}");
            std::process::exit(EXIT_BAD_FACILITY_MAP);
        }
    };

    let broker = Arc::new(FacilityBroker::new(graph.clone(), config.broker.clone()));
    let geofence = Arc::new(GeofenceEngine::new(config.geofence.clone(), graph.clone(), broker.clone()));

    // Runtime hazard zones survive restarts through the WAL.
    let wal_path =
        std::env::var("WAYFIND_ZONE_WAL").unwrap_or_else(|_| "zones.wal".to_string());
    let (wal, replayed) = match ZoneWal::open(&wal_path).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("zone WAL unusable: {e}");
            std::process::exit(EXIT_INTERNAL);
        }
    };
    geofence
        .bootstrap(
            map.hazard_zones.clone(),
            map.restricted_areas.clone(),
            Some(wal),
            replayed,
            wall_ms() as i64,
        )
        .await;

    let planner = Arc::new(RoutePlanner::new(
        graph.clone(),
        config.router.clone(),
        geofence.clone() as Arc<dyn HazardScore>,
    ));

    let engines = Arc::new(Engines {
        config: config.clone(),
        graph: graph.clone(),
        planner: planner.clone(),
        geofence: geofence.clone(),
        handoff: handoff.clone(),
        broker: broker.clone(),
        beacons: map.beacon_index(),
    });
    let registry = SessionRegistry::new(engines);
    let auth_engine = AuthEngine::new();

    // UDP ingest hub
    tokio::spawn(start_ingest_hub(IngestHubConfig::default(), registry.clone()));

    // Scheduling wheel: every periodic job lives here and dies on shutdown.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let planner = planner.clone();
        let geofence = geofence.clone();
        let broker = broker.clone();
        let registry_ticks = registry.clone();
        let registry_reaper = registry.clone();
        let wheel = Scheduler::new()
            .register("route-cache-prune", Duration::from_secs(30), move || {
                let planner = planner.clone();
                async move { planner.prune_cache() }
            })
            .register("zone-expiry-sweep", Duration::from_secs(10), move || {
                let geofence = geofence.clone();
                async move { geofence.sweep_expired(wall_ms() as i64).await }
            })
            .register("session-idle-reap", Duration::from_secs(30), move || {
                let registry = registry_reaper.clone();
                async move { registry.reap_idle(wall_ms() as i64).await }
            })
            .register("broker-reconcile", Duration::from_secs(5), move || {
                let broker = broker.clone();
                async move { broker.reconcile() }
            })
            .register("session-tick", Duration::from_millis(500), move || {
                let registry = registry_ticks.clone();
                async move { registry.tick_all(wall_ms() as i64).await }
            });
        tokio::spawn(wheel.run(shutdown_rx));
    }

    // Socket.IO layer
    let (socket_layer, io) = SocketIo::builder().build_layer();
    let app_state = AppState::new(registry.clone(), auth_engine.clone(), facility_path);
    io.ns("/", move |socket: socketioxide::extract::SocketRef| {
        let state = app_state.clone();
        async move {
            on_connect(socket, state).await;
        }
    });

    // Facility-wide broadcast channel: graph changes fan out to the room of
    // subscribers that asked for the broadcast stream rather than one user.
    {
        let io = io.clone();
        let mut changes = broker.subscribe_changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let frame = json!({
                            "topic": "facility_change",
                            "timestamp": wall_ms(),
                            "payload": {
                                "graphVersion": change.graph_version,
                                "reason": change.reason,
                                "changedEdges": change.changed_edges.len(),
                            },
                        });
                        let _ = io.to("facility").emit("event", &frame);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // CORS — local dev defaults; deployments set CORS_ORIGINS.
    let cors_origins_env = std::env::var("CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string());
    let cors = if cors_origins_env.trim() == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins_env
            .split(',')
            .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    // Health endpoint: cloud schedulers restart the instance on non-200.
    let health_registry = registry.clone();
    let health_graph = graph.clone();
    let app = Router::new()
        .route(
            "/health",
            get(move || {
                let registry = health_registry.clone();
                let graph = health_graph.clone();
                async move {
                    let startup = STARTUP_MS.load(Ordering::Relaxed);
                    let uptime_secs = if startup > 0 { (wall_ms() - startup) / 1000 } else { 0 };
                    axum::Json(json!({
                        "status": "ok",
                        "version": env!("CARGO_PKG_VERSION"),
                        "uptimeSecs": uptime_secs,
                        "graphVersion": graph.version(),
                        "activeSessions": registry.active_count().await,
                    }))
                }
            }),
        )
        .route("/sync", get(time_sync))
        .layer(socket_layer)
        .layer(cors);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3001".to_string());
    let addr = format!("0.0.0.0:{port}");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("could not bind {addr}: {e}");
            std::process::exit(EXIT_BIND_FAILURE);
        }
    };
    info!("listening on {addr}");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });

    if let Err(e) = serve.await {
        let err = CoreError::internal(&format!("server error: {e}"));
        error!("{err}");
        std::process::exit(EXIT_INTERNAL);
    }

    // Orderly teardown: stop the wheel, then the session actors.
    let _ = shutdown_tx.send(true);
    registry.shutdown_all().await;
    info!("wayfind core stopped");
}
