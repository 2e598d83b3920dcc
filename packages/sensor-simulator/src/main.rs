//! main.rs — Sensor simulator entry point
//!
//! Runs one loop: advances walker kinematics at the configured rate,
//! synthesizes per-sensor sample batches (SLAM drift, BLE path loss, GPS
//! accuracy ramps), and streams them to the backend's ingest hub over UDP.
//!
//! Scenarios:
//!   concourse — looping concourse walks, clean sensors
//!   doorway   — doorway crossings (SLAM degrades, GPS sharpens)
//!   drift     — a walker leaves the corridor and keeps going

mod scenarios;
mod sensor_models;
mod udp_tx;
mod walker_sim;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::info;

use scenarios::{Scenario, ScenarioKind};
use sensor_models::{sample_batch, SensorNoiseConfig};
use udp_tx::UdpTransmitter;
use walker_sim::{WalkerConfig, WalkerSim};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "sensor-sim", about = "Wayfind synthetic sensor feed")]
struct Args {
    /// Ingest hub UDP address
    #[arg(long, default_value = "127.0.0.1:5544")]
    hub_addr: String,
    /// Number of simulated walkers
    #[arg(long, default_value = "4")]
    users: usize,
    /// Batches per second per walker
    #[arg(long, default_value = "5.0")]
    rate_hz: f64,
    /// Scenario: concourse | doorway | drift
    #[arg(long, default_value = "concourse")]
    scenario: String,
    /// Simulation speed multiplier (1.0 = real time)
    #[arg(long, default_value = "1.0")]
    speed: f64,
    /// Stop after this many epochs (0 = run forever)
    #[arg(long, default_value = "0")]
    epochs: u64,
}

fn now_ns() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensor_simulator=info".into()),
        )
        .init();

    let args = Args::parse();
    let Some(kind) = ScenarioKind::parse(&args.scenario) else {
        eprintln!("unknown scenario {:?} (expected concourse | doorway | drift)", args.scenario);
        std::process::exit(2);
    };

    let mut scenario = Scenario::build(kind, args.users);
    info!(
        "scenario {:?}: {} walkers, {} beacons, {} doorways -> {}",
        kind,
        scenario.walkers.len(),
        scenario.beacons.len(),
        scenario.doorways.len(),
        args.hub_addr
    );

    let mut tx = match UdpTransmitter::bind(args.hub_addr.clone()).await {
        Ok(tx) => tx,
        Err(e) => {
            eprintln!("could not open UDP socket: {e}");
            std::process::exit(1);
        }
    };

    let noise = SensorNoiseConfig::default();
    let walkers = std::mem::take(&mut scenario.walkers);
    let mut sim = WalkerSim::new(walkers, WalkerConfig::default());
    let mut rng = rand::thread_rng();

    let dt = 1.0 / args.rate_hz;
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(dt / args.speed.max(0.01)));
    let mut epoch: u64 = 0;

    loop {
        ticker.tick().await;
        epoch += 1;
        sim.step(dt, &mut rng);

        let timestamp_ns = now_ns();
        for walker in &sim.walkers {
            if walker.done() {
                continue;
            }
            let overrides = scenario.overrides_for(walker);
            let batch = sample_batch(
                &walker.position,
                timestamp_ns,
                &scenario.beacons,
                &scenario.doorways,
                &overrides,
                &noise,
                &mut rng,
            );
            tx.send_batch(&walker.user_id, &batch).await;
        }

        if epoch % 50 == 0 {
            info!("epoch {epoch}: {} packets sent, {} errors", tx.sent, tx.errors);
        }
        if args.epochs > 0 && epoch >= args.epochs {
            info!("done after {epoch} epochs ({} packets)", tx.sent);
            return;
        }
        if sim.all_done() {
            info!("all walkers finished ({} packets)", tx.sent);
            return;
        }
    }
}
