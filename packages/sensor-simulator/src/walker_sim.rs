//! walker_sim.rs — Pedestrian kinematics
//!
//! Simulates N walkers following waypoint paths through the facility at a
//! configurable pace, with per-step heading jitter and dwell pauses so the
//! fusion engine sees human-looking motion rather than straight rails.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use wayfind_types::LocalPoint;

#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Nominal walking speed, m/s.
    pub speed_mps: f64,
    /// 1-σ lateral jitter applied per step, meters.
    pub jitter_m: f64,
    /// Probability per step of a short dwell (checking a phone, a window).
    pub dwell_probability: f64,
    /// Dwell length in steps.
    pub dwell_steps: u32,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self { speed_mps: 1.3, jitter_m: 0.15, dwell_probability: 0.01, dwell_steps: 12 }
    }
}

#[derive(Debug)]
pub struct Walker {
    pub user_id: String,
    pub position: LocalPoint,
    waypoints: Vec<LocalPoint>,
    next_waypoint: usize,
    dwell_remaining: u32,
    /// Loops back to the first waypoint when the path ends.
    pub looping: bool,
}

impl Walker {
    pub fn new(user_id: String, waypoints: Vec<LocalPoint>, looping: bool) -> Self {
        let position = waypoints.first().copied().unwrap_or_default();
        Self { user_id, position, waypoints, next_waypoint: 1, dwell_remaining: 0, looping }
    }

    pub fn done(&self) -> bool {
        !self.looping && self.next_waypoint >= self.waypoints.len()
    }

    /// Advance one step of `dt` seconds toward the next waypoint.
    pub fn step(&mut self, dt: f64, config: &WalkerConfig, rng: &mut impl Rng) {
        if self.done() {
            return;
        }
        if self.dwell_remaining > 0 {
            self.dwell_remaining -= 1;
            return;
        }
        if rng.gen_bool(config.dwell_probability) {
            self.dwell_remaining = config.dwell_steps;
            return;
        }

        let target = match self.waypoints.get(self.next_waypoint) {
            Some(t) => *t,
            None => return,
        };
        let dx = target.x - self.position.x;
        let dy = target.y - self.position.y;
        let dist = (dx * dx + dy * dy).sqrt();
        let step_len = config.speed_mps * dt;

        if dist <= step_len {
            self.position = target;
            self.next_waypoint += 1;
            if self.next_waypoint >= self.waypoints.len() && self.looping {
                self.next_waypoint = 0;
            }
            return;
        }

        let jitter = Normal::new(0.0, config.jitter_m).expect("valid sigma");
        self.position.x += dx / dist * step_len + jitter.sample(rng);
        self.position.y += dy / dist * step_len + jitter.sample(rng);
        self.position.floor = target.floor;
    }
}

#[derive(Debug)]
pub struct WalkerSim {
    pub walkers: Vec<Walker>,
    pub config: WalkerConfig,
}

impl WalkerSim {
    pub fn new(walkers: Vec<Walker>, config: WalkerConfig) -> Self {
        Self { walkers, config }
    }

    pub fn step(&mut self, dt: f64, rng: &mut impl Rng) {
        for walker in &mut self.walkers {
            walker.step(dt, &self.config, rng);
        }
    }

    pub fn all_done(&self) -> bool {
        self.walkers.iter().all(Walker::done)
    }
}
