//! scenarios.rs — Preset worlds for exercising specific hub behaviors
//!
//! Each scenario fixes the beacon survey, doorway placement, walker paths,
//! and per-walker sensor overrides. The hub under test decides what the
//! events mean; the simulator only produces honest sensor physics for the
//! chosen situation.

use wayfind_types::{GeoPoint, LocalPoint};

use crate::sensor_models::{SensorOverrides, SimBeacon, SimDoorway};
use crate::walker_sim::Walker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioKind {
    /// Concourse loop walks, clean sensors.
    Concourse,
    /// Walkers cross the main doorway: SLAM degrades, GPS sharpens.
    DoorwayCrossing,
    /// One walker drifts steadily away from the corridor spine.
    CorridorDrift,
}

impl ScenarioKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "concourse" => Some(Self::Concourse),
            "doorway" => Some(Self::DoorwayCrossing),
            "drift" => Some(Self::CorridorDrift),
            _ => None,
        }
    }
}

pub struct Scenario {
    pub kind: ScenarioKind,
    pub beacons: Vec<SimBeacon>,
    pub doorways: Vec<SimDoorway>,
    pub walkers: Vec<Walker>,
}

impl Scenario {
    pub fn build(kind: ScenarioKind, users: usize) -> Self {
        match kind {
            ScenarioKind::Concourse => concourse(users),
            ScenarioKind::DoorwayCrossing => doorway_crossing(users),
            ScenarioKind::CorridorDrift => corridor_drift(users),
        }
    }

    /// Scenario-driven sensor overrides for one walker at its current spot.
    pub fn overrides_for(&self, walker: &Walker) -> SensorOverrides {
        match self.kind {
            ScenarioKind::Concourse => SensorOverrides::default(),
            ScenarioKind::DoorwayCrossing => {
                // SLAM visually degrades in the glass doorway area
                let near_door = self
                    .doorways
                    .iter()
                    .any(|d| d.position.horizontal_distance(&walker.position) <= d.radius_m);
                if near_door {
                    SensorOverrides {
                        slam_confidence: Some(0.2),
                        force_gps: true,
                        suppress_slam: false,
                    }
                } else {
                    SensorOverrides::default()
                }
            }
            ScenarioKind::CorridorDrift => SensorOverrides::default(),
        }
    }
}

fn beacon_grid(width: f64, height: f64, spacing: f64) -> Vec<SimBeacon> {
    let mut beacons = Vec::new();
    let mut idx = 0;
    let mut y = 0.0;
    while y <= height {
        let mut x = 0.0;
        while x <= width {
            beacons.push(SimBeacon {
                id: format!("bcn-{idx:03}"),
                position: LocalPoint::new(x, y, 2.8, 0),
            });
            idx += 1;
            x += spacing;
        }
        y += spacing;
    }
    beacons
}

fn main_doorway() -> SimDoorway {
    SimDoorway {
        position: LocalPoint::new(120.0, 0.0, 0.0, 0),
        geo: GeoPoint { lat: 47.4513, lon: 19.0635, alt: 121.0 },
        radius_m: 15.0,
    }
}

fn concourse(users: usize) -> Scenario {
    let loop_path = vec![
        LocalPoint::new(10.0, 10.0, 0.0, 0),
        LocalPoint::new(90.0, 10.0, 0.0, 0),
        LocalPoint::new(90.0, 40.0, 0.0, 0),
        LocalPoint::new(10.0, 40.0, 0.0, 0),
    ];
    let walkers = (0..users)
        .map(|i| {
            let mut path = loop_path.clone();
            let len = path.len();
            path.rotate_left(i % len);
            Walker::new(format!("sim-user-{i:02}"), path, true)
        })
        .collect();
    Scenario {
        kind: ScenarioKind::Concourse,
        beacons: beacon_grid(100.0, 50.0, 20.0),
        doorways: vec![main_doorway()],
        walkers,
    }
}

fn doorway_crossing(users: usize) -> Scenario {
    let walkers = (0..users)
        .map(|i| {
            Walker::new(
                format!("sim-user-{i:02}"),
                vec![
                    LocalPoint::new(60.0, 5.0 * i as f64, 0.0, 0),
                    LocalPoint::new(115.0, 2.0, 0.0, 0),
                    LocalPoint::new(135.0, 0.0, 0.0, 0), // through the door, outside
                ],
                false,
            )
        })
        .collect();
    Scenario {
        kind: ScenarioKind::DoorwayCrossing,
        beacons: beacon_grid(120.0, 30.0, 20.0),
        doorways: vec![main_doorway()],
        walkers,
    }
}

fn corridor_drift(users: usize) -> Scenario {
    let walkers = (0..users)
        .map(|i| {
            Walker::new(
                format!("sim-user-{i:02}"),
                vec![
                    LocalPoint::new(0.0, 0.0, 0.0, 0),
                    LocalPoint::new(30.0, 0.0, 0.0, 0),
                    // veers off the corridor spine and keeps going
                    LocalPoint::new(45.0, 25.0, 0.0, 0),
                    LocalPoint::new(50.0, 45.0, 0.0, 0),
                ],
                false,
            )
        })
        .collect();
    Scenario {
        kind: ScenarioKind::CorridorDrift,
        beacons: beacon_grid(60.0, 50.0, 20.0),
        doorways: vec![main_doorway()],
        walkers,
    }
}
