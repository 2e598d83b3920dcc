//! # wayfind-types
//!
//! Shared domain and wire types for the Wayfind indoor positioning core.
//!
//! These types are used by:
//! - `backend-rust`: the fusion / routing / geofence engines and their
//!   Socket.IO + UDP surfaces
//! - `sensor-simulator`: synthetic pedestrian walks feeding the ingest hub
//!
//! ## Coordinate Conventions
//!
//! - **Local frame**: right-handed ENU Cartesian, meters. +x east, +y north,
//!   +z up. Floor is a signed integer, ground = 0.
//! - **Geodetic frame**: WGS-84. Latitude/longitude in degrees, altitude in
//!   meters above the ellipsoid.
//! - A position is tagged with exactly one frame. Cross-frame comparison goes
//!   through the handoff engine's transition-zone transform.
//!
//! ## Time
//!
//! Wire timestamps are Unix milliseconds UTC. Internal computation uses
//! nanoseconds; the `ms_to_ns`/`ns_to_ms` helpers convert at the boundary.

pub mod coords;
pub mod events;
pub mod graph;
pub mod pose;
pub mod route;
pub mod zones;

pub use coords::{FrameKind, GeoPoint, LocalPoint, Position, PositionFix};
pub use events::{
    ErrorBody, EventFrame, HelloFrame, HazardAlertEvent, ProximityKind, RouteEvent,
    RouteEventKind, Topic, TransitionEvent, PROTOCOL_VERSION,
};
pub use graph::{AccessFlags, EdgeStatus, NavEdge, NavNode, NodeKind, TraversalMode};
pub use pose::{BeaconReading, FusedPose, SensorSample, SensorSource, SourceWeights};
pub use route::{
    ComputeMeta, Instruction, InstructionKind, OptimizationSpec, OptimizeCriterion,
    OptimizeWeights, Route, RouteConstraints, RouteMetrics,
};
pub use zones::{
    AccessLevel, DateException, DayWindow, FloorPolygon, HazardKind, HazardZone, RestrictedArea,
    Severity, TransitionKind, TransitionZone, WeeklySchedule, ZoneCalibration, ZoneGeometry,
    ZoneStatus,
};

/// Wire milliseconds → internal nanoseconds.
pub fn ms_to_ns(ms: i64) -> i64 {
    ms.saturating_mul(1_000_000)
}

/// Internal nanoseconds → wire milliseconds.
pub fn ns_to_ms(ns: i64) -> i64 {
    ns / 1_000_000
}
