//! # error
//!
//! The single error surface of the core. Every failure that crosses a
//! component boundary is one of these kinds, mapped to a stable string code
//! on the wire. Sensor-level rejections never become `CoreError`s; they are
//! counted inside the fusion engine and recovered locally.

use thiserror::Error;
use wayfind_types::ErrorBody;

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("sensor below acceptance threshold: {0}")]
    LowConfidence(String),

    #[error("no navigation nodes within {radius_m} m of the requested position")]
    NoNodesNearPosition { radius_m: f64 },

    #[error("no route found from {from} to {to}")]
    NoRouteFound { from: String, to: String },

    #[error("route computation exceeded {budget_ms} ms")]
    RouteTimeout { budget_ms: u64 },

    #[error("route computation cancelled after {nodes_expanded} expansions")]
    RouteCancelled { nodes_expanded: u64 },

    #[error("zone not found: {0}")]
    ZoneNotFound(String),

    #[error("zone conflict: {0}")]
    ZoneConflict(String),

    #[error("pose tracking lost for user {0}")]
    PoseLost(String),

    #[error("unauthorized")]
    Unauthorized,

    /// Bugs. Logged with a correlation ID, returned opaque.
    #[error("internal error [{correlation_id}]")]
    Internal { correlation_id: String },
}

impl CoreError {
    pub fn internal(context: &str) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!("internal error [{correlation_id}]: {context}");
        CoreError::Internal { correlation_id }
    }

    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::LowConfidence(_) => "low_confidence",
            CoreError::NoNodesNearPosition { .. } => "no_nodes_near_position",
            CoreError::NoRouteFound { .. } => "no_route_found",
            CoreError::RouteTimeout { .. } => "route_timeout",
            CoreError::RouteCancelled { .. } => "route_cancelled",
            CoreError::ZoneNotFound(_) => "zone_not_found",
            CoreError::ZoneConflict(_) => "zone_conflict",
            CoreError::PoseLost(_) => "pose_lost",
            CoreError::Unauthorized => "unauthorized",
            CoreError::Internal { .. } => "internal",
        }
    }

    /// Whether the caller may retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::RouteTimeout { .. }
                | CoreError::RouteCancelled { .. }
                | CoreError::PoseLost(_)
                | CoreError::LowConfidence(_)
        )
    }

    /// Backoff hint for transient cases, milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            CoreError::RouteTimeout { .. } => Some(2_000),
            CoreError::RouteCancelled { .. } => Some(500),
            CoreError::PoseLost(_) | CoreError::LowConfidence(_) => Some(1_000),
            _ => None,
        }
    }

    /// Wire body. `internal` errors stay opaque: only the correlation ID
    /// crosses the boundary.
    pub fn to_body(&self) -> ErrorBody {
        let message = match self {
            CoreError::Internal { correlation_id } => {
                format!("internal error, correlation ID {correlation_id}")
            }
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code().to_string(),
            message,
            retryable: self.retryable(),
            retry_after_ms: self.retry_after_ms(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::Unauthorized.code(), "unauthorized");
        assert_eq!(
            CoreError::NoNodesNearPosition { radius_m: 500.0 }.code(),
            "no_nodes_near_position"
        );
        assert_eq!(CoreError::RouteTimeout { budget_ms: 5000 }.code(), "route_timeout");
    }

    #[test]
    fn timeout_is_retryable_with_hint() {
        let e = CoreError::RouteTimeout { budget_ms: 5000 };
        let body = e.to_body();
        assert!(body.retryable);
        assert_eq!(body.retry_after_ms, Some(2_000));
    }

    #[test]
    fn internal_is_opaque() {
        let e = CoreError::internal("db exploded");
        let body = e.to_body();
        assert_eq!(body.code, "internal");
        assert!(!body.message.contains("exploded"));
    }
}
