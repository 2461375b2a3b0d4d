use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tracing::warn;

use crate::resilience::circuit_breaker::CircuitState;
use crate::state::AppState;

/// GET /health
/// Returns a simple status object with service version.
pub async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": env!("CARGO_PKG_NAME")
    }))
}

/// GET /health/ready
/// Reports in-flight résumés and breaker states. `degraded` while any
/// breaker is open; 503 when the registry can not be read.
pub async fn readiness_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let breakers = state.breakers.snapshots();
    let degraded = breakers.iter().any(|b| b.state == CircuitState::Open);

    match state.registry.in_flight().await {
        Ok(in_flight) => (
            StatusCode::OK,
            Json(json!({
                "status": if degraded { "degraded" } else { "ok" },
                "inFlight": in_flight,
                "circuitBreakers": breakers,
            })),
        ),
        Err(e) => {
            warn!("Readiness check could not read the registry: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "error": e.to_string(),
                    "circuitBreakers": breakers,
                })),
            )
        }
    }
}
