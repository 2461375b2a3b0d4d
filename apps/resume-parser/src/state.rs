use std::sync::Arc;

use crate::registry::ProcessingRegistry;
use crate::resilience::CircuitBreakers;

/// Shared state injected into the health handlers via Axum extractors.
/// Holds the same registry and breakers the pipeline works with.
#[derive(Clone)]
pub struct AppState {
    pub registry: ProcessingRegistry,
    pub breakers: Arc<CircuitBreakers>,
}
