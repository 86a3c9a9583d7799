use gatehouse_core::config::GatewayConfig;
use gatehouse_engine::FlowEngine;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub engine: FlowEngine,
}
