use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use gatehouse_core::config::GatewayConfig;
use gatehouse_engine::FlowEngine;

use crate::routes;
use crate::state::AppState;

/// HTTP + SSE gateway over a [`FlowEngine`].
pub struct GatewayServer {
    config: GatewayConfig,
    engine: FlowEngine,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, engine: FlowEngine) -> Self {
        Self { config, engine }
    }

    /// The full route table.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            engine: self.engine.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            // Flow definitions
            .route("/api/flows", post(routes::register_flow).get(routes::list_flows))
            .route("/api/flows/{id}", get(routes::get_flow))
            // Instances
            .route("/api/instances", post(routes::create_instance))
            .route(
                "/api/instances/{id}",
                get(routes::get_instance).delete(routes::delete_instance),
            )
            .route("/api/instances/{id}/history", get(routes::instance_history))
            .route("/api/instances/{id}/messages", post(routes::send_message))
            .route("/api/instances/{id}/resume", post(routes::resume))
            .route("/api/instances/{id}/cancel", post(routes::cancel))
            // Tool confirmation
            .route("/api/instances/{id}/pending", get(routes::pending))
            .route(
                "/api/instances/{id}/tools/{execution_id}/confirm",
                post(routes::confirm_tool),
            )
            .route(
                "/api/instances/{id}/tools/{execution_id}/deny",
                post(routes::deny_tool),
            )
            .route(
                "/api/instances/{id}/tool-settings",
                get(routes::get_tool_settings).put(routes::put_tool_settings),
            )
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }
}
