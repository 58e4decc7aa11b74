use anyhow::{Context, Result};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use super::job_routes::make_job_routes;
use super::metrics::metrics_handler;
use super::{log_requests, state::*, ServerConfig};
use crate::dispatch::DispatchManager;

#[derive(Serialize)]
struct ServerStats {
    pub uptime: String,
    pub hash: String,
}

fn format_uptime(duration: Duration) -> String {
    let total_seconds = duration.as_secs();

    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    format!("{}d {:02}:{:02}:{:02}", days, hours, minutes, seconds)
}

async fn home(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = ServerStats {
        uptime: format_uptime(state.start_time.elapsed()),
        hash: state.hash.clone(),
    };
    Json(stats)
}

async fn route_not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Route Not Found" })),
    )
}

impl ServerState {
    fn new(config: ServerConfig, manager: Arc<DispatchManager>) -> ServerState {
        ServerState {
            config,
            start_time: Instant::now(),
            manager,
            hash: env!("GIT_HASH").to_string(),
        }
    }
}

pub fn make_app(config: ServerConfig, manager: Arc<DispatchManager>) -> Router {
    let state = ServerState::new(config, manager);

    let home_router: Router = Router::new()
        .route("/", get(home))
        .with_state(state.clone());

    home_router
        .merge(make_job_routes(state.clone()))
        .fallback(route_not_found)
        .layer(middleware::from_fn_with_state(state, log_requests))
}

pub fn make_metrics_app() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

pub async fn run_server(config: ServerConfig, manager: Arc<DispatchManager>) -> Result<()> {
    let port = config.port;
    let metrics_port = config.metrics_port;
    let app = make_app(config, manager);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    let metrics_listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", metrics_port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", metrics_port))?;

    info!("Ready to serve at port {}!", port);
    info!("Metrics available at port {}!", metrics_port);

    tokio::try_join!(
        async { axum::serve(listener, app).await },
        async { axum::serve(metrics_listener, make_metrics_app()).await },
    )?;
    Ok(())
}
