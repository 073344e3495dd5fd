//! HTTP surface: the GitHub webhook inbox and the public app listing.
//!
//! Webhook handling deliberately does not swallow errors — a 5xx tells
//! GitHub to redeliver, which is how a failed delivery eventually reconciles.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use crate::app::AppModel;
use crate::config::Config;
use crate::errors::StoreError;
use crate::github::WebhookPayload;
use crate::orchestrator::Orchestrator;
use crate::store::DbHandle;

pub struct AppState {
    pub db: DbHandle,
    pub orchestrator: Arc<Orchestrator>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<StoreError>() {
            Some(store_err) if store_err.is_not_found() => Self::NotFound(store_err.to_string()),
            _ => Self::Internal(format!("{:#}", err)),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/webhooks/github", post(github_webhook))
        .route("/api/public/apps", get(list_apps))
        .with_state(state)
}

async fn github_webhook(
    State(state): State<SharedState>,
    Json(payload): Json<WebhookPayload>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.handle_webhook(payload).await?;
    Ok(StatusCode::OK)
}

async fn list_apps(State(state): State<SharedState>) -> Result<Json<Vec<AppModel>>, ApiError> {
    let apps = state.db.call(|store| store.find_all()).await?;
    Ok(Json(apps))
}

// ── Startup ───────────────────────────────────────────────────────────

pub async fn start_server(config: &Config, state: SharedState) -> Result<()> {
    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!(addr = %listener.local_addr()?, "factory backend listening");

    axum::serve(listener, app).await.context("server error")
}
