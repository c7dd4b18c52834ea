//! HTTP API
//!
//! Thin axum layer over the router, health monitor and backup manager.
//! The ask endpoint never returns an error status: degraded answers ride
//! the same 200 envelope with a different `source`.

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::backup::BackupManager;
use crate::error::Result;
use crate::health::{CheckStatus, HealthMonitor};
use crate::router::{AiRouter, RequestContext};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<AiRouter>,
    pub health: Arc<HealthMonitor>,
    pub backups: Arc<Mutex<BackupManager>>,
}

#[derive(Debug, Deserialize)]
struct AskBody {
    prompt: String,
    #[serde(flatten)]
    ctx: RequestContext,
}

#[derive(Debug, Deserialize)]
struct ClearBody {
    pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackupBody {
    kind: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/ask", post(ask))
        .route("/api/status", get(status))
        .route("/api/cache/clear", post(clear_cache))
        .route("/api/health", get(health))
        .route("/api/backup", post(backup))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, bind_addr: &str) -> Result<()> {
    let app = app(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn ask(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<AskBody>,
) -> Response {
    let mut ctx = body.ctx;
    if ctx.client_ip.is_none() {
        ctx.client_ip = Some(addr.ip().to_string());
    }
    let answer = state.router.ask(&body.prompt, &ctx).await;
    Json(answer).into_response()
}

async fn status(State(state): State<AppState>) -> Response {
    Json(state.router.status().await).into_response()
}

async fn clear_cache(
    State(state): State<AppState>,
    Json(body): Json<ClearBody>,
) -> Response {
    let pattern = body.pattern.as_deref().unwrap_or("*");
    let cleared = state.router.clear_cache(pattern).await;
    Json(json!({ "cleared": cleared })).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.run_checks().await;
    let code = match report.overall {
        CheckStatus::Healthy | CheckStatus::Warning => StatusCode::OK,
        CheckStatus::Critical => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report)).into_response()
}

async fn backup(
    State(state): State<AppState>,
    Json(body): Json<BackupBody>,
) -> Response {
    let backups = Arc::clone(&state.backups);
    let kind = body.kind.unwrap_or_else(|| "auto".to_string());

    // SQL dumps and zip writes are blocking work.
    let result = tokio::task::spawn_blocking(move || {
        let manager = backups.lock();
        match kind.as_str() {
            "full" => manager.create_full().map(|path| json!({ "path": path })),
            "incremental" => manager
                .create_incremental()
                .map(|path| json!({ "path": path })),
            _ => manager
                .run_scheduled()
                .and_then(|outcome| Ok(serde_json::to_value(outcome)?)),
        }
    })
    .await;

    match result {
        Ok(Ok(payload)) => Json(payload).into_response(),
        Ok(Err(e)) => {
            error!("Backup failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
        Err(e) => {
            error!("Backup task panicked: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "backup task failed" })),
            )
                .into_response()
        }
    }
}
