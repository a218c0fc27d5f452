use anyhow::Context;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::app::{App, Status};
use crate::error::ApiError;
use crate::state::ActivityResponse;
use crate::thresholds::Thresholds;

const INDEX_HTML: &str = include_str!("ui/index.html");

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: App) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/threshold", get(get_threshold).post(set_threshold))
        .route("/water", post(water))
        .route("/refill", post(refill))
        .route("/dashboard-data", get(dashboard_data))
        .route("/water-usage", get(water_usage))
        .with_state(app)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: Status,
    #[serde(flatten)]
    activity: ActivityResponse,
}

async fn api_status(State(app): State<App>) -> impl IntoResponse {
    Json(StatusResponse {
        status: app.current_status().await,
        activity: app.activity().await,
    })
}

async fn get_threshold(State(app): State<App>) -> Json<Thresholds> {
    Json(app.thresholds().await)
}

#[derive(Debug, Default, Deserialize)]
struct ThresholdRequest {
    dry_threshold: Option<i64>,
    wet_threshold: Option<i64>,
}

async fn set_threshold(
    State(app): State<App>,
    Json(req): Json<ThresholdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let thresholds = app
        .update_thresholds(req.dry_threshold, req.wet_threshold)
        .await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "dry_threshold": thresholds.dry(),
        "wet_threshold": thresholds.wet(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct WaterRequest {
    /// Seconds; fractions allowed.
    duration: Option<f64>,
}

/// Blocks for the whole run; the body is optional.
async fn water(
    State(app): State<App>,
    body: Option<Json<WaterRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let report = app.trigger_manual_water(req.duration).await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "message": format!("watered for {} seconds", report.duration_sec),
        "duration": report.duration_sec,
        "consumed_ml": report.consumed_ml,
        "level_ml": report.level_ml,
    })))
}

async fn refill(State(app): State<App>) -> Result<impl IntoResponse, ApiError> {
    let reservoir = app.refill().await?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "reservoir": reservoir,
    })))
}

async fn dashboard_data(State(app): State<App>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.dashboard().await?))
}

async fn water_usage(State(app): State<App>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.water_usage().await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    app: App,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "web ui listening on http://{addr}");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
