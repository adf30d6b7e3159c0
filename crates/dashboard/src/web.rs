use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::command::{Command, PublishError};
use crate::dashboard::Dashboard;
use crate::reading::Reading;

pub type AppState = Arc<Dashboard>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(dash: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/windows", get(api_windows))
        .route("/api/command", post(api_command))
        .with_state(dash)
}

async fn api_status(State(dash): State<AppState>) -> impl IntoResponse {
    Json(dash.view().await)
}

#[derive(Deserialize)]
struct HistoryQuery {
    window: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    window_millis: Option<u64>,
    readings: Vec<Reading>,
}

async fn api_history(State(dash): State<AppState>, Query(q): Query<HistoryQuery>) -> Response {
    let window = match q.window.as_deref() {
        None => None,
        Some(label) => match dash.window(label) {
            Some(d) => Some(d),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("unknown window '{label}'") })),
                )
                    .into_response();
            }
        },
    };

    Json(HistoryResponse {
        window_millis: window.map(|d| d.as_millis() as u64),
        readings: dash.history(window).await,
    })
    .into_response()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WindowEntry {
    label: String,
    millis: u64,
}

async fn api_windows(State(dash): State<AppState>) -> impl IntoResponse {
    let windows: Vec<WindowEntry> = dash
        .windows()
        .iter()
        .map(|(label, d)| WindowEntry {
            label: label.clone(),
            millis: d.as_millis() as u64,
        })
        .collect();
    Json(windows)
}

async fn api_command(
    State(dash): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let cmd = Command::from_value(body);
    match dash.publish(&cmd).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "ok": true }))).into_response(),
        Err(e) => {
            let status = match e {
                PublishError::Serialize(_) => StatusCode::BAD_REQUEST,
                PublishError::NotConnected | PublishError::Client(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            (status, Json(json!({ "ok": false, "error": e.to_string() }))).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    dash: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "api listening");

    axum::serve(listener, router(dash))
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
