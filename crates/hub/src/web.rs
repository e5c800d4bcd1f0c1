use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ControlConfig;
use crate::control::ControlFlags;
use crate::cycle::log_batch;
use crate::db::Db;
use crate::decision::{Decision, Origin};
use crate::dispatcher::Dispatcher;
use crate::error::DispatchError;
use crate::link::Link;
use crate::state::SharedState;

pub struct AppState<L> {
    pub shared: SharedState,
    pub dispatcher: Arc<Dispatcher<L>>,
    pub db: Db,
    pub control: ControlConfig,
}

// Manual impl: `L` itself is not `Clone`.
impl<L> Clone for AppState<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            dispatcher: Arc::clone(&self.dispatcher),
            db: self.db.clone(),
            control: self.control.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<L: Link + 'static>(state: AppState<L>) -> Router {
    Router::new()
        .route("/api/status", get(api_status::<L>))
        .route("/api/actions", post(api_actions::<L>))
        .with_state(state)
}

async fn api_status<L: Link>(State(state): State<AppState<L>>) -> impl IntoResponse {
    let limits = state.dispatcher.rate_limits(OffsetDateTime::now_utc()).await;
    let st = state.shared.read().await;
    Json(st.to_status(limits))
}

/// Interactive decision: validated and dispatched like any other, but never
/// queued behind a running cycle.
async fn api_actions<L: Link>(
    State(state): State<AppState<L>>,
    Json(decision): Json<Decision>,
) -> Response {
    let now = OffsetDateTime::now_utc();
    let flags = ControlFlags::read(&state.control);

    match state
        .dispatcher
        .try_execute(&decision, Origin::Manual, flags, now)
        .await
    {
        Ok(report) => {
            info!(actions = decision.actions.len(), "manual decision dispatched");
            log_batch(&state.db, &state.shared, Origin::Manual, &decision, &report, now).await;
            let code = if report.failure.is_some() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::OK
            };
            (code, Json(report)).into_response()
        }
        Err(DispatchError::Busy) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a dispatch is already in progress" })),
        )
            .into_response(),
        Err(e) => {
            warn!(kind = %e.kind(), "manual decision failed: {e}");
            state
                .shared
                .write()
                .await
                .record_error(format!("manual decision failed: {e}"));
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string(), "kind": e.kind() })),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<L: Link + 'static>(state: AppState<L>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
