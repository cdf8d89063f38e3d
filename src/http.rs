//! HTTP trigger for ad-hoc mirroring and read-only status

use crate::engine::MirrorEngine;
use crate::error::MirrorError;
use crate::gateway::RepositoryDescriptor;
use crate::supervisor::{DaemonState, ExportSupervisor};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MirrorEngine>,
    pub supervisor: Arc<ExportSupervisor>,
}

#[derive(Debug, Deserialize)]
pub struct MirrorParams {
    name: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mirrors", get(list_mirrors))
        .route("/mirrors/*url", post(create_mirror))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("HTTP trigger listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("HTTP trigger stopped");
    Ok(())
}

struct ApiError(MirrorError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MirrorError::InvalidDescriptor { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            MirrorError::LeaseTimeout { .. } => StatusCode::CONFLICT,
            MirrorError::CloneFailure { .. }
            | MirrorError::FetchFailure { .. }
            | MirrorError::FilesystemFailure { .. } => StatusCode::BAD_GATEWAY,
            MirrorError::DaemonLaunchFailure(_)
            | MirrorError::Store(_)
            | MirrorError::StoreTask(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "status": "error",
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<MirrorError> for ApiError {
    fn from(err: MirrorError) -> Self {
        ApiError(err)
    }
}

async fn create_mirror(
    State(state): State<AppState>,
    Path(url): Path<String>,
    Query(params): Query<MirrorParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let descriptor = RepositoryDescriptor::from_url(&url, params.name.as_deref());
    info!("Ad-hoc mirror request: {} as {}", url, descriptor.name);

    let outcome = state.engine.mirror_now(&descriptor).await.map_err(|e| {
        warn!("Ad-hoc mirror of {} failed: {}", url, e);
        ApiError(e)
    })?;

    Ok(Json(json!({
        "status": "success",
        "repo_name": outcome.name,
        "mirror_path": outcome.path,
        "clone_url": outcome.clone_url,
    })))
}

async fn list_mirrors(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mirrors = state.engine.store().blocking(|store| store.list()).await?;
    Ok(Json(json!({ "mirrors": mirrors })))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let daemon = state.supervisor.status();
    let status = if daemon.state == DaemonState::Running {
        "ok"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "export_daemon": daemon,
    }))
}
