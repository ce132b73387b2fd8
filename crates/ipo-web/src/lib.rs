//! Axum read API over the offering snapshot, plus the admin refresh trigger.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ipo_core::{CycleError, CycleRequest};
use ipo_storage::{RecordStore, SnapshotCache};
use ipo_sync::{IngestionPipeline, SnapshotOrRun};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "ipo-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<IngestionPipeline>,
    pub request: CycleRequest,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<IngestionPipeline>, request: CycleRequest) -> Self {
        Self {
            pipeline,
            request,
            admin_token: None,
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token;
        self
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/ipos", get(offerings_handler))
        .route("/api/ipos/stored", get(stored_offerings_handler))
        .route("/api/admin/refresh", post(admin_refresh_handler))
        .layer(cors)
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "read api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Cached snapshot when present, otherwise a synchronous sync cycle.
async fn offerings_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.cache().read_raw().await {
        Ok(Some(payload)) => {
            debug!("serving offerings from cache");
            return raw_json(payload);
        }
        Ok(None) => info!("cache miss; running on-demand sync"),
        Err(err) => warn!(error = %err, "cache read failed; running on-demand sync"),
    }

    match state.pipeline.snapshot_or_run(&state.request).await {
        Ok(SnapshotOrRun::Cached(payload)) => {
            debug!("cache filled while waiting for the running cycle");
            raw_json(payload)
        }
        Ok(SnapshotOrRun::Ran(result)) => Json(result.saved_offerings).into_response(),
        Err(err) => cycle_error(err),
    }
}

fn raw_json(payload: String) -> Response {
    ([(header::CONTENT_TYPE, "application/json")], payload).into_response()
}

async fn stored_offerings_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.store().list_all().await {
        Ok(offerings) => Json(offerings).into_response(),
        Err(err) => json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Runs a cycle unconditionally. Requires `Authorization: Bearer <IPO_ADMIN_TOKEN>`.
async fn admin_refresh_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return json_error(StatusCode::FORBIDDEN, "admin refresh is disabled".to_string());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(expected) {
        warn!("rejected admin refresh with missing or wrong token");
        return json_error(StatusCode::UNAUTHORIZED, "invalid admin token".to_string());
    }

    info!("admin refresh requested");
    match state.pipeline.run(&state.request).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => cycle_error(err),
    }
}

fn cycle_error(err: CycleError) -> Response {
    if err.is_missing_credentials() {
        return json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Missing source credentials in environment variables.".to_string(),
        );
    }
    error!(stage = %err.stage(), error = %err, "on-demand sync failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Scraping failed: {err}"))
}

fn json_error(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorBody { error })).into_response()
}
