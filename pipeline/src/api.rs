use crate::config::Listener as ListenerConfig;
use crate::materializer::{MaterializeError, PurgeReport};
use crate::resolver::{PluResolver, ResolveError};
use crate::scheduler::{Pipeline, Scheduler, SchedulerError};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use plu::ProductId;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum ApiServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<PluResolver>,
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Arc<Scheduler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/plu/{hash}", get(resolve_handler))
        .route("/products/{product_id}/purge", post(purge_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
}

pub async fn serve(
    listener: &ListenerConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ApiServerError> {
    let addr = format!("{}:{}", listener.host, listener.port);
    let tcp = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "API listening");

    axum::serve(tcp, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Serialize, Debug, PartialEq)]
struct PluResponse {
    hash: String,
    plu: String,
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            error_message: message,
        }),
    )
        .into_response()
}

async fn resolve_handler(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<PluResponse>, ResolveError> {
    let plu = state.resolver.resolve_plu(&hash).await?;
    Ok(Json(PluResponse { hash, plu }))
}

impl IntoResponse for ResolveError {
    fn into_response(self) -> Response {
        let status = match self {
            ResolveError::NotFound => StatusCode::NOT_FOUND,
            ResolveError::InvalidHash => StatusCode::BAD_REQUEST,
            ResolveError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        error_response(status, self.to_string())
    }
}

async fn purge_handler(
    State(state): State<AppState>,
    Path(product_id): Path<ProductId>,
) -> Result<Json<PurgeReport>, SchedulerError> {
    Ok(Json(state.pipeline.purge_retired(product_id).await?))
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = match &self {
            SchedulerError::Materialize(MaterializeError::ProductNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            SchedulerError::Materialize(MaterializeError::Integrity(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        error_response(status, self.to_string())
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<AppState>) -> StatusCode {
    if state.scheduler.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
