//! HTTP surface: group catalog endpoints and the filter-run trigger.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::FilterError;
use crate::models::{Group, GroupInput, GroupMember};
use crate::runner::FilterRunner;

type AppState = Arc<FilterRunner>;

#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

pub struct ApiError(FilterError);

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FilterError::Validation { .. } => StatusCode::BAD_REQUEST,
            FilterError::RunInProgress => StatusCode::CONFLICT,
            FilterError::Database(_) | FilterError::Store(_) => {
                error!(error = %self.0, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(FilterError::validation("body", rejection.body_text()))
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(runner: AppState) -> Router {
    Router::new()
        .route("/groups", get(list_groups).post(create_group))
        .route("/groups/run-filters", post(run_filters))
        .route("/groups/{id}", put(update_group).delete(delete_group))
        .route("/groups/{id}/students", get(group_students))
        .layer(TraceLayer::new_for_http())
        .with_state(runner)
}

pub async fn serve(runner: AppState, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(runner))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}

async fn list_groups(State(runner): State<AppState>) -> ApiResult<Json<Vec<Group>>> {
    Ok(Json(runner.store().list_groups().await?))
}

async fn create_group(
    State(runner): State<AppState>,
    payload: Result<Json<GroupInput>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Group>)> {
    let Json(input) = payload?;
    let group = runner
        .store()
        .create_group(input.into_new_group()?)
        .await?;
    info!(group_id = group.id, "group created");
    Ok((StatusCode::CREATED, Json(group)))
}

/// Responds with `null` when the group does not exist.
async fn update_group(
    State(runner): State<AppState>,
    Path(id): Path<i32>,
    payload: Result<Json<GroupInput>, JsonRejection>,
) -> ApiResult<Json<Option<Group>>> {
    let Json(input) = payload?;
    let patch = input.into_patch()?;
    Ok(Json(runner.store().update_group(id, patch).await?))
}

async fn delete_group(
    State(runner): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<Json<Option<Group>>> {
    Ok(Json(runner.store().delete_group(id).await?))
}

async fn group_students(
    State(runner): State<AppState>,
    Path(id): Path<i32>,
) -> ApiResult<Json<Vec<GroupMember>>> {
    Ok(Json(runner.store().list_group_members(id).await?))
}

async fn run_filters(State(runner): State<AppState>) -> ApiResult<(StatusCode, Json<Vec<Group>>)> {
    let groups = runner.run_filters().await?;
    Ok((StatusCode::CREATED, Json(groups)))
}
