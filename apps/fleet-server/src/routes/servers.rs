use axum::extract::{Path, State};
use axum::routing::{delete, post};
use axum::{Json, Router};

use super::ApiResponse;
use crate::error::AppResult;
use crate::models::{ContainerPerformance, ServerPerformance, TimeRange};
use crate::services::hosts::HostRemoval;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct PerformanceQuery {
    /// Server id.
    pub id: i64,
    #[serde(flatten)]
    pub range: TimeRange,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct ContainerPerformanceQuery {
    pub server_id: i64,
    pub container_name: String,
    #[serde(flatten)]
    pub range: TimeRange,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/server/{id}", delete(remove_server))
        .route("/server/performance", post(server_performance))
        .route("/server/container/performance", post(container_performance))
}

#[utoipa::path(
    delete,
    path = "/api/server/{id}",
    tag = "servers",
    params(("id" = i64, Path, description = "Server id")),
    responses(
        (status = 200, description = "Server removed; uninstall output attached", body = HostRemoval),
        (status = 404, description = "Server not found")
    )
)]
pub(crate) async fn remove_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<ApiResponse<HostRemoval>>> {
    let removal = state.hosts.remove(id).await?;
    Ok(ApiResponse::success(removal))
}

#[utoipa::path(
    post,
    path = "/api/server/performance",
    tag = "servers",
    request_body = PerformanceQuery,
    responses(
        (status = 200, description = "CPU, memory and network series plus the latest disk sample", body = ServerPerformance),
        (status = 400, description = "Invalid time range"),
        (status = 404, description = "Server not found")
    )
)]
pub(crate) async fn server_performance(
    State(state): State<AppState>,
    Json(query): Json<PerformanceQuery>,
) -> AppResult<Json<ApiResponse<ServerPerformance>>> {
    let perf = state
        .performance
        .server_performance(query.id, query.range)
        .await?;
    Ok(ApiResponse::success(perf))
}

#[utoipa::path(
    post,
    path = "/api/server/container/performance",
    tag = "servers",
    request_body = ContainerPerformanceQuery,
    responses(
        (status = 200, description = "Samples reported for one container", body = ContainerPerformance),
        (status = 400, description = "Invalid time range or container name"),
        (status = 404, description = "Server not found")
    )
)]
pub(crate) async fn container_performance(
    State(state): State<AppState>,
    Json(query): Json<ContainerPerformanceQuery>,
) -> AppResult<Json<ApiResponse<ContainerPerformance>>> {
    let perf = state
        .performance
        .container_performance(query.server_id, &query.container_name, query.range)
        .await?;
    Ok(ApiResponse::success(perf))
}
