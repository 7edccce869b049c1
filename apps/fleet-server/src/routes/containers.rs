use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::ApiResponse;
use crate::error::AppResult;
use crate::json::JsonValue;
use crate::models::ContainerRecord;
use crate::services::containers::ContainerAction;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub struct ContainerActionRequest {
    pub server_id: i64,
    pub container_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/server/containers/{id}", get(list_containers))
        .route("/server/{id}/container/{container_id}", get(inspect_container))
        .route("/server/container/start", post(start_container))
        .route("/server/container/stop", post(stop_container))
        .route("/server/container/del", post(delete_container))
}

#[utoipa::path(
    get,
    path = "/api/server/containers/{id}",
    tag = "containers",
    params(("id" = i64, Path, description = "Server id")),
    responses(
        (status = 200, description = "Containers on the host", body = [ContainerRecord]),
        (status = 404, description = "Server not found"),
        (status = 502, description = "Host unreachable or docker failed")
    )
)]
pub(crate) async fn list_containers(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<ApiResponse<Vec<ContainerRecord>>>> {
    let containers = state.containers.list(id).await?;
    Ok(ApiResponse::success(containers))
}

#[utoipa::path(
    get,
    path = "/api/server/{id}/container/{container_id}",
    tag = "containers",
    params(
        ("id" = i64, Path, description = "Server id"),
        ("container_id" = String, Path, description = "Container id or name")
    ),
    responses(
        (status = 200, description = "docker inspect output", body = JsonValue),
        (status = 404, description = "Server not found")
    )
)]
pub(crate) async fn inspect_container(
    State(state): State<AppState>,
    Path((id, container_id)): Path<(i64, String)>,
) -> AppResult<Json<ApiResponse<JsonValue>>> {
    let inspected = state.containers.inspect(id, &container_id).await?;
    Ok(ApiResponse::success(inspected))
}

async fn apply(
    state: &AppState,
    payload: &ContainerActionRequest,
    action: ContainerAction,
) -> AppResult<Json<ApiResponse<Vec<String>>>> {
    let output = state
        .containers
        .apply(payload.server_id, &payload.container_id, action)
        .await?;
    Ok(ApiResponse::success(output))
}

#[utoipa::path(
    post,
    path = "/api/server/container/start",
    tag = "containers",
    request_body = ContainerActionRequest,
    responses((status = 200, description = "Command output", body = [String]))
)]
pub(crate) async fn start_container(
    State(state): State<AppState>,
    Json(payload): Json<ContainerActionRequest>,
) -> AppResult<Json<ApiResponse<Vec<String>>>> {
    apply(&state, &payload, ContainerAction::Start).await
}

#[utoipa::path(
    post,
    path = "/api/server/container/stop",
    tag = "containers",
    request_body = ContainerActionRequest,
    responses((status = 200, description = "Command output", body = [String]))
)]
pub(crate) async fn stop_container(
    State(state): State<AppState>,
    Json(payload): Json<ContainerActionRequest>,
) -> AppResult<Json<ApiResponse<Vec<String>>>> {
    apply(&state, &payload, ContainerAction::Stop).await
}

#[utoipa::path(
    post,
    path = "/api/server/container/del",
    tag = "containers",
    request_body = ContainerActionRequest,
    responses((status = 200, description = "Command output", body = [String]))
)]
pub(crate) async fn delete_container(
    State(state): State<AppState>,
    Json(payload): Json<ContainerActionRequest>,
) -> AppResult<Json<ApiResponse<Vec<String>>>> {
    apply(&state, &payload, ContainerAction::Remove).await
}
