use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use super::ApiResponse;
use crate::error::AppResult;
use crate::models::DeploymentJob;
use crate::services::deployments::DeploymentRequest;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/project/deployment", post(deploy_project))
}

/// Blocks until every target host has finished or hit the job deadline. A partial
/// failure is still a 200: check `data.status` and the per-host `error` lists.
#[utoipa::path(
    post,
    path = "/api/project/deployment",
    tag = "deployments",
    request_body = DeploymentRequest,
    responses(
        (status = 200, description = "Finished deployment job", body = DeploymentJob),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Project not found")
    )
)]
pub(crate) async fn deploy_project(
    State(state): State<AppState>,
    Json(payload): Json<DeploymentRequest>,
) -> AppResult<Json<ApiResponse<DeploymentJob>>> {
    let job = state.deployments.deploy(payload).await?;
    Ok(ApiResponse::success(job))
}
