use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use super::ApiResponse;
use crate::error::AppResult;
use crate::models::{BuildJob, ImageRecord, ProjectVersion};
use crate::services::builds::BuildRequest;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/project/image/creation", post(create_image))
        .route("/project/{name}/versions", get(list_versions))
        .route("/project/{name}/image", get(list_images))
}

#[utoipa::path(
    post,
    path = "/api/project/image/creation",
    tag = "projects",
    request_body = BuildRequest,
    responses(
        (status = 200, description = "Finished build job", body = BuildJob),
        (status = 400, description = "Invalid request"),
        (status = 404, description = "Build host has no recorded account")
    )
)]
pub(crate) async fn create_image(
    State(state): State<AppState>,
    Json(payload): Json<BuildRequest>,
) -> AppResult<Json<ApiResponse<BuildJob>>> {
    let job = state.builds.run(payload).await?;
    Ok(ApiResponse::success(job))
}

#[utoipa::path(
    get,
    path = "/api/project/{name}/versions",
    tag = "projects",
    params(("name" = String, Path, description = "Image name")),
    responses((status = 200, description = "Recorded versions, newest first", body = [ProjectVersion]))
)]
pub(crate) async fn list_versions(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<ProjectVersion>>>> {
    let versions = state.builds.versions(&name).await?;
    Ok(ApiResponse::success(versions))
}

#[utoipa::path(
    get,
    path = "/api/project/{name}/image",
    tag = "projects",
    params(("name" = String, Path, description = "Image name")),
    responses(
        (status = 200, description = "Images present on the build host", body = [ImageRecord]),
        (status = 502, description = "Build host unreachable or docker failed")
    )
)]
pub(crate) async fn list_images(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ApiResponse<Vec<ImageRecord>>>> {
    let images = state.builds.images(&name).await?;
    Ok(ApiResponse::success(images))
}
