use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use super::ApiResponse;
use crate::error::AppResult;
use crate::models::AgentReport;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct ReportAck {
    /// True when this report completed the host's onboarding.
    pub onboarded: bool,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/remote/server/report", post(receive_report))
}

#[utoipa::path(
    post,
    path = "/remote/server/report",
    tag = "agent",
    request_body = AgentReport,
    responses(
        (status = 200, description = "Report stored", body = ReportAck),
        (status = 400, description = "Malformed report"),
        (status = 401, description = "Host is neither onboarding nor deployed")
    )
)]
pub(crate) async fn receive_report(
    State(state): State<AppState>,
    Json(report): Json<AgentReport>,
) -> AppResult<Json<ApiResponse<ReportAck>>> {
    let onboarded = state.ingest.ingest(report).await?;
    Ok(ApiResponse::success(ReportAck { onboarded }))
}
