use axum::routing::get;
use axum::{Json, Router};

use super::ApiResponse;
use crate::state::AppState;

/// Liveness payload; served without touching the database or any host.
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct HealthStatus {
    pub service: &'static str,
    pub version: &'static str,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Process is serving requests", body = HealthStatus))
)]
pub(crate) async fn healthz_handler() -> Json<ApiResponse<HealthStatus>> {
    ApiResponse::success(HealthStatus {
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
