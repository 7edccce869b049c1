pub mod agent;
pub mod console;
pub mod containers;
pub mod deployments;
pub mod health;
pub mod onboarding;
pub mod projects;
pub mod servers;

use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

pub const SUCCESS_STATUS: i32 = 0;

/// Envelope shared by every JSON response. Errors reuse it with the HTTP code as
/// `status` (see `error::AppError`).
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub status: i32,
    pub msg: String,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            status: SUCCESS_STATUS,
            msg: "success".to_string(),
            data,
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(onboarding::router())
        .merge(console::router())
        .merge(agent::router())
        .nest(
            "/api",
            Router::new()
                .merge(projects::router())
                .merge(deployments::router())
                .merge(servers::router())
                .merge(containers::router())
                .merge(crate::openapi::router()),
        )
        .with_state(state)
}
