use axum::routing::get;
use axum::{Json, Router};
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::healthz_handler,
        crate::routes::agent::receive_report,
        crate::routes::projects::create_image,
        crate::routes::projects::list_versions,
        crate::routes::projects::list_images,
        crate::routes::deployments::deploy_project,
        crate::routes::servers::remove_server,
        crate::routes::servers::server_performance,
        crate::routes::servers::container_performance,
        crate::routes::containers::list_containers,
        crate::routes::containers::inspect_container,
        crate::routes::containers::start_container,
        crate::routes::containers::stop_container,
        crate::routes::containers::delete_container,
    ),
    components(schemas(
        crate::routes::health::HealthStatus,
        crate::routes::agent::ReportAck,
        crate::routes::containers::ContainerActionRequest,
        crate::routes::servers::PerformanceQuery,
        crate::routes::servers::ContainerPerformanceQuery,
        crate::json::JsonValue,
        crate::models::AgentReport,
        crate::models::BuildJob,
        crate::models::BuildStatus,
        crate::models::ContainerRecord,
        crate::models::DeploymentJob,
        crate::models::DeploymentStatus,
        crate::models::HostResult,
        crate::models::ImageRecord,
        crate::models::MetricPoint,
        crate::models::ServerPerformance,
        crate::models::ContainerPerformance,
        crate::models::TimeRange,
        crate::models::ProjectVersion,
        crate::models::ServerRecord,
        crate::models::TopologyDiff,
        crate::services::builds::BuildRequest,
        crate::services::deployments::DeployTarget,
        crate::services::deployments::DeploymentRequest,
        crate::services::hosts::HostRemoval,
        crate::services::onboarding::OnboardingRequest,
    )),
    tags(
        (name = "agent", description = "Telemetry pushed by host agents"),
        (name = "projects", description = "Image builds and version registry"),
        (name = "deployments", description = "Multi-host deployments"),
        (name = "servers", description = "Managed hosts"),
        (name = "containers", description = "Container lifecycle on managed hosts")
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> serde_json::Value {
    serde_json::to_value(ApiDoc::openapi()).unwrap_or(serde_json::Value::Null)
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(|| async { Json(openapi_json()) }))
}
