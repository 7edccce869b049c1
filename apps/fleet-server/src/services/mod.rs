pub mod builds;
pub mod containers;
pub mod credentials;
pub mod deployments;
pub mod hosts;
pub mod ingest;
pub mod onboarding;
pub mod performance;
