use std::future::ready;

use axum::{routing::get, Router};
use categorizer_common::metrics::setup_metrics_routes;
use health::{HealthRegistry, LivenessStatus};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub const SERVICE_NAME: &str = "categorization-service";

pub async fn index() -> &'static str {
    SERVICE_NAME
}

async fn liveness() -> LivenessStatus {
    LivenessStatus::healthy(SERVICE_NAME)
}

/// Health and metrics endpoints of the worker.
///
/// `/_liveness` and `/health` answer as long as the process runs. `/_readiness`
/// reflects the registered components, so it turns unhealthy while the worker has
/// no broker session.
pub fn router(readiness: HealthRegistry, recorder: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/health", get(liveness))
        .route("/_readiness", get(move || ready(readiness.get_status())));

    match recorder {
        Some(recorder_handle) => setup_metrics_routes(router, recorder_handle),
        None => router,
    }
}

/// Serve `router` until `shutdown` is cancelled.
pub async fn serve(
    router: Router,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
