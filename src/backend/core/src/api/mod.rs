//! HTTP API for Tollgate.
//!
//! - `GET  /health`                          liveness
//! - `GET  /health/queues`                   per-queue, per-state job counts
//! - `GET  /metrics`                         Prometheus text format
//! - `POST /api/v1/queues/:queue/jobs`       enqueue one job
//! - `POST /api/v1/queues/:queue/jobs/bulk`  enqueue many jobs
//! - `GET  /api/v1/jobs/:id`                 job record
//! - `DELETE /api/v1/jobs/:id`               remove a non-active job
//!
//! Enqueue routes sit behind the admission layers when admission is enabled.

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::admission::{AdmissionGate, AdmissionLayer, AdmissionPolicy};
use crate::config::AdmissionSettings;
use crate::jobs::JobQueue;
use crate::telemetry::MetricsRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: JobQueue,
    pub gate: AdmissionGate,
    pub metrics: MetricsRegistry,
    pub admission: AdmissionSettings,
}

/// Build the API router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// the admission layers can see the peer address.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut enqueue = Router::new()
        .route("/queues/:queue/jobs", post(handlers::enqueue_job))
        .route("/queues/:queue/jobs/bulk", post(handlers::enqueue_bulk));

    if state.admission.enabled {
        let settings = &state.admission;
        let throttle = AdmissionPolicy::Throttle {
            limit: settings.throttle.limit,
            window: settings.throttle.window,
            unit_delay: settings.throttle.unit_delay,
        };
        let rate_limit = AdmissionPolicy::RateLimit {
            limit: settings.rate_limit.limit,
            window: settings.rate_limit.window,
        };

        // Last layer added runs first: reject before delaying.
        enqueue = enqueue
            .route_layer(
                AdmissionLayer::new(state.gate.clone(), throttle)
                    .trust_proxy_headers(settings.trust_proxy_headers),
            )
            .route_layer(
                AdmissionLayer::new(state.gate.clone(), rate_limit)
                    .trust_proxy_headers(settings.trust_proxy_headers),
            );
    }

    let v1 = enqueue.route(
        "/jobs/:id",
        get(handlers::get_job).delete(handlers::remove_job),
    );

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/health/queues", get(handlers::queue_health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Lockout layer built from the configured limits, for routes that check
/// credentials. Only `401` responses count as failures.
pub fn lockout_layer(gate: AdmissionGate, settings: &AdmissionSettings) -> AdmissionLayer {
    AdmissionLayer::new(
        gate,
        AdmissionPolicy::Lockout {
            limit: settings.lockout.limit,
            window: settings.lockout.window,
        },
    )
    .trust_proxy_headers(settings.trust_proxy_headers)
}

/// API response wrapper.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: None,
        }
    }

    pub fn from_error(err: &crate::error::TollgateError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.user_message().to_string()),
            error_code: Some(err.code().to_string()),
        }
    }
}
