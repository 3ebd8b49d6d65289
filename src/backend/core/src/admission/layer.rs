//! Tower middleware applying an [`AdmissionGate`] policy to HTTP routes.
//!
//! ```rust,ignore
//! let login = Router::new()
//!     .route("/login", post(login_handler))
//!     .layer(AdmissionLayer::new(gate.clone(), AdmissionPolicy::Lockout { limit: 5, window }))
//!     .layer(AdmissionLayer::new(gate, AdmissionPolicy::RateLimit { limit: 5, window }));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::future::BoxFuture;
use std::{
    net::{IpAddr, SocketAddr},
    task::{Context, Poll},
    time::Duration,
};
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::gate::{AdmissionDecision, AdmissionGate};

/// Headers consulted, in order, when proxy headers are trusted.
const PROXY_HEADERS: [&str; 2] = ["X-Forwarded-For", "X-Real-IP"];

/// Which admission policy a layer enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Reject past `limit` requests per window.
    RateLimit { limit: u64, window: Duration },
    /// Delay past `limit` requests per window by `unit_delay` per excess request.
    Throttle {
        limit: u64,
        window: Duration,
        unit_delay: Duration,
    },
    /// Reject identities with more than `limit` failed credential checks.
    /// `401` responses from the inner service count as failures; a success
    /// clears the count.
    Lockout { limit: u64, window: Duration },
}

/// Identity of the calling client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdentity {
    Ip(IpAddr),
    Anonymous,
}

impl ClientIdentity {
    /// Resolve the client from trusted proxy headers, falling back to the
    /// peer address.
    pub fn from_request_parts(headers: &HeaderMap, remote_addr: Option<SocketAddr>, trust_proxy_headers: bool) -> Self {
        if trust_proxy_headers {
            for name in PROXY_HEADERS {
                if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                    // X-Forwarded-For may hold a chain; the first entry is the client.
                    let candidate = value.split(',').next().unwrap_or(value).trim();
                    if let Ok(ip) = candidate.parse() {
                        return ClientIdentity::Ip(ip);
                    }
                }
            }
        }

        remote_addr
            .map(|addr| ClientIdentity::Ip(addr.ip()))
            .unwrap_or(ClientIdentity::Anonymous)
    }

    pub fn as_key(&self) -> String {
        match self {
            ClientIdentity::Ip(ip) => ip.to_string(),
            ClientIdentity::Anonymous => "anonymous".to_string(),
        }
    }
}

/// The 429 response sent for a rejected request. `error_code` is
/// `LOCKED_OUT` for lockouts and `RATE_LIMITED` otherwise.
pub fn rejection_response(decision: &AdmissionDecision, message: &str) -> Response {
    let retry_after = decision.retry_after_secs.unwrap_or(1);
    let body = serde_json::json!({
        "success": false,
        "message": message,
        "retryAfter": retry_after,
        "error_code": decision.error_code(),
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert("Retry-After", HeaderValue::from(retry_after));
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u64));
    response
}

fn annotate(response: &mut Response, decision: &AdmissionDecision) {
    if decision.degraded {
        return;
    }
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Admission layer for Tower.
#[derive(Clone)]
pub struct AdmissionLayer {
    gate: AdmissionGate,
    policy: AdmissionPolicy,
    trust_proxy_headers: bool,
}

impl AdmissionLayer {
    pub fn new(gate: AdmissionGate, policy: AdmissionPolicy) -> Self {
        Self {
            gate,
            policy,
            trust_proxy_headers: false,
        }
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            gate: self.gate.clone(),
            policy: self.policy,
            trust_proxy_headers: self.trust_proxy_headers,
        }
    }
}

/// Admission service.
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    gate: AdmissionGate,
    policy: AdmissionPolicy,
    trust_proxy_headers: bool,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let gate = self.gate.clone();
        let policy = self.policy;
        // The clone that was driven to readiness serves this request.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0);
        let identity =
            ClientIdentity::from_request_parts(request.headers(), remote_addr, self.trust_proxy_headers).as_key();

        Box::pin(async move {
            match policy {
                AdmissionPolicy::RateLimit { limit, window } => {
                    match gate.rate_limit(&identity, limit, window).await {
                        Ok(decision) if decision.allowed => {
                            let mut response = inner.call(request).await?;
                            annotate(&mut response, &decision);
                            Ok(response)
                        }
                        Ok(decision) => Ok(rejection_response(
                            &decision,
                            "Too many requests. Try again later.",
                        )),
                        Err(e) => Ok(e.into_response()),
                    }
                }

                AdmissionPolicy::Throttle {
                    limit,
                    window,
                    unit_delay,
                } => match gate.throttle(&identity, limit, window, unit_delay).await {
                    Ok(_) => inner.call(request).await,
                    Err(e) => Ok(e.into_response()),
                },

                AdmissionPolicy::Lockout { limit, window } => {
                    match gate.check_lockout(&identity, limit, window).await {
                        Ok(decision) if !decision.allowed => {
                            return Ok(rejection_response(
                                &decision,
                                "Too many failed attempts. Try again later.",
                            ));
                        }
                        Ok(_) => {}
                        Err(e) => return Ok(e.into_response()),
                    }

                    let response = inner.call(request).await?;
                    let status = response.status();

                    if status == StatusCode::UNAUTHORIZED {
                        if let Err(e) = gate.record_failure(&identity, limit, window).await {
                            warn!(identity = %identity, error = %e, "Failed to record credential failure");
                        }
                    } else if status.is_success() {
                        if let Err(e) = gate.clear_failures(&identity).await {
                            debug!(identity = %identity, error = %e, "Failed to clear credential failures");
                        }
                    }

                    Ok(response)
                }
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
