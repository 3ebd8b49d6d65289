use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AdmissionSettings;
use crate::error::{ErrorCode, Result, TollgateError};
use crate::store::{KeyTtl, SharedStore};
use crate::telemetry::AdmissionMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Counter Keys
// ═══════════════════════════════════════════════════════════════════════════════

/// Counter namespaces. Each policy counts independently, so a locked-out
/// identity and a rate-limited one never share a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Namespace {
    Rate,
    Throttle,
    LoginFail,
}

impl Namespace {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Namespace::Rate => "rate",
            Namespace::Throttle => "throttle",
            Namespace::LoginFail => "login-fail",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed-window counter for one identity.
///
/// The window start is the first increment; it is carried by the key's
/// expiry rather than by the key name, so the window rolls over exactly when
/// the key expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub namespace: Namespace,
    pub identity: String,
}

impl CounterKey {
    pub fn new(namespace: Namespace, identity: impl Into<String>) -> Self {
        Self {
            namespace,
            identity: identity.into(),
        }
    }

    pub fn to_key(&self) -> String {
        format!("{}:{}", self.namespace, self.identity)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decisions
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a rate-limit or lockout check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    /// Counter that produced the decision
    pub namespace: Namespace,
    pub allowed: bool,
    pub limit: u64,
    /// Counter value after this call (0 when degraded)
    pub count: u64,
    pub remaining: u64,
    /// Seconds until the window resets, set on rejection
    pub retry_after_secs: Option<u64>,
    /// The store could not be consulted and the call failed open
    pub degraded: bool,
}

impl AdmissionDecision {
    fn allow(namespace: Namespace, limit: u64, count: u64) -> Self {
        Self {
            namespace,
            allowed: true,
            limit,
            count,
            remaining: limit.saturating_sub(count),
            retry_after_secs: None,
            degraded: false,
        }
    }

    fn reject(namespace: Namespace, limit: u64, count: u64, retry_after_secs: u64) -> Self {
        Self {
            namespace,
            allowed: false,
            limit,
            count,
            remaining: 0,
            retry_after_secs: Some(retry_after_secs),
            degraded: false,
        }
    }

    fn degraded(namespace: Namespace, limit: u64) -> Self {
        Self {
            namespace,
            allowed: true,
            limit,
            count: 0,
            remaining: limit,
            retry_after_secs: None,
            degraded: true,
        }
    }

    /// `LockedOut` for the lockout counter, `RateLimited` otherwise.
    pub fn error_code(&self) -> ErrorCode {
        match self.namespace {
            Namespace::LoginFail => ErrorCode::LockedOut,
            Namespace::Rate | Namespace::Throttle => ErrorCode::RateLimited,
        }
    }

    /// Convert a rejection into the error surfaced to callers.
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            return Ok(self);
        }
        let retry_after = self.retry_after_secs.unwrap_or(1);
        match self.error_code() {
            ErrorCode::LockedOut => Err(TollgateError::locked_out(retry_after)),
            _ => Err(TollgateError::rate_limited(retry_after)),
        }
    }
}

/// Outcome of a throttle call. Throttling never rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleOutcome {
    pub count: u64,
    pub delay: Duration,
    pub degraded: bool,
}

/// Delay owed by the `count`-th request in a window: one `unit_delay` per
/// request over `limit`, capped at `max_delay`.
pub fn throttle_delay(count: u64, limit: u64, unit_delay: Duration, max_delay: Duration) -> Duration {
    let excess = count.saturating_sub(limit);
    let excess = u32::try_from(excess).unwrap_or(u32::MAX);
    unit_delay.saturating_mul(excess).min(max_delay)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Gate
// ═══════════════════════════════════════════════════════════════════════════════

/// Runtime settings of the gate.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Allow on store timeout/error instead of propagating it
    pub fail_open: bool,
    /// Upper bound on each store round-trip
    pub store_timeout: Duration,
    /// Cap on any single throttle delay
    pub max_throttle_delay: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            store_timeout: Duration::from_millis(500),
            max_throttle_delay: Duration::from_secs(10),
        }
    }
}

impl From<&AdmissionSettings> for AdmissionConfig {
    fn from(settings: &AdmissionSettings) -> Self {
        Self {
            fail_open: settings.fail_open,
            store_timeout: settings.store_timeout,
            max_throttle_delay: settings.max_throttle_delay,
        }
    }
}

/// Stateless admission decisions over a [`SharedStore`].
///
/// All state lives in the store; any number of gates in any number of
/// processes can share it.
#[derive(Clone)]
pub struct AdmissionGate {
    store: Arc<dyn SharedStore>,
    config: AdmissionConfig,
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .finish()
    }
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn SharedStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Fixed-window rate limit: the `limit + 1`-th call in a window and every
    /// call after it are rejected until the window expires.
    pub async fn rate_limit(&self, identity: &str, limit: u64, window: Duration) -> Result<AdmissionDecision> {
        let key = CounterKey::new(Namespace::Rate, identity);
        let counted = self
            .bounded("rate_limit", self.store.incr_with_expiry(&key.to_key(), window))
            .await;

        let decision = match counted {
            Ok(count) => {
                let count = count.max(0) as u64;
                if count > limit {
                    let retry_after = self.retry_after(&key, window).await;
                    debug!(identity = %identity, count, limit, retry_after, "Rate limit exceeded");
                    AdmissionDecision::reject(Namespace::Rate, limit, count, retry_after)
                } else {
                    AdmissionDecision::allow(Namespace::Rate, limit, count)
                }
            }
            Err(e) => self
                .degrade(Namespace::Rate, &key, e)
                .map(|_| AdmissionDecision::degraded(Namespace::Rate, limit))?,
        };

        if !decision.degraded {
            AdmissionMetrics::record(Namespace::Rate.as_str(), decision.allowed);
        }
        Ok(decision)
    }

    /// Soft throttle: counts like [`rate_limit`](Self::rate_limit) but delays
    /// the caller instead of rejecting it.
    pub async fn throttle(
        &self,
        identity: &str,
        limit: u64,
        window: Duration,
        unit_delay: Duration,
    ) -> Result<ThrottleOutcome> {
        let outcome = self.throttle_delay_for(identity, limit, window, unit_delay).await?;
        if !outcome.delay.is_zero() {
            debug!(
                identity = %identity,
                count = outcome.count,
                delay_ms = outcome.delay.as_millis() as u64,
                "Throttling request"
            );
            tokio::time::sleep(outcome.delay).await;
        }
        Ok(outcome)
    }

    /// Count a throttled request and compute its delay without sleeping.
    pub async fn throttle_delay_for(
        &self,
        identity: &str,
        limit: u64,
        window: Duration,
        unit_delay: Duration,
    ) -> Result<ThrottleOutcome> {
        let key = CounterKey::new(Namespace::Throttle, identity);
        let counted = self
            .bounded("throttle", self.store.incr_with_expiry(&key.to_key(), window))
            .await;

        match counted {
            Ok(count) => {
                let count = count.max(0) as u64;
                let delay = throttle_delay(count, limit, unit_delay, self.config.max_throttle_delay);
                AdmissionMetrics::record(Namespace::Throttle.as_str(), true);
                if !delay.is_zero() {
                    AdmissionMetrics::throttle_delay(delay.as_secs_f64());
                }
                Ok(ThrottleOutcome {
                    count,
                    delay,
                    degraded: false,
                })
            }
            Err(e) => {
                self.degrade(Namespace::Throttle, &key, e)?;
                Ok(ThrottleOutcome {
                    count: 0,
                    delay: Duration::ZERO,
                    degraded: true,
                })
            }
        }
    }

    /// Read-only lockout check for an identity; never increments.
    pub async fn check_lockout(&self, identity: &str, limit: u64, window: Duration) -> Result<AdmissionDecision> {
        let key = CounterKey::new(Namespace::LoginFail, identity);
        let read = self.bounded("check_lockout", self.store.get(&key.to_key())).await;

        let decision = match read {
            Ok(raw) => {
                let failures = raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
                if failures > limit {
                    let retry_after = self.retry_after(&key, window).await;
                    debug!(identity = %identity, failures, limit, "Identity locked out");
                    AdmissionDecision::reject(Namespace::LoginFail, limit, failures, retry_after)
                } else {
                    AdmissionDecision::allow(Namespace::LoginFail, limit, failures)
                }
            }
            Err(e) => self
                .degrade(Namespace::LoginFail, &key, e)
                .map(|_| AdmissionDecision::degraded(Namespace::LoginFail, limit))?,
        };

        if !decision.degraded {
            AdmissionMetrics::record(Namespace::LoginFail.as_str(), decision.allowed);
        }
        Ok(decision)
    }

    /// Count one failed credential check. Returns the decision that now
    /// applies to the identity.
    pub async fn record_failure(&self, identity: &str, limit: u64, window: Duration) -> Result<AdmissionDecision> {
        let key = CounterKey::new(Namespace::LoginFail, identity);
        let counted = self
            .bounded("record_failure", self.store.incr_with_expiry(&key.to_key(), window))
            .await;

        match counted {
            Ok(failures) => {
                let failures = failures.max(0) as u64;
                if failures > limit {
                    let retry_after = self.retry_after(&key, window).await;
                    warn!(identity = %identity, failures, limit, "Identity locked out after repeated failures");
                    Ok(AdmissionDecision::reject(Namespace::LoginFail, limit, failures, retry_after))
                } else {
                    Ok(AdmissionDecision::allow(Namespace::LoginFail, limit, failures))
                }
            }
            Err(e) => self
                .degrade(Namespace::LoginFail, &key, e)
                .map(|_| AdmissionDecision::degraded(Namespace::LoginFail, limit)),
        }
    }

    /// Forget recorded failures after a successful credential check.
    pub async fn clear_failures(&self, identity: &str) -> Result<()> {
        let key = CounterKey::new(Namespace::LoginFail, identity);
        match self.bounded("clear_failures", self.store.del(&key.to_key())).await {
            Ok(_) => Ok(()),
            Err(e) => self.degrade(Namespace::LoginFail, &key, e),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TollgateError::store_timeout(operation)),
        }
    }

    /// Seconds until `key` expires. A counter found without expiry was left
    /// by a crash between INCR and EXPIRE; it is re-armed here.
    async fn retry_after(&self, key: &CounterKey, window: Duration) -> u64 {
        let window_secs = window.as_secs().max(1);
        let full = key.to_key();

        match self.bounded("ttl", self.store.ttl(&full)).await {
            Ok(ttl @ KeyTtl::Expires(_)) => ttl.as_secs_ceil().unwrap_or(window_secs).clamp(1, window_secs),
            Ok(KeyTtl::Persistent) => {
                warn!(
                    key = %full,
                    window_secs,
                    "Counter has no expiry; re-arming window"
                );
                if let Err(e) = self.bounded("expire", self.store.expire(&full, window)).await {
                    warn!(key = %full, error = %e, "Failed to re-arm counter expiry");
                }
                window_secs
            }
            Ok(KeyTtl::Missing) => 1,
            Err(e) => {
                warn!(key = %full, error = %e, "Could not read counter TTL");
                window_secs
            }
        }
    }

    /// Apply the store-unavailability policy to a failed store call.
    fn degrade(&self, namespace: Namespace, key: &CounterKey, error: TollgateError) -> Result<()> {
        if self.config.fail_open && error.code().is_transient_store() {
            warn!(
                policy = namespace.as_str(),
                identity = %key.identity,
                error = %error,
                "Shared store unavailable, admitting request"
            );
            AdmissionMetrics::degraded(namespace.as_str());
            Ok(())
        } else {
            Err(error)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
