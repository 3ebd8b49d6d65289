//! Integration tests for the admission gate.
//!
//! Tests cover:
//! - Concurrent rate limiting from one identity
//! - Throttle delays under paused time
//! - Fail-open and fail-closed behaviour on a failing store
//! - Lockout counting and clearing

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tollgate_core::admission::{AdmissionConfig, AdmissionGate};
use tollgate_core::error::{ErrorCode, Result, TollgateError};
use tollgate_core::store::{InMemoryStore, KeyTtl, SharedStore};

/// A store whose every call fails like an unreachable Redis.
struct UnreachableStore {
    calls: AtomicU64,
}

impl UnreachableStore {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
        }
    }

    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TollgateError::new(ErrorCode::StoreUnavailable, "connection refused"))
    }
}

#[async_trait]
impl SharedStore for UnreachableStore {
    async fn incr(&self, _key: &str) -> Result<i64> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        self.fail()
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        self.fail()
    }

    async fn ttl(&self, _key: &str) -> Result<KeyTtl> {
        self.fail()
    }

    async fn del(&self, _key: &str) -> Result<bool> {
        self.fail()
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: &str,
        _ttl: Option<Duration>,
    ) -> Result<bool> {
        self.fail()
    }

    async fn ping(&self) -> Result<()> {
        self.fail()
    }

    fn name(&self) -> &'static str {
        "unreachable"
    }
}

/// A store that never answers.
struct HangingStore;

#[async_trait]
impl SharedStore for HangingStore {
    async fn incr(&self, _key: &str) -> Result<i64> {
        std::future::pending().await
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        std::future::pending().await
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        std::future::pending().await
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
        std::future::pending().await
    }

    async fn ttl(&self, _key: &str) -> Result<KeyTtl> {
        std::future::pending().await
    }

    async fn del(&self, _key: &str) -> Result<bool> {
        std::future::pending().await
    }

    async fn compare_and_set(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: &str,
        _ttl: Option<Duration>,
    ) -> Result<bool> {
        std::future::pending().await
    }

    async fn ping(&self) -> Result<()> {
        std::future::pending().await
    }

    fn name(&self) -> &'static str {
        "hanging"
    }
}

fn memory_gate() -> AdmissionGate {
    AdmissionGate::new(Arc::new(InMemoryStore::new()), AdmissionConfig::default())
}

const WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// Rate Limit Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_requests_reject_exactly_excess() {
    let gate = memory_gate();
    let limit = 10;
    let total = 64;

    let handles: Vec<_> = (0..total)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.rate_limit("203.0.113.1", limit, WINDOW).await })
        })
        .collect();

    let mut rejected = 0;
    for handle in handles {
        let decision = handle.await.unwrap().unwrap();
        if !decision.allowed {
            rejected += 1;
            assert!(decision.retry_after_secs.unwrap() <= 60);
        }
    }

    assert_eq!(rejected, total - limit);
}

#[tokio::test]
async fn test_rejection_converts_to_rate_limited_error() {
    let gate = memory_gate();
    gate.rate_limit("a", 1, WINDOW).await.unwrap();
    let err = gate
        .rate_limit("a", 1, WINDOW)
        .await
        .unwrap()
        .into_result()
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::RateLimited);
    assert_eq!(err.http_status().as_u16(), 429);
}

// ============================================================================
// Throttle Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_throttle_25th_request_waits_one_second() {
    let gate = memory_gate();
    let unit = Duration::from_millis(200);

    for _ in 0..24 {
        gate.throttle("198.51.100.7", 20, WINDOW, unit).await.unwrap();
    }

    let started = tokio::time::Instant::now();
    let outcome = gate.throttle("198.51.100.7", 20, WINDOW, unit).await.unwrap();

    assert_eq!(outcome.count, 25);
    assert_eq!(outcome.delay, Duration::from_millis(1000));
    assert!(started.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test]
async fn test_throttle_delay_is_capped() {
    let gate = AdmissionGate::new(
        Arc::new(InMemoryStore::new()),
        AdmissionConfig {
            max_throttle_delay: Duration::from_millis(500),
            ..AdmissionConfig::default()
        },
    );

    let mut last = Duration::ZERO;
    for _ in 0..30 {
        last = gate
            .throttle_delay_for("x", 1, WINDOW, Duration::from_millis(200))
            .await
            .unwrap()
            .delay;
    }
    assert_eq!(last, Duration::from_millis(500));
}

// ============================================================================
// Store Failure Tests
// ============================================================================

#[tokio::test]
async fn test_fail_open_on_unreachable_store() {
    let store = Arc::new(UnreachableStore::new());
    let gate = AdmissionGate::new(store.clone(), AdmissionConfig::default());

    let decision = gate.rate_limit("a", 5, WINDOW).await.unwrap();
    assert!(decision.allowed);
    assert!(decision.degraded);

    let throttled = gate
        .throttle("a", 1, WINDOW, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(throttled.degraded);
    assert_eq!(throttled.delay, Duration::ZERO);

    assert!(gate.check_lockout("a", 5, WINDOW).await.unwrap().allowed);
    assert!(store.calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_fail_closed_when_configured() {
    let gate = AdmissionGate::new(
        Arc::new(UnreachableStore::new()),
        AdmissionConfig {
            fail_open: false,
            ..AdmissionConfig::default()
        },
    );

    let err = gate.rate_limit("a", 5, WINDOW).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::StoreUnavailable);
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_bounded_by_timeout() {
    let gate = AdmissionGate::new(
        Arc::new(HangingStore),
        AdmissionConfig {
            store_timeout: Duration::from_millis(50),
            ..AdmissionConfig::default()
        },
    );

    let started = tokio::time::Instant::now();
    let decision = gate.rate_limit("a", 5, WINDOW).await.unwrap();

    assert!(decision.degraded);
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ============================================================================
// Lockout Tests
// ============================================================================

#[tokio::test]
async fn test_lockout_clears_on_success() {
    let gate = memory_gate();
    let window = Duration::from_secs(300);

    for _ in 0..6 {
        gate.record_failure("user-ip", 5, window).await.unwrap();
    }
    assert!(!gate.check_lockout("user-ip", 5, window).await.unwrap().allowed);

    gate.clear_failures("user-ip").await.unwrap();
    let decision = gate.check_lockout("user-ip", 5, window).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.count, 0);
}
