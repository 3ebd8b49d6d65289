//! Admission control over shared fixed-window counters.
//!
//! Three policies share one mechanism, an atomic per-identity counter whose
//! expiry marks the end of its window:
//!
//! - **Rate limit**: reject once the count passes the limit
//! - **Throttle**: delay by a fixed step per request over the limit
//! - **Lockout**: count failed credential checks only, reject while over the limit
//!
//! Fixed windows allow bursts of up to twice the limit across a window
//! boundary.
//!
//! When the store is unreachable or slow the gate fails open: the request is
//! admitted, a warning is logged and the decision is flagged `degraded`.

pub mod gate;
pub mod layer;

pub use gate::{
    throttle_delay, AdmissionConfig, AdmissionDecision, AdmissionGate, CounterKey, Namespace,
    ThrottleOutcome,
};
pub use layer::{rejection_response, AdmissionLayer, AdmissionPolicy, AdmissionService, ClientIdentity};
