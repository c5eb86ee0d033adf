// ABOUTME: Subscription listener trait, closure adapters and the values passed to listeners

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::protocol::{ErrorCategory, QueryId, SubscriptionError, TableUpdate};

use super::state::SubscriptionState;
use super::strategy::SubscriptionStrategy;

/// Returned by every registration; pass to `remove_callback` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb-{}", self.0)
    }
}

/// Where a subscription failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The server rejected the subscription
    Protocol,
    /// The connection failed or could not be obtained
    Connection,
    /// No acknowledgment arrived within `subscribe_timeout`
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Protocol => "protocol",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
        })
    }
}

/// A failed attempt, as handed to `on_error` and kept in the error history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Index of the offending query when the server tied the error to one
    pub query_index: Option<usize>,
    /// Server error classification, protocol failures only
    pub category: Option<ErrorCategory>,
    pub query_id: Option<QueryId>,
    /// Retries already spent when this failure happened
    pub retry_count: u32,
    pub at: DateTime<Utc>,
}

impl SubscriptionFailure {
    pub(crate) fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            query_index: None,
            category: None,
            query_id: None,
            retry_count: 0,
            at: Utc::now(),
        }
    }

    /// Failure reported by the server for the query at `query_index`.
    pub(crate) fn from_server(err: &SubscriptionError, query_index: Option<usize>) -> Self {
        Self {
            query_index,
            category: Some(err.category()),
            ..Self::new(FailureKind::Protocol, err.error.clone())
        }
    }
}

impl fmt::Display for SubscriptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure", self.kind)?;
        if let Some(index) = self.query_index {
            write!(f, " (query {index})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Details of a completed subscribe, for `on_subscription_applied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedInfo {
    pub query_id: QueryId,
    pub strategy: SubscriptionStrategy,
    /// Tables named in single-query acknowledgments
    pub tables: Vec<String>,
    /// Summed server execution time over every acknowledgment
    pub host_execution_micros: u64,
}

/// Receives subscription events. Every method has an empty default.
///
/// Called synchronously from the task that observed the event, never while
/// the subscription's lock is held, in registration order.
pub trait SubscriptionListener: Send + Sync {
    fn on_applied(&self) {}

    fn on_subscription_applied(&self, _applied: &AppliedInfo) {}

    fn on_error(&self, _failure: &SubscriptionFailure) {}

    fn on_state_change(&self, _state: SubscriptionState, _reason: &str) {}

    /// One call per table in a transaction update.
    fn on_data_update(&self, _update: &TableUpdate) {}
}

// === Closure adapters ===

pub(crate) struct OnApplied<F>(pub(crate) F);

impl<F: Fn() + Send + Sync> SubscriptionListener for OnApplied<F> {
    fn on_applied(&self) {
        (self.0)();
    }
}

pub(crate) struct OnSubscriptionApplied<F>(pub(crate) F);

impl<F: Fn(&AppliedInfo) + Send + Sync> SubscriptionListener for OnSubscriptionApplied<F> {
    fn on_subscription_applied(&self, applied: &AppliedInfo) {
        (self.0)(applied);
    }
}

pub(crate) struct OnError<F>(pub(crate) F);

impl<F: Fn(&SubscriptionFailure) + Send + Sync> SubscriptionListener for OnError<F> {
    fn on_error(&self, failure: &SubscriptionFailure) {
        (self.0)(failure);
    }
}

pub(crate) struct OnStateChange<F>(pub(crate) F);

impl<F: Fn(SubscriptionState, &str) + Send + Sync> SubscriptionListener for OnStateChange<F> {
    fn on_state_change(&self, state: SubscriptionState, reason: &str) {
        (self.0)(state, reason);
    }
}

pub(crate) struct OnDataUpdate<F>(pub(crate) F);

impl<F: Fn(&TableUpdate) + Send + Sync> SubscriptionListener for OnDataUpdate<F> {
    fn on_data_update(&self, update: &TableUpdate) {
        (self.0)(update);
    }
}
