// ABOUTME: Request id allocation and correlation for outstanding operations
// ABOUTME: Ids increase strictly, wrap past u32::MAX, and never collide while outstanding

//! Request id tracking.
//!
//! Every outbound frame that expects an acknowledgment carries a
//! [`RequestId`] issued here. The id stays reserved until the response
//! arrives, the operation is cancelled, or [`RequestTracker::expire_overdue`]
//! retires it after its timeout.
//!
//! # Thread Safety
//!
//! A single `std::sync::Mutex` guards the counter and the pending table, so
//! `issue`, `complete` and `pending_count` are atomic with respect to each
//! other. The lock is never held across an `.await`.
//!
//! An [`ExpirySweeper`] calls `expire_overdue` on a timer so ids whose reply
//! never arrives do not stay reserved forever.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::RequestId;

/// Bookkeeping for one outstanding request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// When the id was issued.
    pub issued_at: Instant,
    /// How long to wait before the expiry sweep retires it.
    pub timeout: Duration,
}

impl PendingRequest {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() > self.timeout
    }
}

#[derive(Debug)]
struct TrackerInner {
    next: u32,
    pending: HashMap<RequestId, PendingRequest>,
}

/// Allocates request ids and tracks which ones are still outstanding.
#[derive(Debug)]
pub struct RequestTracker {
    inner: Mutex<TrackerInner>,
    default_timeout: Duration,
}

impl RequestTracker {
    /// Tracker whose ids expire after `default_timeout` unless completed.
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                next: 1,
                pending: HashMap::new(),
            }),
            default_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        // The table stays consistent even if a holder panicked mid-call.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id that is not currently outstanding.
    pub fn issue(&self) -> RequestId {
        self.issue_with_timeout(self.default_timeout)
    }

    /// Allocate a fresh id with a custom expiry.
    ///
    /// Skips 0 and any id still pending after wraparound. With every one of
    /// the 2^32-1 ids outstanding this would spin, which the pending table
    /// cannot reach in practice.
    pub fn issue_with_timeout(&self, timeout: Duration) -> RequestId {
        let mut inner = self.lock();
        loop {
            let candidate = RequestId::new(inner.next);
            inner.next = match inner.next.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !inner.pending.contains_key(&candidate) {
                inner.pending.insert(
                    candidate,
                    PendingRequest {
                        issued_at: Instant::now(),
                        timeout,
                    },
                );
                debug!(request_id = %candidate, "Issued request id");
                return candidate;
            }
        }
    }

    /// Retire an id. Returns false (and logs) for unknown or already retired ids.
    pub fn complete(&self, id: RequestId) -> bool {
        let removed = self.lock().pending.remove(&id).is_some();
        if removed {
            debug!(request_id = %id, "Completed request");
        } else {
            warn!(request_id = %id, "Completion for unknown or retired request id");
        }
        removed
    }

    /// Number of ids currently outstanding.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.lock().pending.contains_key(&id)
    }

    /// Age of the longest-waiting request, if any.
    pub fn oldest_pending_age(&self) -> Option<Duration> {
        self.lock()
            .pending
            .values()
            .map(|p| p.issued_at.elapsed())
            .max()
    }

    /// Retire every request past its timeout and return their ids (sorted).
    pub fn expire_overdue(&self) -> Vec<RequestId> {
        let mut inner = self.lock();
        let mut expired: Vec<RequestId> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.is_expired())
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            inner.pending.remove(id);
        }
        drop(inner);

        expired.sort_unstable();
        if !expired.is_empty() {
            warn!(count = expired.len(), "Expired overdue requests");
        }
        expired
    }

    #[cfg(test)]
    fn set_next(&self, next: u32) {
        self.lock().next = next;
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

// === Expiry Sweeper ===

/// Background task that retires overdue request ids every `period`.
///
/// Holds only a weak reference to the tracker and exits once it is dropped.
pub struct ExpirySweeper {
    period: Duration,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirySweeper {
    /// Sweeper running twice per timeout so an id outlives its timeout by
    /// at most half of it.
    #[must_use]
    pub fn for_timeout(timeout: Duration) -> Self {
        Self::new((timeout / 2).max(Duration::from_millis(1)))
    }

    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Start sweeping `tracker`. A second call while running is a no-op.
    pub fn start(&self, tracker: Weak<RequestTracker>) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let cancel = self.cancel.clone();
        let period = self.period;
        *handle = Some(tokio::spawn(async move {
            Self::sweep_loop(tracker, period, cancel).await;
        }));
        debug!(period_ms = %self.period.as_millis(), "Request expiry sweep started");
    }

    /// Signal the loop to stop and wait for it (bounded).
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Request expiry sweep did not stop within 5s");
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        handle.as_ref().is_some_and(|h| !h.is_finished()) && !self.cancel.is_cancelled()
    }

    async fn sweep_loop(tracker: Weak<RequestTracker>, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(tracker) = tracker.upgrade() else {
                        debug!("Request tracker dropped, expiry sweep exiting");
                        break;
                    };
                    for id in tracker.expire_overdue() {
                        warn!(request_id = %id, "Request expired without a reply");
                    }
                }
            }
        }
        info!("Request expiry sweep stopped");
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
