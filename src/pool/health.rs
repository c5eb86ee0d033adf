// ABOUTME: Background health monitor driving periodic pool health cycles
// ABOUTME: Probes idle connections, half-opens cooled-down circuits, refills to min_connections

//! Health monitoring for the connection pool.
//!
//! The `HealthMonitor` runs as a background task that calls
//! [`super::ConnectionPool::check_health`] every `health_check_interval`.
//! One cycle:
//! - probes idle `Healthy`/`Degraded` connections (leased ones are skipped)
//! - reconnects `CircuitOpen` connections whose cooldown elapsed (half-open)
//! - drops `Closed` slots and opens replacements up to `min_connections`
//!
//! The task holds only a weak reference to the pool, so it exits on its own
//! once the pool is dropped.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::PoolShared;

// === Health Report ===

/// Outcome of one health cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Idle connections probed
    pub probed: usize,
    /// Probes that failed
    pub probe_failures: usize,
    /// Circuits opened by this cycle's failures
    pub circuits_opened: usize,
    /// Half-open reconnects that succeeded
    pub recovered: usize,
    /// Slots given up on and marked `Closed`
    pub retired: usize,
    /// Replacement connections opened to restore `min_connections`
    pub replaced: usize,
}

impl HealthReport {
    /// True when nothing went wrong this cycle.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.probe_failures == 0 && self.circuits_opened == 0 && self.retired == 0
    }
}

// === Health Monitor ===

/// Periodic driver for pool health cycles.
pub struct HealthMonitor {
    interval: Duration,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Start the background loop for `pool`.
    pub(crate) fn start(&mut self, pool: Weak<PoolShared>) {
        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let period = self.interval;

        let handle = tokio::spawn(async move {
            Self::health_check_loop(pool, period, cancel).await;
        });

        self.handle = Some(handle);
        info!(interval_ms = %self.interval.as_millis(), "Health monitor started");
    }

    /// Signal the loop to stop and wait for it (bounded).
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("Health monitor did not stop within 5s");
            }
        }

        info!("Health monitor stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished()) && !self.cancel.is_cancelled()
    }

    async fn health_check_loop(pool: Weak<PoolShared>, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(shared) = pool.upgrade() else {
                        debug!("Pool dropped, health monitor exiting");
                        break;
                    };
                    let report = shared.check_health().await;
                    if report.is_clean() {
                        debug!(probed = report.probed, replaced = report.replaced, "Health cycle complete");
                    } else {
                        warn!(
                            probed = report.probed,
                            probe_failures = report.probe_failures,
                            circuits_opened = report.circuits_opened,
                            retired = report.retired,
                            "Health cycle found failures"
                        );
                    }
                }
            }
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_clean() {
        assert!(HealthReport::default().is_clean());
        let report = HealthReport {
            probe_failures: 1,
            ..HealthReport::default()
        };
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_monitor_exits_when_pool_gone() {
        let mut monitor = HealthMonitor::new(Duration::from_millis(10));
        monitor.start(Weak::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!monitor.is_running());
        monitor.stop().await;
    }
}
