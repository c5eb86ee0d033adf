// ABOUTME: Metrics for the connection pool
//
// Tracks:
// - Connections: opened, connect failures
// - Acquisitions: granted, timed out
// - Health: probes, probe failures, circuit breaker trips

use std::sync::atomic::{AtomicU64, Ordering};

/// Pool-level counters, updated without taking the pool lock
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub connections_opened: AtomicU64,
    pub connect_failures: AtomicU64,
    pub acquisitions: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    pub probes: AtomicU64,
    pub probe_failures: AtomicU64,
    pub request_failures: AtomicU64,
    pub circuit_trips: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connect_failures: u64,
    pub acquisitions: u64,
    pub acquire_timeouts: u64,
    pub probes: u64,
    pub probe_failures: u64,
    pub request_failures: u64,
    pub circuit_trips: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        bump(&self.connections_opened);
    }

    pub fn connect_failed(&self) {
        bump(&self.connect_failures);
    }

    pub fn acquired(&self) {
        bump(&self.acquisitions);
    }

    pub fn acquire_timed_out(&self) {
        bump(&self.acquire_timeouts);
    }

    pub fn probe_finished(&self, ok: bool) {
        bump(&self.probes);
        if !ok {
            bump(&self.probe_failures);
        }
    }

    pub fn request_failed(&self) {
        bump(&self.request_failures);
    }

    pub fn circuit_tripped(&self) {
        bump(&self.circuit_trips);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PoolMetrics::new();
        metrics.connection_opened();
        metrics.probe_finished(true);
        metrics.probe_finished(false);
        metrics.circuit_tripped();

        let snap = metrics.snapshot();
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.probes, 2);
        assert_eq!(snap.probe_failures, 1);
        assert_eq!(snap.circuit_trips, 1);
        assert_eq!(snap.acquisitions, 0);
    }
}
