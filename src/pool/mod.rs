// ABOUTME: Connection pool with health tracking, circuit breaking and backoff reconnects
// ABOUTME: Owns every transport; callers borrow connections through leases
//
// The slot table, per-slot breakers and lease counts sit behind one
// `std::sync::Mutex` that is never held across an `.await`. Connect, probe and
// close calls run outside the lock; their results are applied afterwards and
// re-checked against the slot's current state.

pub mod circuit_breaker;
pub mod connection;
pub mod health;
pub mod metrics;
pub mod selection;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionState, FrameSender, Inbound};
pub use health::{HealthMonitor, HealthReport};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use selection::LoadBalancing;
pub use transport::{Connector, Transport, TransportError};

use connection::PooledConnection;
use selection::Candidate;

/// Pool errors surfaced to callers.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// No eligible connection became available in time
    #[error("no eligible connection within {0:?}")]
    Exhausted(Duration),

    #[error("connection pool is shut down")]
    Closed,

    /// Opening a new connection failed after every retry
    #[error("connection failure: {0}")]
    Connect(#[from] TransportError),
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Slots not `Closed` (includes `Connecting`)
    pub live: usize,
    pub connecting: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub circuit_open: usize,
    /// Outstanding leases across all connections
    pub leased: usize,
}

// === Pool internals ===

struct Slot {
    id: ConnectionId,
    state: ConnectionState,
    conn: Option<Arc<PooledConnection>>,
    breaker: CircuitBreaker,
    leases: usize,
    connect_failures: u32,
    /// Health probe or half-open reconnect in flight
    probing: bool,
}

struct PoolInner {
    slots: Vec<Slot>,
    cursor: usize,
    closed: bool,
}

impl PoolInner {
    fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_live()).count()
    }

    fn slot_mut(&mut self, id: ConnectionId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.id == id)
    }
}

pub(crate) struct PoolShared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    inner: Mutex<PoolInner>,
    available: Notify,
    metrics: PoolMetrics,
    next_id: AtomicU64,
    monitor: Mutex<Option<HealthMonitor>>,
}

enum AcquireStep {
    Open(ConnectionId),
    Wait,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // Every mutation leaves the table consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn eligible(&self, slot: &Slot) -> bool {
        slot.state.is_selectable()
            && slot.conn.as_ref().is_some_and(|conn| !conn.is_closed())
            && slot.breaker.allows_selection()
            && !slot.probing
            && (self.config.allow_multiplexing || slot.leases == 0)
    }

    fn exhausted(&self) -> PoolError {
        self.metrics.acquire_timed_out();
        warn!(
            timeout_ms = u64::try_from(self.config.acquire_timeout.as_millis()).unwrap_or(u64::MAX),
            "Pool exhausted"
        );
        PoolError::Exhausted(self.config.acquire_timeout)
    }

    /// Retire idle slots whose reader already saw the transport close.
    fn take_dead(inner: &mut PoolInner) -> Vec<Arc<PooledConnection>> {
        let mut dead = Vec::new();
        for slot in &mut inner.slots {
            let closed = slot.conn.as_ref().is_some_and(|conn| conn.is_closed());
            if closed && slot.leases == 0 && !slot.probing && slot.state.is_live() {
                warn!(connection = %slot.id, "Connection lost, retiring slot");
                slot.state = ConnectionState::Closed;
                dead.extend(slot.conn.take());
            }
        }
        dead
    }

    fn lease(self: &Arc<Self>, slot: &mut Slot) -> Option<ConnectionHandle> {
        let conn = Arc::clone(slot.conn.as_ref()?);
        slot.leases += 1;
        self.metrics.acquired();
        debug!(connection = %slot.id, leases = slot.leases, "Connection leased");
        Some(ConnectionHandle::new(slot.id, conn, Arc::downgrade(self)))
    }

    fn select_and_lease(self: &Arc<Self>, inner: &mut PoolInner) -> Option<ConnectionHandle> {
        let candidates: Vec<Candidate> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| self.eligible(slot))
            .map(|(index, slot)| Candidate {
                index,
                leases: slot.leases,
                healthy: slot.state == ConnectionState::Healthy,
            })
            .collect();
        let index = self
            .config
            .load_balancing
            .select(&candidates, &mut inner.cursor)?;
        self.lease(&mut inner.slots[index])
    }

    fn reserve_slot(&self, inner: &mut PoolInner) -> ConnectionId {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        inner.slots.push(Slot {
            id,
            state: ConnectionState::Connecting,
            conn: None,
            breaker: CircuitBreaker::from_config(&self.config.circuit_breaker),
            leases: 0,
            connect_failures: 0,
            probing: false,
        });
        debug!(connection = %id, "Reserved connection slot");
        id
    }

    async fn connect_once(&self) -> Result<Arc<dyn Transport>, TransportError> {
        let timeout = self.config.connect_timeout;
        match tokio::time::timeout(timeout, self.connector.connect(&self.config.uri)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn probe(&self, transport: &Arc<dyn Transport>) -> Result<(), TransportError> {
        let timeout = self.config.probe_timeout;
        match tokio::time::timeout(timeout, transport.probe()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Connect a reserved slot, retrying with backoff. Retires the slot on failure.
    async fn establish(self: Arc<Self>, id: ConnectionId) -> Result<(), PoolError> {
        let retry = self.config.retry;
        let mut attempt = 0u32;
        loop {
            let err = match self.connect_once().await {
                Ok(transport) => return self.install(id, transport).await,
                Err(err) => err,
            };
            self.metrics.connect_failed();

            let give_up = {
                let mut inner = self.lock();
                let closed = inner.closed;
                match inner.slot_mut(id) {
                    Some(slot) => {
                        slot.connect_failures += 1;
                        closed || !retry.should_retry(attempt)
                    }
                    None => true,
                }
            };
            if give_up {
                error!(connection = %id, attempts = attempt + 1, error = %err, "Giving up on connection");
                self.retire(id);
                return Err(PoolError::Connect(err));
            }

            let delay = retry.calculate_delay(attempt);
            warn!(
                connection = %id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Connect failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn install(&self, id: ConnectionId, transport: Arc<dyn Transport>) -> Result<(), PoolError> {
        let conn = PooledConnection::open(id, transport);
        let rejected = {
            let mut inner = self.lock();
            if inner.closed {
                true
            } else if let Some(slot) = inner.slot_mut(id) {
                slot.conn = Some(Arc::clone(&conn));
                slot.state = ConnectionState::Healthy;
                slot.breaker.record_success();
                slot.connect_failures = 0;
                false
            } else {
                true
            }
        };
        if rejected {
            conn.shutdown().await;
            return Err(PoolError::Closed);
        }

        self.metrics.connection_opened();
        info!(connection = %id, "Connection established");
        self.available.notify_waiters();
        Ok(())
    }

    /// Mark a slot `Closed`; the next health cycle removes and replaces it.
    fn retire(&self, id: ConnectionId) {
        let conn = {
            let mut inner = self.lock();
            inner.slot_mut(id).and_then(|slot| {
                slot.state = ConnectionState::Closed;
                slot.conn.take()
            })
        };
        if let Some(conn) = conn {
            close_in_background(conn);
        }
        self.available.notify_waiters();
    }

    /// Called when a lease comes back.
    pub(crate) fn return_lease(&self, id: ConnectionId, failed: bool) {
        let to_close = {
            let mut inner = self.lock();
            let Some(slot) = inner.slot_mut(id) else {
                return;
            };
            slot.leases = slot.leases.saturating_sub(1);
            if failed {
                self.metrics.request_failed();
                record_slot_failure(slot, &self.metrics, "request failure")
            } else {
                debug!(connection = %id, leases = slot.leases, "Connection released");
                None
            }
        };
        if let Some(conn) = to_close {
            close_in_background(conn);
        }
        self.available.notify_waiters();
    }

    /// One health cycle; see [`health`] for the steps.
    pub(crate) async fn check_health(self: &Arc<Self>) -> HealthReport {
        let mut report = HealthReport::default();
        let now = Instant::now();

        let (probes, half_open) = {
            let mut inner = self.lock();
            if inner.closed {
                return report;
            }
            let mut probes = Vec::new();
            let mut half_open = Vec::new();
            for slot in &mut inner.slots {
                if slot.probing {
                    continue;
                }
                match slot.state {
                    ConnectionState::Healthy | ConnectionState::Degraded if slot.leases == 0 => {
                        if let Some(conn) = &slot.conn {
                            slot.probing = true;
                            probes.push((slot.id, Arc::clone(conn)));
                        }
                    }
                    ConnectionState::CircuitOpen if slot.breaker.try_half_open(now) => {
                        slot.state = ConnectionState::Connecting;
                        slot.probing = true;
                        half_open.push(slot.id);
                    }
                    _ => {}
                }
            }
            (probes, half_open)
        };

        // Probe idle connections concurrently.
        let results = join_all(probes.iter().map(|(id, conn)| async move {
            (*id, self.probe(conn.transport()).await)
        }))
        .await;
        report.probed = results.len();

        let mut to_close = Vec::new();
        {
            let mut inner = self.lock();
            for (id, result) in results {
                let Some(slot) = inner.slot_mut(id) else {
                    continue;
                };
                slot.probing = false;
                self.metrics.probe_finished(result.is_ok());
                if !slot.state.is_selectable() {
                    continue;
                }
                match result {
                    Ok(()) => {
                        if slot.state == ConnectionState::Degraded {
                            info!(connection = %id, "Connection recovered");
                        }
                        slot.breaker.record_success();
                        slot.state = ConnectionState::Healthy;
                    }
                    Err(err) => {
                        report.probe_failures += 1;
                        debug!(connection = %id, error = %err, "Probe failed");
                        if let Some(conn) = record_slot_failure(slot, &self.metrics, "probe failure") {
                            report.circuits_opened += 1;
                            to_close.push(conn);
                        }
                    }
                }
            }
        }
        for conn in to_close {
            conn.shutdown().await;
        }

        // Half-open: one reconnect plus probe per cooled-down circuit.
        let outcomes = join_all(half_open.into_iter().map(|id| self.half_open(id))).await;
        for outcome in outcomes {
            match outcome {
                HalfOpenOutcome::Recovered => report.recovered += 1,
                HalfOpenOutcome::Retired => report.retired += 1,
                HalfOpenOutcome::StillOpen | HalfOpenOutcome::Gone => {}
            }
        }

        report.replaced = self.refill().await;
        self.available.notify_waiters();
        report
    }

    async fn half_open(self: &Arc<Self>, id: ConnectionId) -> HalfOpenOutcome {
        let attempt = match self.connect_once().await {
            Ok(transport) => match self.probe(&transport).await {
                Ok(()) => Ok(transport),
                Err(err) => {
                    transport.close().await;
                    Err(err)
                }
            },
            Err(err) => Err(err),
        };

        match attempt {
            Ok(transport) => {
                let conn = PooledConnection::open(id, transport);
                let accepted = {
                    let mut inner = self.lock();
                    let closed = inner.closed;
                    match inner.slot_mut(id) {
                        Some(slot) if !closed => {
                            slot.conn = Some(Arc::clone(&conn));
                            slot.breaker.record_success();
                            slot.state = ConnectionState::Healthy;
                            slot.connect_failures = 0;
                            slot.probing = false;
                            true
                        }
                        _ => false,
                    }
                };
                if !accepted {
                    conn.shutdown().await;
                    return HalfOpenOutcome::Gone;
                }
                self.metrics.connection_opened();
                info!(connection = %id, "Circuit closed after half-open probe");
                HalfOpenOutcome::Recovered
            }
            Err(err) => {
                self.metrics.connect_failed();
                let mut inner = self.lock();
                let Some(slot) = inner.slot_mut(id) else {
                    return HalfOpenOutcome::Gone;
                };
                slot.probing = false;
                slot.breaker.record_failure(Instant::now());
                slot.connect_failures += 1;
                if self.config.retry.should_retry(slot.connect_failures.saturating_sub(1)) {
                    slot.state = ConnectionState::CircuitOpen;
                    warn!(connection = %id, failures = slot.connect_failures, error = %err, "Half-open probe failed, circuit reopened");
                    HalfOpenOutcome::StillOpen
                } else {
                    slot.state = ConnectionState::Closed;
                    error!(connection = %id, failures = slot.connect_failures, error = %err, "Connection retired after repeated reconnect failures");
                    HalfOpenOutcome::Retired
                }
            }
        }
    }

    /// Drop `Closed` slots and open replacements up to `min_connections`.
    async fn refill(self: &Arc<Self>) -> usize {
        let reserved: Vec<ConnectionId> = {
            let mut inner = self.lock();
            if inner.closed {
                return 0;
            }
            inner.slots.retain(|slot| slot.state.is_live());
            let deficit = self.config.min_connections.saturating_sub(inner.live());
            (0..deficit).map(|_| self.reserve_slot(&mut inner)).collect()
        };
        if reserved.is_empty() {
            return 0;
        }
        debug!(count = reserved.len(), "Replacing connections to reach min_connections");
        let results = join_all(reserved.into_iter().map(|id| Arc::clone(self).establish(id))).await;
        results.iter().filter(|r| r.is_ok()).count()
    }
}

enum HalfOpenOutcome {
    Recovered,
    StillOpen,
    Retired,
    Gone,
}

/// Count a failure against the slot's breaker. Returns the connection to
/// close when the circuit opened.
fn record_slot_failure(slot: &mut Slot, metrics: &PoolMetrics, cause: &str) -> Option<Arc<PooledConnection>> {
    if slot.breaker.record_failure(Instant::now()) {
        slot.state = ConnectionState::CircuitOpen;
        metrics.circuit_tripped();
        warn!(
            connection = %slot.id,
            failures = slot.breaker.consecutive_failures(),
            cause,
            "Circuit opened"
        );
        slot.conn.take()
    } else {
        if slot.state == ConnectionState::Healthy {
            slot.state = ConnectionState::Degraded;
        }
        debug!(connection = %slot.id, failures = slot.breaker.consecutive_failures(), cause, "Connection degraded");
        None
    }
}

fn close_in_background(conn: Arc<PooledConnection>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move { conn.shutdown().await });
    }
    // Outside a runtime the reader is cancelled when `conn` drops.
}

// === Public pool ===

/// A bounded set of transport connections shared by the client.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create an empty pool. Call [`Self::start`] to open connections.
    #[must_use]
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                connector,
                inner: Mutex::new(PoolInner {
                    slots: Vec::new(),
                    cursor: 0,
                    closed: false,
                }),
                available: Notify::new(),
                metrics: PoolMetrics::new(),
                next_id: AtomicU64::new(1),
                monitor: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Open `min_connections` and start the health monitor.
    ///
    /// Connections that fail to open are logged and left to the health
    /// cycle to replace.
    pub async fn start(&self) -> Result<(), PoolError> {
        let reserved: Vec<ConnectionId> = {
            let mut inner = self.shared.lock();
            if inner.closed {
                return Err(PoolError::Closed);
            }
            let deficit = self.shared.config.min_connections.saturating_sub(inner.live());
            (0..deficit).map(|_| self.shared.reserve_slot(&mut inner)).collect()
        };

        let results = join_all(
            reserved
                .into_iter()
                .map(|id| Arc::clone(&self.shared).establish(id)),
        )
        .await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(failed, "Some initial connections failed to open");
        }

        let mut monitor = HealthMonitor::new(self.shared.config.health_check_interval);
        monitor.start(Arc::downgrade(&self.shared));
        let previous = self
            .shared
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(monitor);
        if let Some(mut previous) = previous {
            previous.stop().await;
        }

        info!(
            uri = %self.shared.config.uri,
            min = self.shared.config.min_connections,
            max = self.shared.config.max_connections,
            "Connection pool started"
        );
        Ok(())
    }

    /// Lease a connection, opening one if the pool is below `max_connections`.
    ///
    /// Waits up to `acquire_timeout` for a lease to come back when the pool
    /// is full, then fails with [`PoolError::Exhausted`].
    pub async fn acquire(&self) -> Result<ConnectionHandle, PoolError> {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.acquire_timeout;

        loop {
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, dead) = {
                let mut inner = shared.lock();
                if inner.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(handle) = shared.select_and_lease(&mut inner) {
                    return Ok(handle);
                }
                let dead = PoolShared::take_dead(&mut inner);
                let step = if inner.live() < shared.config.max_connections {
                    AcquireStep::Open(shared.reserve_slot(&mut inner))
                } else {
                    AcquireStep::Wait
                };
                (step, dead)
            };
            for conn in dead {
                close_in_background(conn);
            }

            match step {
                AcquireStep::Open(id) => {
                    // Spawned so the slot settles even if this caller stops waiting.
                    let opener = Arc::clone(shared);
                    let connecting = tokio::spawn(opener.establish(id));
                    let Ok(joined) = tokio::time::timeout_at(deadline, connecting).await else {
                        debug!(connection = %id, "Acquire deadline passed while connecting");
                        return Err(shared.exhausted());
                    };
                    match joined {
                        Ok(Ok(())) => {
                            let mut inner = shared.lock();
                            if let Some(slot) = inner.slot_mut(id) {
                                if shared.eligible(slot) {
                                    if let Some(handle) = shared.lease(slot) {
                                        return Ok(handle);
                                    }
                                }
                            }
                        }
                        Ok(Err(err)) => return Err(err),
                        Err(join_err) => {
                            return Err(PoolError::Connect(TransportError::Connect {
                                uri: shared.config.uri.clone(),
                                reason: join_err.to_string(),
                            }))
                        }
                    }
                }
                AcquireStep::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(shared.exhausted());
                    }
                }
            }
        }
    }

    /// Return a lease after successful use.
    pub fn release(&self, handle: ConnectionHandle) {
        handle.finish(false);
    }

    /// Return a lease whose request failed; counts against the circuit breaker.
    pub fn report_failure(&self, handle: ConnectionHandle) {
        handle.finish(true);
    }

    /// Run one health cycle now.
    pub async fn check_health(&self) -> HealthReport {
        self.shared.check_health().await
    }

    /// Stop the monitor, close every connection and fail pending acquires.
    pub async fn shutdown(&self) {
        let monitor = self
            .shared
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut monitor) = monitor {
            monitor.stop().await;
        }

        let conns: Vec<Arc<PooledConnection>> = {
            let mut inner = self.shared.lock();
            inner.closed = true;
            inner.slots.drain(..).filter_map(|slot| slot.conn).collect()
        };
        for conn in conns {
            conn.shutdown().await;
        }
        self.shared.available.notify_waiters();
        info!("Connection pool shut down");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Current state of one connection, if the slot still exists.
    #[must_use]
    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.shared.lock().slot_mut(id).map(|slot| slot.state)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.lock();
        let mut stats = PoolStats::default();
        for slot in &inner.slots {
            match slot.state {
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Healthy => stats.healthy += 1,
                ConnectionState::Degraded => stats.degraded += 1,
                ConnectionState::CircuitOpen => stats.circuit_open += 1,
                ConnectionState::Closed => {}
            }
            stats.leased += slot.leases;
        }
        stats.live = inner.live();
        stats
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("uri", &self.shared.config.uri)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
