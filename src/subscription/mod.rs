// ABOUTME: Subscription engine - drives one subscription through its lifecycle
// ABOUTME: Correlates acknowledgments by request id, retries failed attempts with backoff
//
// Each subscription owns a `std::sync::Mutex` over its state and never holds
// it across an `.await`. Listener calls are queued while locked, in the order
// the state changed, and a single caller at a time drains the queue after the
// lock is dropped. Every attempt carries an epoch; receivers and retry timers
// started for an old epoch find it moved on and do nothing.

pub mod callbacks;
pub mod state;
pub mod strategy;
pub mod validation;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionHandle, ConnectionId, ConnectionPool, FrameSender, Inbound, PoolError};
use crate::protocol::{ClientMessage, QueryId, RequestId, ServerMessage, SubscriptionError, TableUpdate};
use crate::request_tracker::RequestTracker;
use crate::retry::RetryPolicy;

pub use callbacks::{AppliedInfo, CallbackId, FailureKind, SubscriptionFailure, SubscriptionListener};
pub use state::SubscriptionState;
pub use strategy::{choose_strategy, SubscriptionStrategy};
pub use validation::{validate, ValidationError, ValidationErrorKind};

use callbacks::{OnApplied, OnDataUpdate, OnError, OnStateChange, OnSubscriptionApplied};

// === Engine context ===

/// Collaborators shared by every subscription of one client.
pub(crate) struct EngineContext {
    pub(crate) pool: ConnectionPool,
    pub(crate) tracker: Arc<RequestTracker>,
    pub(crate) retry: RetryPolicy,
    pub(crate) strategy_override: Option<SubscriptionStrategy>,
    pub(crate) multi_query_threshold: usize,
    pub(crate) subscribe_timeout: Duration,
}

impl EngineContext {
    pub(crate) fn new(config: &ClientConfig, pool: ConnectionPool, tracker: Arc<RequestTracker>) -> Self {
        Self {
            pool,
            tracker,
            retry: config.retry,
            strategy_override: config.subscription_strategy_override,
            multi_query_threshold: config.multi_query_threshold,
            subscribe_timeout: config.subscribe_timeout,
        }
    }
}

// === Metrics ===

/// Counters and timestamps for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionMetrics {
    pub created_at: DateTime<Utc>,
    /// Most recent transition into `Active`
    pub applied_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub query_count: usize,
    pub error_count: u32,
    /// Retries scheduled over the subscription's whole life
    pub retry_count: u32,
    pub data_updates: u64,
}

impl SubscriptionMetrics {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            applied_at: None,
            last_update_at: None,
            query_count: 0,
            error_count: 0,
            retry_count: 0,
            data_updates: 0,
        }
    }

    /// Time from creation until the subscription was last applied.
    #[must_use]
    pub fn time_to_apply(&self) -> Option<chrono::Duration> {
        self.applied_at.map(|at| at - self.created_at)
    }
}

// === Internals ===

enum Notification {
    StateChange(SubscriptionState, String),
    Applied(AppliedInfo),
    Error(SubscriptionFailure),
    DataUpdate(Vec<TableUpdate>),
}

enum Flow {
    Continue,
    Applied,
    Stop,
}

/// Everything a started attempt needs once the lock is released.
struct Attempt {
    frames: Vec<Vec<u8>>,
    sender: FrameSender,
    inbound: broadcast::Receiver<Inbound>,
    cancel: CancellationToken,
    deadline: Instant,
}

struct Inner {
    state: SubscriptionState,
    queries: Vec<String>,
    query_id: Option<QueryId>,
    strategy: Option<SubscriptionStrategy>,
    strategy_override: Option<SubscriptionStrategy>,
    /// Unacknowledged requests of the current attempt, with their query index
    /// under the single-query strategy
    pending: HashMap<RequestId, Option<usize>>,
    applied_tables: Vec<String>,
    host_execution_micros: u64,
    /// Retries spent since the last successful apply
    retry_count: u32,
    connection: Option<ConnectionHandle>,
    errors: Vec<SubscriptionFailure>,
    epoch: u64,
    attempt: CancellationToken,
    /// An explicit `subscribe` is waiting for its connection
    starting: bool,
    /// Listener calls not yet delivered, oldest first
    outbox: VecDeque<Notification>,
    /// Some caller is draining `outbox`
    delivering: bool,
    metrics: SubscriptionMetrics,
    last_transition_at: DateTime<Utc>,
}

struct Shared {
    id: Uuid,
    ctx: Arc<EngineContext>,
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<(CallbackId, Arc<dyn SubscriptionListener>)>>,
    state_tx: watch::Sender<SubscriptionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        inner: &mut Inner,
        to: SubscriptionState,
        reason: impl Into<String>,
    ) -> bool {
        let from = inner.state;
        if !from.can_transition_to(to) {
            warn!(subscription = %self.id, %from, %to, "Ignoring invalid state transition");
            return false;
        }
        let reason = reason.into();
        inner.state = to;
        inner.last_transition_at = Utc::now();
        self.state_tx.send_replace(to);
        info!(subscription = %self.id, %from, %to, reason = %reason, "Subscription state changed");
        inner.outbox.push_back(Notification::StateChange(to, reason));
        true
    }

    /// Invalidate the running attempt and start a fresh epoch.
    fn next_epoch(inner: &mut Inner) -> (u64, CancellationToken) {
        inner.attempt.cancel();
        inner.attempt = CancellationToken::new();
        inner.epoch += 1;
        (inner.epoch, inner.attempt.clone())
    }

    fn abandon_pending(&self, inner: &mut Inner) {
        for (request_id, _) in inner.pending.drain() {
            self.ctx.tracker.complete(request_id);
        }
    }

    /// Deliver queued notifications in order. A call made while another
    /// caller is delivering (including from inside a listener) only queues;
    /// the running delivery picks its notes up after the ones before them.
    fn deliver(&self) {
        {
            let mut inner = self.lock();
            if inner.delivering || inner.outbox.is_empty() {
                return;
            }
            inner.delivering = true;
        }
        loop {
            let note = {
                let mut inner = self.lock();
                match inner.outbox.pop_front() {
                    Some(note) => note,
                    None => {
                        inner.delivering = false;
                        return;
                    }
                }
            };
            self.dispatch(&note);
        }
    }

    fn dispatch(&self, note: &Notification) {
        let listeners: Vec<Arc<dyn SubscriptionListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        if listeners.is_empty() {
            return;
        }

        match note {
            Notification::StateChange(state, reason) => {
                self.each(&listeners, "on_state_change", |l| l.on_state_change(*state, reason));
            }
            Notification::Applied(applied) => {
                self.each(&listeners, "on_applied", |l| l.on_applied());
                self.each(&listeners, "on_subscription_applied", |l| {
                    l.on_subscription_applied(applied);
                });
            }
            Notification::Error(failure) => self.each(&listeners, "on_error", |l| l.on_error(failure)),
            Notification::DataUpdate(tables) => {
                for table in tables {
                    self.each(&listeners, "on_data_update", |l| l.on_data_update(table));
                }
            }
        }
    }

    fn each(
        &self,
        listeners: &[Arc<dyn SubscriptionListener>],
        callback: &'static str,
        call: impl Fn(&dyn SubscriptionListener),
    ) {
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))).is_err() {
                error!(subscription = %self.id, callback, "Subscription listener panicked");
            }
        }
    }

    // === Attempts ===

    /// Build the subscribe frames for the current attempt and park the lease.
    fn prepare_attempt(&self, inner: &mut Inner, handle: ConnectionHandle) -> Result<Attempt, String> {
        let inbound = handle.frames();
        let sender = handle.sender();
        inner.connection = Some(handle);
        inner.applied_tables.clear();
        inner.host_execution_micros = 0;

        let query_id = inner.query_id.unwrap_or_else(QueryId::next);
        inner.query_id = Some(query_id);
        let strategy = inner.strategy.unwrap_or(SubscriptionStrategy::SingleQuery);

        let mut messages = Vec::new();
        match strategy {
            SubscriptionStrategy::SingleQuery => {
                for (index, query) in inner.queries.iter().enumerate() {
                    let request_id = self.ctx.tracker.issue();
                    inner.pending.insert(request_id, Some(index));
                    messages.push(ClientMessage::SubscribeSingle {
                        query: query.clone(),
                        request_id,
                        query_id,
                    });
                }
            }
            SubscriptionStrategy::MultiQuery => {
                let request_id = self.ctx.tracker.issue();
                inner.pending.insert(request_id, None);
                messages.push(ClientMessage::SubscribeMulti {
                    query_strings: inner.queries.clone(),
                    request_id,
                    query_id,
                });
            }
        }

        let frames = messages
            .iter()
            .map(ClientMessage::encode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("could not encode subscribe request: {err}"))?;

        Ok(Attempt {
            frames,
            sender,
            inbound,
            cancel: inner.attempt.clone(),
            deadline: Instant::now() + self.ctx.subscribe_timeout,
        })
    }

    /// Run attempt `epoch` with the lease the pool handed out. Returns false
    /// when a `cancel` moved the subscription on before the attempt began.
    async fn start_attempt(self: &Arc<Self>, epoch: u64, lease: Result<ConnectionHandle, PoolError>) -> bool {
        let prepared = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                drop(inner);
                debug!(subscription = %self.id, "Attempt superseded before it started");
                if let Ok(handle) = lease {
                    self.ctx.pool.release(handle);
                }
                return false;
            }
            inner.starting = false;

            let reason = if inner.state == SubscriptionState::Retrying {
                format!("retry {} of {}", inner.retry_count, self.ctx.retry.max_retries)
            } else {
                "subscribe requested".to_string()
            };
            self.transition(&mut inner, SubscriptionState::Pending, reason);

            match lease {
                Ok(handle) => self
                    .prepare_attempt(&mut inner, handle)
                    .map_err(|message| SubscriptionFailure::new(FailureKind::Protocol, message)),
                Err(err) => Err(SubscriptionFailure::new(FailureKind::Connection, err.to_string())),
            }
        };
        self.deliver();

        let attempt = match prepared {
            Ok(attempt) => attempt,
            Err(failure) => {
                self.fail(epoch, failure);
                return true;
            }
        };

        if attempt.sender.is_closed() {
            self.fail(
                epoch,
                SubscriptionFailure::new(FailureKind::Connection, "connection closed before subscribe"),
            );
            return true;
        }

        tokio::spawn(Arc::clone(self).receive_loop(
            epoch,
            attempt.inbound,
            attempt.cancel.clone(),
            attempt.deadline,
        ));

        for frame in attempt.frames {
            if attempt.cancel.is_cancelled() {
                return true;
            }
            if let Err(err) = attempt.sender.send(frame).await {
                self.fail(
                    epoch,
                    SubscriptionFailure::new(FailureKind::Connection, format!("send failed: {err}")),
                );
                return true;
            }
        }
        debug!(subscription = %self.id, connection = %attempt.sender.id(), "Subscribe request sent");
        true
    }

    async fn receive_loop(
        self: Arc<Self>,
        epoch: u64,
        mut inbound: broadcast::Receiver<Inbound>,
        cancel: CancellationToken,
        deadline: Instant,
    ) {
        let ack_timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(ack_timeout);
        let mut applied = false;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = &mut ack_timeout, if !applied => {
                    let message = format!(
                        "not acknowledged within {} ms",
                        self.ctx.subscribe_timeout.as_millis()
                    );
                    self.fail(epoch, SubscriptionFailure::new(FailureKind::Timeout, message));
                    return;
                }
                received = inbound.recv() => match received {
                    Ok(Inbound::Frame(bytes)) => match ServerMessage::decode(&bytes) {
                        Ok(message) => match self.handle_message(epoch, message) {
                            Flow::Continue => {}
                            Flow::Applied => applied = true,
                            Flow::Stop => return,
                        },
                        Err(err) => warn!(subscription = %self.id, error = %err, "Dropping undecodable frame"),
                    },
                    Ok(Inbound::Closed(err)) => {
                        self.fail(epoch, SubscriptionFailure::new(FailureKind::Connection, format!("connection lost: {err}")));
                        return;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let message = format!("fell behind the connection by {skipped} frames");
                        self.fail(epoch, SubscriptionFailure::new(FailureKind::Connection, message));
                        return;
                    }
                    Err(RecvError::Closed) => {
                        self.fail(epoch, SubscriptionFailure::new(FailureKind::Connection, "connection closed"));
                        return;
                    }
                }
            }
        }
    }

    fn handle_message(self: &Arc<Self>, epoch: u64, message: ServerMessage) -> Flow {
        let outcome = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return Flow::Stop;
            }
            match message {
                ServerMessage::SubscribeApplied {
                    request_id,
                    total_host_execution_duration_micros,
                    table_name,
                    ..
                } => Ok(self.acknowledge(
                    &mut inner,
                    request_id,
                    total_host_execution_duration_micros,
                    Some(table_name),
                )),
                ServerMessage::SubscribeMultiApplied {
                    request_id,
                    total_host_execution_duration_micros,
                    ..
                } => Ok(self.acknowledge(
                    &mut inner,
                    request_id,
                    total_host_execution_duration_micros,
                    None,
                )),
                ServerMessage::SubscriptionError(err) => match correlate(&inner, &err) {
                    Some(query_index) => Err(SubscriptionFailure::from_server(&err, query_index)),
                    None => Ok(Flow::Continue),
                },
                ServerMessage::TransactionUpdate { tables } => {
                    if inner.state == SubscriptionState::Active {
                        inner.metrics.data_updates += 1;
                        inner.metrics.last_update_at = Some(Utc::now());
                        inner.outbox.push_back(Notification::DataUpdate(tables));
                    }
                    Ok(Flow::Continue)
                }
                ServerMessage::UnsubscribeApplied { .. } | ServerMessage::Unknown(_) => Ok(Flow::Continue),
            }
        };
        self.deliver();

        match outcome {
            Ok(flow) => flow,
            Err(failure) => {
                self.fail(epoch, failure);
                Flow::Stop
            }
        }
    }

    fn acknowledge(
        &self,
        inner: &mut Inner,
        request_id: RequestId,
        micros: u64,
        table: Option<String>,
    ) -> Flow {
        // another subscription's request on a shared connection
        if inner.pending.remove(&request_id).is_none() {
            return Flow::Continue;
        }
        self.ctx.tracker.complete(request_id);
        inner.host_execution_micros = inner.host_execution_micros.saturating_add(micros);
        inner.applied_tables.extend(table);
        debug!(
            subscription = %self.id,
            request_id = %request_id,
            remaining = inner.pending.len(),
            "Subscribe acknowledged"
        );

        if !inner.pending.is_empty() || inner.state != SubscriptionState::Pending {
            return Flow::Continue;
        }

        inner.retry_count = 0;
        inner.metrics.applied_at = Some(Utc::now());
        self.transition(inner, SubscriptionState::Active, "Subscription successfully applied");
        if let Some(query_id) = inner.query_id {
            inner.outbox.push_back(Notification::Applied(AppliedInfo {
                query_id,
                strategy: inner.strategy.unwrap_or(SubscriptionStrategy::SingleQuery),
                tables: inner.applied_tables.clone(),
                host_execution_micros: inner.host_execution_micros,
            }));
        }
        Flow::Applied
    }

    /// Record a failed attempt, then schedule a retry or stay in `Error`.
    fn fail(self: &Arc<Self>, epoch: u64, mut failure: SubscriptionFailure) {
        let retry = {
            let mut inner = self.lock();
            if inner.epoch != epoch
                || !matches!(inner.state, SubscriptionState::Pending | SubscriptionState::Active)
            {
                debug!(subscription = %self.id, error = %failure.message, "Ignoring failure from a finished attempt");
                return;
            }

            let (next_epoch, cancel) = Self::next_epoch(&mut inner);
            self.abandon_pending(&mut inner);
            if let Some(handle) = inner.connection.take() {
                if failure.kind == FailureKind::Protocol {
                    self.ctx.pool.release(handle);
                } else {
                    self.ctx.pool.report_failure(handle);
                }
            }

            failure.retry_count = inner.retry_count;
            failure.query_id = inner.query_id;
            inner.metrics.error_count += 1;
            inner.errors.push(failure.clone());
            warn!(
                subscription = %self.id,
                kind = %failure.kind,
                retry_count = inner.retry_count,
                error = %failure.message,
                "Subscription attempt failed"
            );

            self.transition(&mut inner, SubscriptionState::Error, failure.message.clone());
            inner.outbox.push_back(Notification::Error(failure));

            if self.ctx.retry.should_retry(inner.retry_count) {
                let delay = self.ctx.retry.calculate_delay(inner.retry_count);
                inner.retry_count += 1;
                inner.metrics.retry_count += 1;
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let reason = format!("retry {} scheduled in {delay_ms} ms", inner.retry_count);
                self.transition(&mut inner, SubscriptionState::Retrying, reason);
                info!(subscription = %self.id, attempt = inner.retry_count, delay_ms, "Retry scheduled");
                Some((next_epoch, cancel, delay))
            } else {
                error!(subscription = %self.id, retries = inner.retry_count, "Retries exhausted, subscription failed");
                None
            }
        };
        self.deliver();

        if let Some((epoch, cancel, delay)) = retry {
            tokio::spawn(Arc::clone(self).retry_after(epoch, cancel, delay));
        }
    }

    async fn retry_after(self: Arc<Self>, epoch: u64, cancel: CancellationToken, delay: Duration) {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        {
            let inner = self.lock();
            if inner.epoch != epoch || inner.state != SubscriptionState::Retrying {
                return;
            }
        }
        let lease = self.ctx.pool.acquire().await;
        self.start_attempt(epoch, lease).await;
    }
}

/// Whether a server error belongs to this subscription, and which query it names.
fn correlate(inner: &Inner, err: &SubscriptionError) -> Option<Option<usize>> {
    if let Some(index) = err.request_id.and_then(|id| inner.pending.get(&id)) {
        return Some(*index);
    }
    match (err.query_id, inner.query_id) {
        (Some(theirs), Some(ours)) if theirs == ours => Some(None),
        _ => None,
    }
}

// === Subscription ===

/// Handle to one subscription. Clones share the same subscription.
///
/// Dropping the handles does not stop an active subscription; call
/// [`Self::cancel`] or [`Self::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    shared: Arc<Shared>,
}

impl Subscription {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        let (state_tx, _) = watch::channel(SubscriptionState::Idle);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                ctx,
                inner: Mutex::new(Inner {
                    state: SubscriptionState::Idle,
                    queries: Vec::new(),
                    query_id: None,
                    strategy: None,
                    strategy_override: None,
                    pending: HashMap::new(),
                    applied_tables: Vec::new(),
                    host_execution_micros: 0,
                    retry_count: 0,
                    connection: None,
                    errors: Vec::new(),
                    epoch: 0,
                    attempt: CancellationToken::new(),
                    starting: false,
                    outbox: VecDeque::new(),
                    delivering: false,
                    metrics: SubscriptionMetrics::new(),
                    last_transition_at: Utc::now(),
                }),
                listeners: Mutex::new(Vec::new()),
                state_tx,
            }),
        }
    }

    /// Validate `queries`, lease a connection and send the subscribe request.
    ///
    /// Returns once the request is on the wire; the acknowledgment arrives
    /// through the listeners. Validation, encoding and pool exhaustion errors
    /// are returned here and leave the state unchanged. Connection and server
    /// failures go through the retry path instead. A `cancel` that lands while
    /// this call waits for a connection makes it return `InvalidState` with
    /// nothing sent.
    pub async fn subscribe<I, S>(&self, queries: I) -> ClientResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let queries: Vec<String> = queries.into_iter().map(Into::into).collect();
        let errors = validate(&queries);
        if !errors.is_empty() {
            return Err(ClientError::Validation(errors));
        }

        let shared = &self.shared;
        let epoch = {
            let mut inner = shared.lock();
            if !inner.state.can_subscribe() || inner.starting {
                return Err(ClientError::InvalidState {
                    operation: "subscribe",
                    state: inner.state,
                });
            }

            let strategy = choose_strategy(
                queries.len(),
                shared.ctx.multi_query_threshold,
                inner.strategy_override.or(shared.ctx.strategy_override),
            );
            let query_id = QueryId::next();
            check_encodable(&queries, strategy, query_id)?;

            debug!(
                subscription = %shared.id,
                queries = queries.len(),
                %strategy,
                query_id = %query_id,
                "Subscribing"
            );
            inner.metrics.query_count = queries.len();
            inner.queries = queries;
            inner.strategy = Some(strategy);
            inner.query_id = Some(query_id);
            inner.retry_count = 0;
            inner.starting = true;
            Shared::next_epoch(&mut inner).0
        };

        match shared.ctx.pool.acquire().await {
            Err(err @ (PoolError::Exhausted(_) | PoolError::Closed)) => {
                let mut inner = shared.lock();
                if inner.epoch == epoch {
                    inner.starting = false;
                }
                Err(err.into())
            }
            lease => {
                if shared.start_attempt(epoch, lease).await {
                    Ok(())
                } else {
                    Err(ClientError::InvalidState {
                        operation: "subscribe",
                        state: shared.lock().state,
                    })
                }
            }
        }
    }

    /// Stop the subscription: release its connection and drop any pending
    /// retry. Returns false if there was nothing to cancel.
    pub fn cancel(&self) -> bool {
        let shared = &self.shared;
        let handle = {
            let mut inner = shared.lock();
            if !inner.state.can_transition_to(SubscriptionState::Cancelled) {
                return false;
            }
            Shared::next_epoch(&mut inner);
            inner.starting = false;
            shared.abandon_pending(&mut inner);
            shared.transition(&mut inner, SubscriptionState::Cancelled, "cancelled by caller");
            inner.connection.take()
        };
        if let Some(handle) = handle {
            shared.ctx.pool.release(handle);
        }
        shared.deliver();
        true
    }

    /// Tell the server to drop the subscription, then cancel locally.
    ///
    /// The unsubscribe frame is best effort; a send failure is logged.
    pub async fn unsubscribe(&self) -> ClientResult<()> {
        let target = {
            let inner = self.shared.lock();
            match (inner.state, inner.connection.as_ref(), inner.query_id) {
                (SubscriptionState::Pending | SubscriptionState::Active, Some(handle), Some(query_id)) => {
                    Some((handle.sender(), query_id))
                }
                _ => None,
            }
        };

        if let Some((sender, query_id)) = target {
            let tracker = &self.shared.ctx.tracker;
            let request_id = tracker.issue();
            let frame = ClientMessage::UnsubscribeMulti { request_id, query_id }.encode();
            let sent = match frame {
                Ok(frame) => sender.send(frame).await,
                Err(err) => {
                    tracker.complete(request_id);
                    return Err(err.into());
                }
            };
            tracker.complete(request_id);
            if let Err(err) = sent {
                warn!(subscription = %self.shared.id, error = %err, "Unsubscribe request not delivered");
            }
        }

        self.cancel();
        Ok(())
    }

    // === Listeners ===

    /// Register a listener; it sees every later event.
    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) -> CallbackId {
        let id = CallbackId::next();
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unregister a listener. Returns false for an unknown id.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut listeners = self.shared.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn on_applied(&self, callback: impl Fn() + Send + Sync + 'static) -> CallbackId {
        self.add_listener(Arc::new(OnApplied(callback)))
    }

    pub fn on_subscription_applied(&self, callback: impl Fn(&AppliedInfo) + Send + Sync + 'static) -> CallbackId {
        self.add_listener(Arc::new(OnSubscriptionApplied(callback)))
    }

    pub fn on_error(&self, callback: impl Fn(&SubscriptionFailure) + Send + Sync + 'static) -> CallbackId {
        self.add_listener(Arc::new(OnError(callback)))
    }

    pub fn on_state_change(
        &self,
        callback: impl Fn(SubscriptionState, &str) + Send + Sync + 'static,
    ) -> CallbackId {
        self.add_listener(Arc::new(OnStateChange(callback)))
    }

    pub fn on_data_update(&self, callback: impl Fn(&TableUpdate) + Send + Sync + 'static) -> CallbackId {
        self.add_listener(Arc::new(OnDataUpdate(callback)))
    }

    // === Accessors ===

    /// Force a wire strategy for the next `subscribe`, ahead of the client
    /// default.
    pub fn set_strategy_override(&self, strategy: Option<SubscriptionStrategy>) {
        self.shared.lock().strategy_override = strategy;
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.shared.lock().state
    }

    /// Receiver that observes every state this subscription enters.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.shared.state_tx.subscribe()
    }

    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        self.shared.lock().queries.clone()
    }

    #[must_use]
    pub fn query_id(&self) -> Option<QueryId> {
        self.shared.lock().query_id
    }

    /// Strategy chosen by the last `subscribe`.
    #[must_use]
    pub fn strategy(&self) -> Option<SubscriptionStrategy> {
        self.shared.lock().strategy
    }

    /// Connection the current attempt runs on.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.shared.lock().connection.as_ref().map(ConnectionHandle::id)
    }

    /// Retries spent since the last successful apply.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.shared.lock().retry_count
    }

    #[must_use]
    pub fn last_error(&self) -> Option<SubscriptionFailure> {
        self.shared.lock().errors.last().cloned()
    }

    /// Every failure recorded, oldest first.
    #[must_use]
    pub fn errors(&self) -> Vec<SubscriptionFailure> {
        self.shared.lock().errors.clone()
    }

    #[must_use]
    pub fn metrics(&self) -> SubscriptionMetrics {
        self.shared.lock().metrics.clone()
    }

    #[must_use]
    pub fn last_transition_at(&self) -> DateTime<Utc> {
        self.shared.lock().last_transition_at
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("state", &inner.state)
            .field("queries", &inner.queries.len())
            .field("query_id", &inner.query_id)
            .field("retry_count", &inner.retry_count)
            .finish()
    }
}

/// Encode the request once with a placeholder id so oversized queries are
/// rejected before any connection is leased.
fn check_encodable(queries: &[String], strategy: SubscriptionStrategy, query_id: QueryId) -> ClientResult<()> {
    let request_id = RequestId::new(0);
    match strategy {
        SubscriptionStrategy::SingleQuery => {
            for query in queries {
                ClientMessage::SubscribeSingle {
                    query: query.clone(),
                    request_id,
                    query_id,
                }
                .encode()?;
            }
        }
        SubscriptionStrategy::MultiQuery => {
            ClientMessage::SubscribeMulti {
                query_strings: queries.to_vec(),
                request_id,
                query_id,
            }
            .encode()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::pool::transport::testing::IdleTransport;
    use crate::pool::transport::{MockConnector, TransportError};
    use crate::pool::Transport;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn context(connector: MockConnector, retry: RetryPolicy) -> Arc<EngineContext> {
        let config = ClientConfig::builder("mem://test")
            .connections(0, 1)
            .retry(retry)
            .acquire_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let pool = ConnectionPool::new(config.clone(), Arc::new(connector));
        let tracker = Arc::new(RequestTracker::new(config.request_timeout));
        Arc::new(EngineContext::new(&config, pool, tracker))
    }

    fn unreachable_connector() -> MockConnector {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|uri| {
            Err(TransportError::Connect {
                uri: uri.to_string(),
                reason: "refused".into(),
            })
        });
        connector
    }

    #[tokio::test]
    async fn test_validation_error_leaves_state_idle() {
        let sub = Subscription::new(context(unreachable_connector(), RetryPolicy::no_retry()));
        let err = sub.subscribe(["", "SELECT * FROM t"]).await.unwrap_err();
        match err {
            ClientError::Validation(errors) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(sub.state(), SubscriptionState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_from_idle() {
        let sub = Subscription::new(context(unreachable_connector(), RetryPolicy::no_retry()));
        assert!(sub.cancel());
        assert_eq!(sub.state(), SubscriptionState::Cancelled);
        assert!(!sub.cancel());
    }

    #[tokio::test]
    async fn test_connect_failure_without_retries_is_terminal() {
        let sub = Subscription::new(context(unreachable_connector(), RetryPolicy::no_retry()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        sub.on_state_change(move |state, _| log.lock().unwrap().push(state));

        sub.subscribe(["SELECT * FROM t"]).await.unwrap();

        assert_eq!(sub.state(), SubscriptionState::Error);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SubscriptionState::Pending, SubscriptionState::Error]
        );
        let failure = sub.last_error().unwrap();
        assert_eq!(failure.kind, FailureKind::Connection);
        assert!(!sub.cancel(), "terminal error cannot be cancelled");
        assert!(matches!(
            sub.subscribe(["SELECT * FROM t"]).await,
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_pending_until_acknowledged() {
        let mut connector = MockConnector::new();
        connector.expect_connect().times(1).returning(|_| {
            Ok(Arc::new(IdleTransport::new(Arc::new(AtomicBool::new(true)))) as Arc<dyn Transport>)
        });
        let sub = Subscription::new(context(connector, RetryPolicy::no_retry()));
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&applied);
        sub.on_applied(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        sub.subscribe(["SELECT * FROM a", "SELECT * FROM b"]).await.unwrap();

        assert_eq!(sub.state(), SubscriptionState::Pending);
        assert_eq!(applied.load(Ordering::SeqCst), 0);
        assert_eq!(sub.strategy(), Some(SubscriptionStrategy::SingleQuery));
        assert!(sub.connection_id().is_some());
        assert_eq!(sub.shared.ctx.tracker.pending_count(), 2);

        assert!(sub.cancel());
        assert_eq!(sub.shared.ctx.tracker.pending_count(), 0);
        assert_eq!(sub.connection_id(), None);
        assert_eq!(sub.shared.ctx.pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn test_remove_callback() {
        let sub = Subscription::new(context(unreachable_connector(), RetryPolicy::no_retry()));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = sub.on_state_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(sub.remove_callback(id));
        assert!(!sub.remove_callback(id));
        sub.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_others() {
        let sub = Subscription::new(context(unreachable_connector(), RetryPolicy::no_retry()));
        let hits = Arc::new(AtomicUsize::new(0));
        sub.on_state_change(|_, _| panic!("listener bug"));
        let counter = Arc::clone(&hits);
        sub.on_state_change(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.cancel();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_correlate_by_request_then_query_id() {
        let mut inner_pending = HashMap::new();
        inner_pending.insert(RequestId::new(7), Some(2));
        let inner = Inner {
            state: SubscriptionState::Pending,
            queries: vec![],
            query_id: Some(QueryId::new(40)),
            strategy: None,
            strategy_override: None,
            pending: inner_pending,
            applied_tables: vec![],
            host_execution_micros: 0,
            retry_count: 0,
            connection: None,
            errors: vec![],
            epoch: 1,
            attempt: CancellationToken::new(),
            starting: false,
            outbox: VecDeque::new(),
            delivering: false,
            metrics: SubscriptionMetrics::new(),
            last_transition_at: Utc::now(),
        };
        let err = |request_id: Option<u32>, query_id: Option<u32>| SubscriptionError {
            total_host_execution_duration_micros: 0,
            request_id: request_id.map(RequestId::new),
            query_id: query_id.map(QueryId::new),
            error: "bad".into(),
        };

        assert_eq!(correlate(&inner, &err(Some(7), None)), Some(Some(2)));
        assert_eq!(correlate(&inner, &err(None, Some(40))), Some(None));
        assert_eq!(correlate(&inner, &err(Some(8), Some(41))), None);
        assert_eq!(correlate(&inner, &err(None, None)), None);
    }
}
