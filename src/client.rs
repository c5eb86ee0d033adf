// ABOUTME: Client facade wiring the connection pool, request tracker and subscriptions together

use std::sync::Arc;

use tracing::info;

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::pool::{ConnectionPool, Connector};
use crate::request_tracker::{ExpirySweeper, RequestTracker};
use crate::subscription::{choose_strategy, EngineContext, Subscription, SubscriptionStrategy};

/// Entry point for talking to one database endpoint.
///
/// Owns one connection pool and one request id space; every subscription
/// created here shares both.
pub struct Client {
    config: ClientConfig,
    ctx: Arc<EngineContext>,
    sweeper: ExpirySweeper,
}

impl Client {
    /// Build a client without opening any connection.
    pub fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> ClientResult<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(config.clone(), connector);
        let tracker = Arc::new(RequestTracker::new(config.request_timeout));
        let ctx = Arc::new(EngineContext::new(&config, pool, tracker));
        let sweeper = ExpirySweeper::for_timeout(config.request_timeout);
        Ok(Self { config, ctx, sweeper })
    }

    /// Build a client, open `min_connections`, start health monitoring and
    /// the request expiry sweep.
    pub async fn connect(config: ClientConfig, connector: Arc<dyn Connector>) -> ClientResult<Self> {
        let client = Self::new(config, connector)?;
        client.ctx.pool.start().await?;
        client.sweeper.start(Arc::downgrade(&client.ctx.tracker));
        info!(uri = %client.config.uri, "Client connected");
        Ok(client)
    }

    /// A new, idle subscription.
    #[must_use]
    pub fn subscription(&self) -> Subscription {
        Subscription::new(Arc::clone(&self.ctx))
    }

    /// Create a subscription and subscribe it to `queries`.
    pub async fn subscribe<I, S>(&self, queries: I) -> ClientResult<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subscription = self.subscription();
        subscription.subscribe(queries).await?;
        Ok(subscription)
    }

    /// Strategy a fresh subscription would use for `query_count` queries.
    #[must_use]
    pub fn strategy_for(&self, query_count: usize) -> SubscriptionStrategy {
        choose_strategy(
            query_count,
            self.config.multi_query_threshold,
            self.config.subscription_strategy_override,
        )
    }

    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.ctx.pool
    }

    #[must_use]
    pub fn tracker(&self) -> &RequestTracker {
        &self.ctx.tracker
    }

    /// Close every connection. Subscriptions see the loss through their
    /// listeners.
    pub async fn shutdown(&self) {
        self.sweeper.stop().await;
        self.ctx.pool.shutdown().await;
        info!(uri = %self.config.uri, "Client shut down");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uri", &self.config.uri)
            .field("pool", &self.ctx.pool)
            .finish()
    }
}
