// ABOUTME: Wire strategy selection - one frame per query or one batched frame

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a subscription's queries go on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStrategy {
    /// One `SubscribeSingle` frame per query
    SingleQuery,
    /// One `SubscribeMulti` frame carrying every query
    MultiQuery,
}

impl fmt::Display for SubscriptionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SingleQuery => "single_query",
            Self::MultiQuery => "multi_query",
        })
    }
}

/// Pick a strategy for `query_count` queries.
///
/// An explicit override always wins. Otherwise more than `threshold` queries
/// are batched.
#[must_use]
pub fn choose_strategy(
    query_count: usize,
    threshold: usize,
    strategy_override: Option<SubscriptionStrategy>,
) -> SubscriptionStrategy {
    match strategy_override {
        Some(strategy) => strategy,
        None if query_count > threshold => SubscriptionStrategy::MultiQuery,
        None => SubscriptionStrategy::SingleQuery,
    }
}
