// ABOUTME: Subscription lifecycle states and the allowed transitions between them

use std::fmt;

/// Lifecycle of one subscription.
///
/// ```text
/// Idle -> Pending -> Active
/// Pending | Active -> Error -> Retrying -> Pending
/// (any non-terminal) -> Cancelled
/// ```
///
/// `Cancelled` may be restarted with a fresh `subscribe`; `Error` with no
/// retries left is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Created, `subscribe` not called yet
    Idle,
    /// Subscribe request sent, waiting for every acknowledgment
    Pending,
    /// Server applied the subscription; data updates flow
    Active,
    /// Last attempt failed
    Error,
    /// Waiting for the backoff timer before the next attempt
    Retrying,
    /// Stopped by the caller
    Cancelled,
}

impl SubscriptionState {
    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SubscriptionState::{Active, Cancelled, Error, Idle, Pending, Retrying};
        match (self, next) {
            (Idle | Cancelled | Retrying, Pending)
            | (Pending, Active)
            | (Pending | Active, Error)
            | (Error, Retrying)
            | (Idle | Pending | Active | Retrying, Cancelled) => true,
            _ => false,
        }
    }

    /// Accepts an explicit `subscribe` call.
    #[must_use]
    pub const fn can_subscribe(self) -> bool {
        matches!(self, Self::Idle | Self::Cancelled)
    }

    #[must_use]
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Error => "error",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
