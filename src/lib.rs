// ABOUTME: Client runtime for SpacetimeDB-style services - BSATN codec, pooled connections, subscriptions
//
// Layers, bottom up: `codec` (tagged values on the wire), `protocol` (frames
// built from them), `request_tracker` and `retry` (small shared policies),
// `pool` (connections, health, circuit breakers), `subscription` (lifecycle
// state machine) and `client` (the facade that wires them).

#![allow(missing_docs)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod request_tracker;
pub mod retry;
pub mod subscription;

pub use client::Client;
pub use config::{ClientConfig, ConfigError};
pub use error::{ClientError, ClientResult};
pub use subscription::{Subscription, SubscriptionState};
