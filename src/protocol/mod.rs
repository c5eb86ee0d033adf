// ABOUTME: Wire frames exchanged with the server and their correlation ids

pub mod client_message;
pub mod ids;
pub mod server_message;

pub use client_message::ClientMessage;
pub use ids::{QueryId, RequestId};
pub use server_message::{ErrorCategory, ServerMessage, SubscriptionError, TableUpdate};
