//! Inbound mailbox-event processing and automation-rule execution pipeline.
//!
//! Receives notifications that a message arrived in (or left) a connected
//! mailbox, decides what automated actions to take, and executes them with
//! exactly-once semantics across two structurally different provider APIs.

pub mod account;
pub mod actions;
pub mod config;
pub mod error;
pub mod history;
pub mod ingress;
pub mod ledger;
pub mod patterns;
pub mod provider;
pub mod router;
pub mod rules;
pub mod sidecar;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{PipelineError, Result};

use provider::ParsedMessage;
use serde::Deserialize;

/// A notification that a message exists or changed in a connected mailbox.
///
/// Delivered at-least-once by the webhook/poll layer; never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    pub account_id: String,
    pub message_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Message body included with the notification, when the delivery
    /// mechanism already fetched it. Saves one provider round trip.
    #[serde(default)]
    pub prefetched: Option<ParsedMessage>,
}
