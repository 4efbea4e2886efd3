//! Error taxonomy for the event pipeline.

use std::time::Duration;

/// Errors surfaced by a mailbox provider adapter.
///
/// Both provider implementations normalize their native error shapes into
/// these variants before anything leaves the adapter, so callers never
/// branch on provider-specific error text.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The message or thread no longer exists. Deletions and moves between
    /// notification and processing are normal, not failures.
    #[error("item no longer exists")]
    NotFound,

    /// An outbound-action rate-limit token could not be acquired within the
    /// bounded wait. A hard failure for that action only.
    #[error("rate limit token not acquired within {0:?}")]
    RateLimited(Duration),

    /// The provider rejected the call with a non-success status.
    #[error("provider api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure before any provider response arrived.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Top-level pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown account '{0}'")]
    UnknownAccount(String),

    #[error("no credentials on file for account '{0}'")]
    MissingCredentials(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
