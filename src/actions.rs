//! Action execution against the provider adapter.
//!
//! Actions come from a matched learned pattern or from the rule-evaluation
//! engine. Each action is isolated: one failing never aborts its siblings.
//! Outbound actions (reply, forward, draft) acquire a per-account rate-limit
//! token with a bounded wait before the provider call is issued.

use crate::account::{Account, extract_address};
use crate::config::RateLimitConfig;
use crate::error::ProviderError;
use crate::provider::{MailProvider, OutgoingMessage, ParsedMessage};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

/// An automated action to run against the mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Archive,
    ApplyLabel { label_id: String },
    /// Apply a label to every message of the conversation.
    LabelThread { label_id: String },
    MoveToFolder { folder: String },
    MarkRead { read: bool },
    Reply { body: String },
    Forward { to: Vec<String> },
    Draft { body: String },
}

impl Action {
    /// Outbound actions create mail and are token-gated; mailbox-state
    /// mutations are not.
    pub fn is_outbound(&self) -> bool {
        matches!(self, Self::Reply { .. } | Self::Forward { .. } | Self::Draft { .. })
    }

    /// Short name for logs and ledger records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::ApplyLabel { .. } => "apply_label",
            Self::LabelThread { .. } => "label_thread",
            Self::MoveToFolder { .. } => "move_to_folder",
            Self::MarkRead { .. } => "mark_read",
            Self::Reply { .. } => "reply",
            Self::Forward { .. } => "forward",
            Self::Draft { .. } => "draft",
        }
    }
}

/// What actually happened when an action ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action: Action,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn ok(action: Action) -> Self {
        Self {
            action,
            ok: true,
            error: None,
        }
    }

    pub fn failed(action: Action, error: impl Into<String>) -> Self {
        Self {
            action,
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Per-account token bucket for outbound provider actions.
///
/// A spent token returns to the bucket after the refill interval. Waiting is
/// bounded: timing out is a hard failure for that action, never a silent
/// drop.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Arc<Semaphore>>>,
    burst: usize,
    refill_interval: Duration,
    acquire_timeout: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            burst: config.burst.max(1),
            refill_interval: config.refill_interval(),
            acquire_timeout: config.acquire_timeout(),
        }
    }

    /// Take one token for the account, waiting up to the bounded timeout.
    pub async fn acquire(&self, account_id: &str) -> Result<(), ProviderError> {
        let bucket = {
            let mut buckets = self.buckets.lock().await;
            buckets
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.burst)))
                .clone()
        };

        let permit = tokio::time::timeout(self.acquire_timeout, bucket.clone().acquire_owned())
            .await
            .map_err(|_| ProviderError::RateLimited(self.acquire_timeout))?
            .map_err(|_| ProviderError::RateLimited(self.acquire_timeout))?;

        // Consume the permit now and hand it back after the refill interval.
        permit.forget();
        let refill = self.refill_interval;
        tokio::spawn(async move {
            tokio::time::sleep(refill).await;
            bucket.add_permits(1);
        });

        Ok(())
    }
}

/// Run a matched action list through the provider.
///
/// Label applications are independent of each other and run concurrently;
/// everything else runs in order. Records come back in input order, one per
/// action, failures included.
pub async fn execute_actions(
    provider: &dyn MailProvider,
    limiter: &RateLimiter,
    account: &Account,
    message: &ParsedMessage,
    actions: &[Action],
) -> Vec<ActionRecord> {
    let mut records: Vec<Option<ActionRecord>> = vec![None; actions.len()];

    let label_indices: Vec<usize> = actions
        .iter()
        .enumerate()
        .filter(|(_, action)| matches!(action, Action::ApplyLabel { .. }))
        .map(|(index, _)| index)
        .collect();

    let label_runs = label_indices.iter().map(|&index| {
        let action = actions[index].clone();
        async move { (index, run_action(provider, limiter, account, message, action).await) }
    });
    for (index, record) in join_all(label_runs).await {
        records[index] = Some(record);
    }

    for (index, action) in actions.iter().enumerate() {
        if records[index].is_some() {
            continue;
        }
        records[index] =
            Some(run_action(provider, limiter, account, message, action.clone()).await);
    }

    records.into_iter().flatten().collect()
}

async fn run_action(
    provider: &dyn MailProvider,
    limiter: &RateLimiter,
    account: &Account,
    message: &ParsedMessage,
    action: Action,
) -> ActionRecord {
    if action.is_outbound() {
        if let Err(error) = limiter.acquire(&account.id).await {
            tracing::warn!(
                account_id = %account.id,
                action = action.name(),
                %error,
                "rate limit token not acquired, action failed"
            );
            return ActionRecord::failed(action, error.to_string());
        }
    }

    let result = apply(provider, message, &action).await;

    match result {
        Ok(()) => ActionRecord::ok(action),
        Err(error) => {
            tracing::warn!(
                account_id = %account.id,
                message_id = %message.id,
                action = action.name(),
                %error,
                "action failed, continuing with remaining actions"
            );
            ActionRecord::failed(action, error.to_string())
        }
    }
}

async fn apply(
    provider: &dyn MailProvider,
    message: &ParsedMessage,
    action: &Action,
) -> Result<(), ProviderError> {
    match action {
        Action::Archive => provider.archive(&message.id).await,
        Action::ApplyLabel { label_id } => provider.apply_label(&message.id, label_id).await,
        Action::LabelThread { label_id } => label_thread(provider, message, label_id).await,
        Action::MoveToFolder { folder } => provider.move_to_folder(&message.id, folder).await,
        Action::MarkRead { read } => provider.mark_read(&message.id, *read).await,
        Action::Reply { body } => {
            let outgoing = OutgoingMessage {
                to: vec![extract_address(message.from_address())],
                subject: reply_subject(message.subject()),
                body: body.clone(),
                in_reply_to: message.header("message-id").map(str::to_string),
            };
            provider.send_message(&outgoing).await
        }
        Action::Forward { to } => {
            let outgoing = OutgoingMessage {
                to: to.clone(),
                subject: forward_subject(message.subject()),
                body: message.text_body.clone().unwrap_or_default(),
                in_reply_to: None,
            };
            provider.send_message(&outgoing).await
        }
        Action::Draft { body } => {
            let outgoing = OutgoingMessage {
                to: vec![extract_address(message.from_address())],
                subject: reply_subject(message.subject()),
                body: body.clone(),
                in_reply_to: message.header("message-id").map(str::to_string),
            };
            provider.create_draft(&outgoing).await
        }
    }
}

/// Label every message of the conversation, concurrently. Partial failure is
/// logged and tolerated rather than aborting the whole action.
async fn label_thread(
    provider: &dyn MailProvider,
    message: &ParsedMessage,
    label_id: &str,
) -> Result<(), ProviderError> {
    let Some(thread_id) = message.thread_id.as_deref() else {
        return provider.apply_label(&message.id, label_id).await;
    };

    let thread = provider.fetch_thread(thread_id).await?;

    let applications = thread
        .iter()
        .map(|member| provider.apply_label(&member.id, label_id));

    for (member, result) in thread.iter().zip(join_all(applications).await) {
        if let Err(error) = result {
            tracing::warn!(
                message_id = %member.id,
                thread_id,
                %error,
                "label application failed for one thread member"
            );
        }
    }

    Ok(())
}

fn reply_subject(subject: &str) -> String {
    if subject.to_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

fn forward_subject(subject: &str) -> String {
    if subject.to_lowercase().starts_with("fwd:") {
        subject.to_string()
    } else {
        format!("Fwd: {subject}")
    }
}
