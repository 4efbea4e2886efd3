//! Event router: the ordered classification chain run for every inbound
//! mailbox event.
//!
//! A strict linear decision chain with early exits: filters first, then
//! passthrough routing, the outbound/inbound split, the unsubscribe block,
//! AI-access gating, and finally automation dispatch. The ledger closes the duplicate-delivery
//! race; deferred side effects are flushed to the sidecar queue only after
//! the primary outcome is decided.

use crate::InboundEvent;
use crate::account::{Account, AccountStore, extract_address};
use crate::actions::{ActionRecord, RateLimiter, execute_actions};
use crate::config::RoutingConfig;
use crate::error::ProviderError;
use crate::ledger::{Claim, ExecutionLedger};
use crate::patterns::{self, PatternStore};
use crate::provider::{ParsedMessage, ProviderRegistry};
use crate::rules::RuleEngine;
use crate::sidecar::{SidecarQueue, SidecarTask};

use anyhow::Context as _;
use async_trait::async_trait;
use std::sync::Arc;

const MESSAGE_RESOURCE: &str = "messages";

/// Where a matched action list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Pattern,
    Rule,
}

/// Terminal outcome of routing one event. Every early exit has a name so
/// callers and tests can assert the exact path taken.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// Sender hit the ignored-senders deny-list.
    IgnoredSender,
    /// A ledger row already existed for this key.
    Duplicate,
    /// Addressed to the assistant alias; handed off.
    AssistantConversation,
    /// Addressed to the filing alias; handed off.
    FilingReply,
    /// Sent by the assistant itself; dropped to prevent feedback loops.
    FromAssistant,
    /// Sent by the account owner; handed to reply tracking.
    Outbound,
    /// Sender is unsubscribed; message blocked at the provider.
    UnsubscribedBlocked,
    /// Account lacks AI entitlement; no automation without it.
    NoAiAccess,
    /// Account has automation rules switched off.
    AutomationDisabled,
    /// The message vanished between notification and fetch. Not an error.
    MessageVanished,
    /// Actions executed and recorded.
    Applied {
        matched_id: String,
        source: MatchSource,
        records: Vec<ActionRecord>,
    },
    /// Neither a pattern nor a rule matched; terminal SKIPPED row written.
    NoMatch,
}

impl RouteOutcome {
    /// Short name for logs and ingress responses.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IgnoredSender => "ignored_sender",
            Self::Duplicate => "duplicate",
            Self::AssistantConversation => "assistant_conversation",
            Self::FilingReply => "filing_reply",
            Self::FromAssistant => "from_assistant",
            Self::Outbound => "outbound",
            Self::UnsubscribedBlocked => "unsubscribed_blocked",
            Self::NoAiAccess => "no_ai_access",
            Self::AutomationDisabled => "automation_disabled",
            Self::MessageVanished => "message_vanished",
            Self::Applied { .. } => "applied",
            Self::NoMatch => "no_match",
        }
    }
}

/// External conversation handlers the router passes events to.
#[async_trait]
pub trait Handoff: Send + Sync {
    /// Message addressed to the assistant alias.
    async fn assistant_conversation(
        &self,
        account: &Account,
        message: &ParsedMessage,
    ) -> anyhow::Result<()>;

    /// Message addressed to the filing alias.
    async fn filing_reply(&self, account: &Account, message: &ParsedMessage)
    -> anyhow::Result<()>;

    /// Message sent by the account owner (reply tracking).
    async fn outbound_message(
        &self,
        account: &Account,
        message: &ParsedMessage,
    ) -> anyhow::Result<()>;
}

/// Handoff over HTTP to the conversation service.
pub struct HttpHandoff {
    http: reqwest::Client,
    base_url: String,
}

impl HttpHandoff {
    pub fn new(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    async fn post(&self, path: &str, account: &Account, message: &ParsedMessage) -> anyhow::Result<()> {
        self.http
            .post(format!("{}/{path}", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({ "account_id": account.id, "message": message }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Handoff for HttpHandoff {
    async fn assistant_conversation(
        &self,
        account: &Account,
        message: &ParsedMessage,
    ) -> anyhow::Result<()> {
        self.post("assistant-conversation", account, message).await
    }

    async fn filing_reply(
        &self,
        account: &Account,
        message: &ParsedMessage,
    ) -> anyhow::Result<()> {
        self.post("filing-reply", account, message).await
    }

    async fn outbound_message(
        &self,
        account: &Account,
        message: &ParsedMessage,
    ) -> anyhow::Result<()> {
        self.post("outbound-message", account, message).await
    }
}

/// No-op handoff for deployments without the conversation service.
pub struct NoopHandoff;

#[async_trait]
impl Handoff for NoopHandoff {
    async fn assistant_conversation(
        &self,
        _account: &Account,
        _message: &ParsedMessage,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn filing_reply(
        &self,
        _account: &Account,
        _message: &ParsedMessage,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn outbound_message(
        &self,
        _account: &Account,
        _message: &ParsedMessage,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The orchestrating state machine.
pub struct EventRouter {
    accounts: AccountStore,
    ledger: ExecutionLedger,
    patterns: PatternStore,
    registry: Arc<dyn ProviderRegistry>,
    rules: Arc<dyn RuleEngine>,
    handoff: Arc<dyn Handoff>,
    sidecar: SidecarQueue,
    limiter: Arc<RateLimiter>,
    routing: RoutingConfig,
}

impl EventRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: AccountStore,
        ledger: ExecutionLedger,
        patterns: PatternStore,
        registry: Arc<dyn ProviderRegistry>,
        rules: Arc<dyn RuleEngine>,
        handoff: Arc<dyn Handoff>,
        sidecar: SidecarQueue,
        limiter: Arc<RateLimiter>,
        routing: RoutingConfig,
    ) -> Self {
        Self {
            accounts,
            ledger,
            patterns,
            registry,
            rules,
            handoff,
            sidecar,
            limiter,
            routing,
        }
    }

    /// Process one inbound event to a terminal outcome.
    ///
    /// Not-found from the provider ends the event successfully; any other
    /// provider or collaborator failure is logged with full context and
    /// propagated so the delivery layer can retry the whole event.
    pub async fn handle_event(&self, event: &InboundEvent) -> crate::Result<RouteOutcome> {
        let Some(account) = self.accounts.load(&event.account_id).await? else {
            return Err(crate::PipelineError::UnknownAccount(
                event.account_id.clone(),
            ));
        };

        let provider = self.registry.provider_for(&account).await?;

        let message = match &event.prefetched {
            Some(prefetched) => prefetched.clone(),
            None => match provider.fetch_message(&event.message_id).await {
                Ok(message) => message,
                Err(ProviderError::NotFound) => {
                    tracing::debug!(
                        account_id = %account.id,
                        message_id = %event.message_id,
                        "message vanished before processing"
                    );
                    return Ok(RouteOutcome::MessageVanished);
                }
                Err(error) => {
                    tracing::error!(
                        account_id = %account.id,
                        message_id = %event.message_id,
                        %error,
                        "message fetch failed"
                    );
                    return Err(error.into());
                }
            },
        };

        let thread_id = event
            .thread_id
            .as_deref()
            .or(message.thread_id.as_deref());
        let sender = message.from_address().to_string();

        // 1. Ignored-sender filter.
        if self.routing.is_ignored_sender(&sender) {
            tracing::debug!(account_id = %account.id, "sender on deny-list, dropping event");
            return Ok(RouteOutcome::IgnoredSender);
        }

        // 2. Ledger check: cheap duplicate exit. The atomic claim happens at
        // automation dispatch, before any mutating provider call.
        if self
            .ledger
            .is_handled(&account.id, thread_id, &event.message_id)
            .await?
        {
            return Ok(RouteOutcome::Duplicate);
        }

        // 3/4. Self-addressed passthroughs: assistant, then filing bot.
        let recipients = message.recipients();
        if let Some(alias) = self.routing.assistant_alias.as_deref() {
            if recipients_contain(&recipients, alias) {
                self.handoff
                    .assistant_conversation(&account, &message)
                    .await
                    .context("assistant conversation handoff failed")?;
                return Ok(RouteOutcome::AssistantConversation);
            }
        }
        if let Some(alias) = self.routing.filing_alias.as_deref() {
            if recipients_contain(&recipients, alias) {
                self.handoff
                    .filing_reply(&account, &message)
                    .await
                    .context("filing reply handoff failed")?;
                return Ok(RouteOutcome::FilingReply);
            }
        }

        // 5. From-assistant filter: prevents feedback loops.
        if let Some(alias) = self.routing.assistant_alias.as_deref() {
            if sender.to_lowercase().contains(&alias.to_lowercase()) {
                return Ok(RouteOutcome::FromAssistant);
            }
        }

        // 6. Outbound classification.
        if provider.is_outbound(&account.email_address, &message) {
            self.handoff
                .outbound_message(&account, &message)
                .await
                .context("outbound message handoff failed")?;
            return Ok(RouteOutcome::Outbound);
        }

        // 7. Unsubscribe block.
        if self.accounts.is_unsubscribed(&account.id, &sender).await? {
            match provider.block_sender(&message.id, &sender).await {
                Ok(()) | Err(ProviderError::NotFound) => {}
                Err(error) => {
                    tracing::error!(
                        account_id = %account.id,
                        message_id = %message.id,
                        %error,
                        "failed to block unsubscribed sender"
                    );
                    return Err(error.into());
                }
            }
            return Ok(RouteOutcome::UnsubscribedBlocked);
        }

        // 8. AI-access gate: no automation without entitlement.
        if !account.ai_access_enabled {
            return Ok(RouteOutcome::NoAiAccess);
        }

        // 9. Sender categorization trigger, deferred past the primary
        // outcome.
        let mut deferred = Vec::new();
        if account.auto_categorize_senders
            && !self
                .accounts
                .is_sender_categorized(&account.id, &sender)
                .await?
        {
            deferred.push(SidecarTask::CategorizeSender {
                account_id: account.id.clone(),
                sender: extract_address(&sender),
            });
        }

        // 10. Automation dispatch.
        let outcome = if account.automation_enabled {
            match self
                .ledger
                .try_claim(&account.id, thread_id, &event.message_id)
                .await?
            {
                Claim::AlreadyHandled => return Ok(RouteOutcome::Duplicate),
                Claim::Claimed => {
                    self.dispatch_automation(&account, provider.as_ref(), thread_id, &message)
                        .await?
                }
            }
        } else {
            RouteOutcome::AutomationDisabled
        };

        // 11. Attachment filing, scheduled rather than inline.
        if account.filing_enabled && !message.attachments.is_empty() {
            deferred.push(SidecarTask::FileAttachments {
                account_id: account.id.clone(),
                message_id: message.id.clone(),
                attachments: message.attachments.clone(),
            });
        }

        for task in deferred {
            self.sidecar.enqueue(task).await;
        }

        Ok(outcome)
    }

    /// Pattern shortcut first; full rule evaluation only on a miss.
    async fn dispatch_automation(
        &self,
        account: &Account,
        provider: &dyn crate::provider::MailProvider,
        thread_id: Option<&str>,
        message: &ParsedMessage,
    ) -> crate::Result<RouteOutcome> {
        let loaded = self
            .patterns
            .load_for_account(&account.id, account.provider, MESSAGE_RESOURCE)
            .await?;

        if let Some(hit) = patterns::find_match(&loaded, message.from_address(), message.subject())
        {
            tracing::info!(
                account_id = %account.id,
                message_id = %message.id,
                pattern_id = %hit.pattern_id,
                "learned pattern matched"
            );
            let records =
                execute_actions(provider, &self.limiter, account, message, &hit.actions).await;
            self.ledger
                .mark_applied(&account.id, thread_id, &message.id, &hit.pattern_id, &records)
                .await?;
            return Ok(RouteOutcome::Applied {
                matched_id: hit.pattern_id,
                source: MatchSource::Pattern,
                records,
            });
        }

        let evaluated = self
            .rules
            .evaluate(account, message)
            .await
            .context("rule evaluation failed")?;

        match evaluated {
            Some(matched) => {
                tracing::info!(
                    account_id = %account.id,
                    message_id = %message.id,
                    rule_id = %matched.rule_id,
                    "rule matched"
                );
                let records =
                    execute_actions(provider, &self.limiter, account, message, &matched.actions)
                        .await;
                self.ledger
                    .mark_applied(
                        &account.id,
                        thread_id,
                        &message.id,
                        &matched.rule_id,
                        &records,
                    )
                    .await?;
                Ok(RouteOutcome::Applied {
                    matched_id: matched.rule_id,
                    source: MatchSource::Rule,
                    records,
                })
            }
            None => {
                self.ledger
                    .mark_skipped(&account.id, thread_id, &message.id)
                    .await?;
                Ok(RouteOutcome::NoMatch)
            }
        }
    }
}

fn recipients_contain(recipients: &[String], alias: &str) -> bool {
    let alias = alias.to_lowercase();
    recipients.iter().any(|recipient| recipient.contains(&alias))
}
