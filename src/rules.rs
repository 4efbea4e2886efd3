//! Rule-evaluation boundary.
//!
//! The AI/heuristic decision maker that turns a message plus the account's
//! enabled rules into an action list lives outside this core. This module
//! defines the contract and an HTTP client implementation; the pipeline only
//! executes whatever comes back.

use crate::account::Account;
use crate::actions::Action;
use crate::provider::ParsedMessage;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A rule selected by the evaluation engine, with its ordered action list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: String,
    pub actions: Vec<Action>,
}

/// External rule evaluation. Returns `None` when no rule matched.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn evaluate(
        &self,
        account: &Account,
        message: &ParsedMessage,
    ) -> anyhow::Result<Option<RuleMatch>>;
}

/// Rule engine reached over HTTP, the deployment default.
pub struct RemoteRuleEngine {
    http: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct EvaluateRequest<'a> {
    account_id: &'a str,
    message: &'a ParsedMessage,
}

#[derive(Deserialize)]
struct EvaluateResponse {
    #[serde(default)]
    matched: Option<RuleMatch>,
}

impl RemoteRuleEngine {
    pub fn new(http: reqwest::Client, url: String) -> Self {
        Self { http, url }
    }
}

#[async_trait]
impl RuleEngine for RemoteRuleEngine {
    async fn evaluate(
        &self,
        account: &Account,
        message: &ParsedMessage,
    ) -> anyhow::Result<Option<RuleMatch>> {
        let response = self
            .http
            .post(&self.url)
            .json(&EvaluateRequest {
                account_id: &account.id,
                message,
            })
            .send()
            .await
            .context("rule evaluation request failed")?
            .error_for_status()
            .context("rule evaluation returned an error status")?;

        let body: EvaluateResponse = response
            .json()
            .await
            .context("failed to parse rule evaluation response")?;

        Ok(body.matched)
    }
}

/// No-op engine for deployments without a rule service configured.
pub struct DisabledRuleEngine;

#[async_trait]
impl RuleEngine for DisabledRuleEngine {
    async fn evaluate(
        &self,
        _account: &Account,
        _message: &ParsedMessage,
    ) -> anyhow::Result<Option<RuleMatch>> {
        Ok(None)
    }
}
