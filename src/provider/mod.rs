//! Provider adapter: one operation set over two incompatible mailbox APIs.
//!
//! Callers work against [`MailProvider`] and never see provider-native error
//! shapes; both implementations normalize their "item no longer exists"
//! signatures into [`ProviderError::NotFound`] before returning.

pub mod gmail;
pub mod graph;

use crate::account::Account;
use crate::error::ProviderError;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

/// The two supported mailbox providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gmail,
    Outlook,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "gmail" => Some(Self::Gmail),
            "outlook" => Some(Self::Outlook),
            _ => None,
        }
    }
}

/// Reference to an attachment on a fetched message. Content is retrieved
/// separately through the locator; this core never downloads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub content_locator: String,
}

/// Normalized representation of a provider-native message. Immutable once
/// constructed for a given fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Header map with lowercased names: from, to, cc, subject, date,
    /// message-id, references.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// Provider-native label/category markers, used by outbound detection.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl ParsedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn from_address(&self) -> &str {
        self.header("from").unwrap_or_default()
    }

    pub fn subject(&self) -> &str {
        self.header("subject").unwrap_or_default()
    }

    /// All delivery addresses: to plus cc, lowercased.
    pub fn recipients(&self) -> Vec<String> {
        let mut recipients = Vec::new();
        for name in ["to", "cc"] {
            if let Some(value) = self.header(name) {
                recipients.extend(
                    value
                        .split(',')
                        .map(|address| address.trim().to_lowercase())
                        .filter(|address| !address.is_empty()),
                );
            }
        }
        recipients
    }
}

/// A label or category as listed by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

/// Lightweight search result entry.
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub id: String,
    pub thread_id: Option<String>,
}

/// One page of provider search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
}

/// An outgoing message for send, draft, reply, and forward operations.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    /// RFC message-id being replied to, when threading a reply.
    pub in_reply_to: Option<String>,
}

/// Field a search clause targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    From,
    Subject,
}

/// One quoted-literal clause of an OR-ed example search query.
#[derive(Debug, Clone)]
pub struct SearchClause {
    pub field: SearchField,
    pub value: String,
}

/// Optional date bounds on an example search.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DateWindow {
    #[serde(default)]
    pub after: Option<NaiveDate>,
    #[serde(default)]
    pub before: Option<NaiveDate>,
}

/// Provider-agnostic mailbox operation set.
///
/// Mutating calls go straight to the live mailbox; the adapter performs no
/// internal retries; retry policy belongs to the caller.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn fetch_message(&self, message_id: &str) -> Result<ParsedMessage, ProviderError>;

    async fn fetch_thread(&self, thread_id: &str) -> Result<Vec<ParsedMessage>, ProviderError>;

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError>;

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<(), ProviderError>;

    async fn remove_label(&self, message_id: &str, label_id: &str) -> Result<(), ProviderError>;

    /// Archive a message out of the inbox.
    async fn archive(&self, message_id: &str) -> Result<(), ProviderError>;

    async fn move_to_folder(&self, message_id: &str, folder: &str) -> Result<(), ProviderError>;

    async fn mark_read(&self, message_id: &str, read: bool) -> Result<(), ProviderError>;

    async fn send_message(&self, outgoing: &OutgoingMessage) -> Result<(), ProviderError>;

    async fn create_draft(&self, outgoing: &OutgoingMessage) -> Result<(), ProviderError>;

    async fn search_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<SearchPage, ProviderError>;

    /// Whether the message was sent by the account owner rather than
    /// received. Each provider models this differently.
    fn is_outbound(&self, account_address: &str, message: &ParsedMessage) -> bool;

    /// Suppress future mail from a sender the account unsubscribed from.
    async fn block_sender(&self, message_id: &str, sender: &str) -> Result<(), ProviderError>;

    /// Register for change notifications. Returns an opaque watch handle.
    async fn watch(&self) -> Result<String, ProviderError>;

    async fn unwatch(&self, handle: &str) -> Result<(), ProviderError>;

    /// Render an OR-ed search query in this provider's query syntax.
    fn example_search_query(&self, clauses: &[SearchClause], window: Option<&DateWindow>)
    -> String;
}

/// Resolves the adapter instance for an account.
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn provider_for(&self, account: &Account) -> crate::Result<Arc<dyn MailProvider>>;
}

/// Registry backed by the credentials table. Access tokens are written and
/// refreshed by the OAuth layer (external); this core only reads them.
pub struct SqliteProviderRegistry {
    pool: SqlitePool,
    http: reqwest::Client,
    gmail_base_url: String,
    graph_base_url: String,
    gmail_watch_topic: Option<String>,
    graph_notification_url: Option<String>,
}

impl SqliteProviderRegistry {
    pub fn new(pool: SqlitePool, providers: &crate::config::ProvidersConfig) -> Self {
        Self {
            pool,
            http: reqwest::Client::new(),
            gmail_base_url: providers.gmail_base_url.clone(),
            graph_base_url: providers.graph_base_url.clone(),
            gmail_watch_topic: providers.gmail_watch_topic.clone(),
            graph_notification_url: providers.graph_notification_url.clone(),
        }
    }

    async fn access_token(&self, account_id: &str) -> crate::Result<String> {
        let row = sqlx::query("SELECT access_token FROM credentials WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(crate::PipelineError::MissingCredentials(
                account_id.to_string(),
            ));
        };

        Ok(row.try_get("access_token")?)
    }
}

#[async_trait]
impl ProviderRegistry for SqliteProviderRegistry {
    async fn provider_for(&self, account: &Account) -> crate::Result<Arc<dyn MailProvider>> {
        let token = self.access_token(&account.id).await?;

        let provider: Arc<dyn MailProvider> = match account.provider {
            ProviderKind::Gmail => Arc::new(gmail::GmailProvider::new(
                self.http.clone(),
                self.gmail_base_url.clone(),
                token,
                self.gmail_watch_topic.clone(),
            )),
            ProviderKind::Outlook => Arc::new(graph::GraphProvider::new(
                self.http.clone(),
                self.graph_base_url.clone(),
                token,
                self.graph_notification_url.clone(),
            )),
        };

        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::ParsedMessage;

    #[test]
    fn recipients_merges_to_and_cc() {
        let mut message = ParsedMessage::default();
        message
            .headers
            .insert("to".into(), "A@example.com, b@example.com".into());
        message.headers.insert("cc".into(), "C@example.com".into());

        assert_eq!(
            message.recipients(),
            vec!["a@example.com", "b@example.com", "c@example.com"]
        );
    }

    #[test]
    fn missing_headers_yield_empty_strings() {
        let message = ParsedMessage::default();
        assert_eq!(message.from_address(), "");
        assert_eq!(message.subject(), "");
        assert!(message.recipients().is_empty());
    }
}
