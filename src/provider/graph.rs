//! Microsoft Graph implementation of the provider adapter.
//!
//! "Thread" maps to Graph's conversation, categories play the label role,
//! and moves target well-known or caller-supplied folder ids. Not-found
//! detection prefers the structured `ErrorItemNotFound` code; the literal
//! "not found in the store" substring is kept only as a fallback for older
//! API shapes that omit the code.

use super::{
    AttachmentRef, DateWindow, Label, MailProvider, MessageRef, OutgoingMessage, ParsedMessage,
    ProviderKind, SearchClause, SearchField, SearchPage,
};
use crate::error::ProviderError;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

const NOT_FOUND_CODE: &str = "ErrorItemNotFound";
const NOT_FOUND_FALLBACK: &str = "not found in the store";
const JUNK_FOLDER: &str = "junkemail";

pub struct GraphProvider {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    notification_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    cc_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    received_date_time: Option<String>,
    #[serde(default)]
    internet_message_id: Option<String>,
    #[serde(default)]
    body: Option<GraphBody>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    attachments: Vec<GraphAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    #[serde(default)]
    email_address: Option<GraphEmailAddress>,
}

#[derive(Debug, Deserialize)]
struct GraphEmailAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAttachment {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct GraphMessageList {
    #[serde(default)]
    value: Vec<GraphMessage>,
    #[serde(default, rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphCategoryList {
    #[serde(default)]
    value: Vec<GraphCategory>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphCategory {
    id: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    #[serde(default)]
    error: Option<GraphErrorBody>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphSubscription {
    id: String,
}

impl GraphProvider {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        access_token: String,
        notification_url: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url,
            access_token,
            notification_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound);
        }

        let body = response.text().await.unwrap_or_default();
        if is_not_found_body(&body) {
            return Err(ProviderError::NotFound);
        }

        Err(ProviderError::Api {
            status: status.as_u16(),
            message: body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        Ok(self.check(response).await?.json().await?)
    }

    async fn post_json(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        self.check(response).await
    }

    async fn patch_json(
        &self,
        url: String,
        body: serde_json::Value,
    ) -> Result<(), ProviderError> {
        let response = self
            .http
            .patch(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        self.check(response).await?;
        Ok(())
    }

    /// Category PATCHes replace the whole list, so read-modify-write.
    async fn set_categories(
        &self,
        message_id: &str,
        mutate: impl FnOnce(&mut Vec<String>),
    ) -> Result<(), ProviderError> {
        let message: GraphMessage = self
            .get_json(self.url(&format!("me/messages/{message_id}?$select=id,categories")))
            .await?;

        let mut categories = message.categories;
        mutate(&mut categories);

        self.patch_json(
            self.url(&format!("me/messages/{message_id}")),
            json!({ "categories": categories }),
        )
        .await
    }

    fn outgoing_payload(outgoing: &OutgoingMessage) -> serde_json::Value {
        json!({
            "subject": outgoing.subject,
            "body": { "contentType": "text", "content": outgoing.body },
            "toRecipients": outgoing
                .to
                .iter()
                .map(|address| json!({ "emailAddress": { "address": address } }))
                .collect::<Vec<_>>(),
        })
    }
}

/// Detect Graph's "item no longer exists" error body. The structured code
/// check runs first; the English substring match is a documented fallback.
fn is_not_found_body(body: &str) -> bool {
    if let Ok(envelope) = serde_json::from_str::<GraphErrorEnvelope>(body) {
        if let Some(error) = envelope.error {
            if error.code.as_deref() == Some(NOT_FOUND_CODE) {
                return true;
            }
            if let Some(message) = &error.message {
                if message.to_lowercase().contains(NOT_FOUND_FALLBACK) {
                    return true;
                }
            }
            return false;
        }
    }

    body.to_lowercase().contains(NOT_FOUND_FALLBACK)
}

/// OData string literals escape an embedded quote by doubling it.
fn escape_odata(value: &str) -> String {
    value.replace('\'', "''")
}

fn format_recipient(recipient: &GraphRecipient) -> Option<String> {
    let email = recipient.email_address.as_ref()?;
    let address = email.address.as_deref()?;
    match email.name.as_deref() {
        Some(name) if !name.is_empty() && name != address => Some(format!("{name} <{address}>")),
        _ => Some(address.to_string()),
    }
}

fn parse_message(message: GraphMessage) -> ParsedMessage {
    let mut parsed = ParsedMessage {
        id: message.id,
        thread_id: message.conversation_id,
        labels: message.categories,
        ..ParsedMessage::default()
    };

    if let Some(from) = message.from.as_ref().and_then(format_recipient) {
        parsed.headers.insert("from".into(), from);
    }
    let to = message
        .to_recipients
        .iter()
        .filter_map(format_recipient)
        .collect::<Vec<_>>();
    if !to.is_empty() {
        parsed.headers.insert("to".into(), to.join(", "));
    }
    let cc = message
        .cc_recipients
        .iter()
        .filter_map(format_recipient)
        .collect::<Vec<_>>();
    if !cc.is_empty() {
        parsed.headers.insert("cc".into(), cc.join(", "));
    }
    if let Some(subject) = message.subject {
        parsed.headers.insert("subject".into(), subject);
    }
    if let Some(date) = message.received_date_time {
        parsed.headers.insert("date".into(), date);
    }
    if let Some(message_id) = message.internet_message_id {
        parsed.headers.insert("message-id".into(), message_id);
    }

    if let Some(body) = message.body {
        let content = body.content.unwrap_or_default();
        match body.content_type.as_deref() {
            Some(kind) if kind.eq_ignore_ascii_case("html") => parsed.html_body = Some(content),
            _ => parsed.text_body = Some(content),
        }
    }

    parsed.attachments = message
        .attachments
        .into_iter()
        .map(|attachment| AttachmentRef {
            filename: attachment.name.unwrap_or_default(),
            mime_type: attachment.content_type.unwrap_or_default(),
            size: attachment.size,
            content_locator: attachment.id,
        })
        .collect();

    parsed
}

#[async_trait]
impl MailProvider for GraphProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn fetch_message(&self, message_id: &str) -> Result<ParsedMessage, ProviderError> {
        let message: GraphMessage = self
            .get_json(self.url(&format!(
                "me/messages/{message_id}?$expand=attachments($select=id,name,contentType,size)"
            )))
            .await?;
        Ok(parse_message(message))
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<Vec<ParsedMessage>, ProviderError> {
        let thread_id = escape_odata(thread_id);
        let list: GraphMessageList = self
            .get_json(self.url(&format!(
                "me/messages?$filter=conversationId eq '{thread_id}'"
            )))
            .await?;
        Ok(list.value.into_iter().map(parse_message).collect())
    }

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError> {
        let list: GraphCategoryList = self
            .get_json(self.url("me/outlook/masterCategories"))
            .await?;
        Ok(list
            .value
            .into_iter()
            .map(|category| Label {
                id: category.id,
                name: category.display_name,
            })
            .collect())
    }

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<(), ProviderError> {
        let label = label_id.to_string();
        self.set_categories(message_id, move |categories| {
            if !categories.contains(&label) {
                categories.push(label);
            }
        })
        .await
    }

    async fn remove_label(&self, message_id: &str, label_id: &str) -> Result<(), ProviderError> {
        let label = label_id.to_string();
        self.set_categories(message_id, move |categories| {
            categories.retain(|existing| existing != &label);
        })
        .await
    }

    async fn archive(&self, message_id: &str) -> Result<(), ProviderError> {
        self.move_to_folder(message_id, "archive").await
    }

    async fn move_to_folder(&self, message_id: &str, folder: &str) -> Result<(), ProviderError> {
        self.post_json(
            self.url(&format!("me/messages/{message_id}/move")),
            json!({ "destinationId": folder }),
        )
        .await?;
        Ok(())
    }

    async fn mark_read(&self, message_id: &str, read: bool) -> Result<(), ProviderError> {
        self.patch_json(
            self.url(&format!("me/messages/{message_id}")),
            json!({ "isRead": read }),
        )
        .await
    }

    async fn send_message(&self, outgoing: &OutgoingMessage) -> Result<(), ProviderError> {
        self.post_json(
            self.url("me/sendMail"),
            json!({ "message": Self::outgoing_payload(outgoing), "saveToSentItems": true }),
        )
        .await?;
        Ok(())
    }

    async fn create_draft(&self, outgoing: &OutgoingMessage) -> Result<(), ProviderError> {
        self.post_json(self.url("me/messages"), Self::outgoing_payload(outgoing))
            .await?;
        Ok(())
    }

    async fn search_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<SearchPage, ProviderError> {
        // Graph paginates with a full continuation URL; the opaque page
        // token is that URL verbatim.
        let url = match page_token {
            Some(next_link) => next_link.to_string(),
            None => {
                let encoded = urlencoding::encode(query);
                self.url(&format!("me/messages?$search=\"{encoded}\"&$top={max_results}"))
            }
        };

        let list: GraphMessageList = self.get_json(url).await?;

        Ok(SearchPage {
            messages: list
                .value
                .into_iter()
                .map(|message| MessageRef {
                    id: message.id,
                    thread_id: message.conversation_id,
                })
                .collect(),
            next_page_token: list.next_link,
        })
    }

    fn is_outbound(&self, account_address: &str, message: &ParsedMessage) -> bool {
        // Graph exposes no sent marker on the message itself; sender equal
        // to the connected address is the outbound heuristic.
        !account_address.is_empty()
            && message
                .from_address()
                .to_lowercase()
                .contains(&account_address.to_lowercase())
    }

    async fn block_sender(&self, message_id: &str, _sender: &str) -> Result<(), ProviderError> {
        self.move_to_folder(message_id, JUNK_FOLDER).await
    }

    async fn watch(&self) -> Result<String, ProviderError> {
        let response = self
            .post_json(
                self.url("subscriptions"),
                json!({
                    "changeType": "created",
                    "resource": "me/mailFolders('inbox')/messages",
                    "notificationUrl": self.notification_url.clone().unwrap_or_default(),
                }),
            )
            .await?;
        let subscription: GraphSubscription = response.json().await?;
        Ok(subscription.id)
    }

    async fn unwatch(&self, handle: &str) -> Result<(), ProviderError> {
        let response = self
            .http
            .delete(self.url(&format!("subscriptions/{handle}")))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    fn example_search_query(
        &self,
        clauses: &[SearchClause],
        window: Option<&DateWindow>,
    ) -> String {
        let mut query = clauses
            .iter()
            .map(|clause| match clause.field {
                SearchField::From => format!("from:\"{}\"", clause.value),
                SearchField::Subject => format!("subject:\"{}\"", clause.value),
            })
            .collect::<Vec<_>>()
            .join(" OR ");

        if let Some(window) = window {
            if let Some(after) = window.after {
                query.push_str(&format!(" AND received>={}", after.format("%Y-%m-%d")));
            }
            if let Some(before) = window.before {
                query.push_str(&format!(" AND received<={}", before.format("%Y-%m-%d")));
            }
        }

        query
    }
}
