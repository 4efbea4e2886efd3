//! Gmail REST implementation of the provider adapter.
//!
//! Threads are native, labels are the category primitive, and outbound mail
//! carries the `SENT` system label. "Item no longer exists" is an HTTP 404.

use super::{
    AttachmentRef, DateWindow, Label, MailProvider, MessageRef, OutgoingMessage, ParsedMessage,
    ProviderKind, SearchClause, SearchField, SearchPage,
};
use crate::error::ProviderError;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::Deserialize;
use serde_json::json;

const UNREAD_LABEL: &str = "UNREAD";
const INBOX_LABEL: &str = "INBOX";
const SENT_LABEL: &str = "SENT";
const SPAM_LABEL: &str = "SPAM";

pub struct GmailProvider {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    watch_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    payload: Option<GmailPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    headers: Vec<GmailHeader>,
    #[serde(default)]
    body: Option<GmailBody>,
    #[serde(default)]
    parts: Vec<GmailPart>,
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    #[serde(default)]
    attachment_id: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailThread {
    #[serde(default)]
    messages: Vec<GmailMessage>,
}

#[derive(Debug, Deserialize)]
struct GmailLabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailSearchResponse {
    #[serde(default)]
    messages: Vec<GmailSearchEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailSearchEntry {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailWatchResponse {
    #[serde(default, rename = "historyId")]
    history_id: Option<String>,
}

impl GmailProvider {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        access_token: String,
        watch_topic: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url,
            access_token,
            watch_topic,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/gmail/v1/users/me/{path}",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound);
        }

        let message = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .query(query)
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

    async fn modify_labels(
        &self,
        message_id: &str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), ProviderError> {
        self.post_json(
            self.url(&format!("messages/{message_id}/modify")),
            json!({ "addLabelIds": add, "removeLabelIds": remove }),
        )
        .await?;
        Ok(())
    }

    /// Build a minimal RFC 2822 payload and encode it the way the Gmail API
    /// expects (URL-safe base64 in the `raw` field). Header values come from
    /// rule-engine output, so line breaks are flattened before they can
    /// smuggle in extra headers.
    fn encode_raw(outgoing: &OutgoingMessage) -> String {
        let mut raw = String::new();
        raw.push_str(&format!("To: {}\r\n", header_value(&outgoing.to.join(", "))));
        raw.push_str(&format!("Subject: {}\r\n", header_value(&outgoing.subject)));
        if let Some(in_reply_to) = &outgoing.in_reply_to {
            let in_reply_to = header_value(in_reply_to);
            raw.push_str(&format!("In-Reply-To: {in_reply_to}\r\n"));
            raw.push_str(&format!("References: {in_reply_to}\r\n"));
        }
        raw.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n");
        raw.push_str(&outgoing.body);

        URL_SAFE_NO_PAD.encode(raw)
    }
}

/// Collapse any line breaks in a header value to a single space.
fn header_value(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Flatten the Gmail payload tree into the normalized message shape.
fn parse_message(message: GmailMessage) -> ParsedMessage {
    let mut parsed = ParsedMessage {
        id: message.id,
        thread_id: message.thread_id,
        labels: message.label_ids,
        ..ParsedMessage::default()
    };

    let Some(payload) = message.payload else {
        return parsed;
    };

    for header in &payload.headers {
        parsed
            .headers
            .insert(header.name.to_lowercase(), header.value.clone());
    }

    collect_parts(&payload, &mut parsed);
    parsed
}

fn collect_parts(part: &GmailPart, parsed: &mut ParsedMessage) {
    let mime_type = part.mime_type.as_deref().unwrap_or_default();
    let filename = part.filename.as_deref().unwrap_or_default();

    if let Some(body) = &part.body {
        if let Some(attachment_id) = &body.attachment_id {
            if !filename.is_empty() {
                parsed.attachments.push(AttachmentRef {
                    filename: filename.to_string(),
                    mime_type: mime_type.to_string(),
                    size: body.size,
                    content_locator: attachment_id.clone(),
                });
            }
        } else if let Some(data) = &body.data {
            let decoded = URL_SAFE_NO_PAD
                .decode(data)
                .or_else(|_| STANDARD.decode(data))
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());

            if let Some(text) = decoded {
                match mime_type {
                    "text/plain" if parsed.text_body.is_none() => parsed.text_body = Some(text),
                    "text/html" if parsed.html_body.is_none() => parsed.html_body = Some(text),
                    _ => {}
                }
            }
        }
    }

    for child in &part.parts {
        collect_parts(child, parsed);
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn fetch_message(&self, message_id: &str) -> Result<ParsedMessage, ProviderError> {
        let message: GmailMessage = self
            .get_json(
                self.url(&format!("messages/{message_id}")),
                &[("format", "full".to_string())],
            )
            .await?;
        Ok(parse_message(message))
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<Vec<ParsedMessage>, ProviderError> {
        let thread: GmailThread = self
            .get_json(
                self.url(&format!("threads/{thread_id}")),
                &[("format", "full".to_string())],
            )
            .await?;
        Ok(thread.messages.into_iter().map(parse_message).collect())
    }

    async fn list_labels(&self) -> Result<Vec<Label>, ProviderError> {
        let list: GmailLabelList = self.get_json(self.url("labels"), &[]).await?;
        Ok(list
            .labels
            .into_iter()
            .map(|label| Label {
                id: label.id,
                name: label.name,
            })
            .collect())
    }

    async fn apply_label(&self, message_id: &str, label_id: &str) -> Result<(), ProviderError> {
        self.modify_labels(message_id, &[label_id], &[]).await
    }

    async fn remove_label(&self, message_id: &str, label_id: &str) -> Result<(), ProviderError> {
        self.modify_labels(message_id, &[], &[label_id]).await
    }

    async fn archive(&self, message_id: &str) -> Result<(), ProviderError> {
        self.modify_labels(message_id, &[], &[INBOX_LABEL]).await
    }

    async fn move_to_folder(&self, message_id: &str, folder: &str) -> Result<(), ProviderError> {
        // Gmail has no folders; a move is a label swap out of the inbox,
        // except for trash which has a dedicated endpoint.
        if folder.eq_ignore_ascii_case("trash") {
            self.post_json(self.url(&format!("messages/{message_id}/trash")), json!({}))
                .await?;
            return Ok(());
        }

        self.modify_labels(message_id, &[folder], &[INBOX_LABEL])
            .await
    }

    async fn mark_read(&self, message_id: &str, read: bool) -> Result<(), ProviderError> {
        if read {
            self.modify_labels(message_id, &[], &[UNREAD_LABEL]).await
        } else {
            self.modify_labels(message_id, &[UNREAD_LABEL], &[]).await
        }
    }

    async fn send_message(&self, outgoing: &OutgoingMessage) -> Result<(), ProviderError> {
        self.post_json(
            self.url("messages/send"),
            json!({ "raw": Self::encode_raw(outgoing) }),
        )
        .await?;
        Ok(())
    }

    async fn create_draft(&self, outgoing: &OutgoingMessage) -> Result<(), ProviderError> {
        self.post_json(
            self.url("drafts"),
            json!({ "message": { "raw": Self::encode_raw(outgoing) } }),
        )
        .await?;
        Ok(())
    }

    async fn search_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<SearchPage, ProviderError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", max_results.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response: GmailSearchResponse = self.get_json(self.url("messages"), &params).await?;

        Ok(SearchPage {
            messages: response
                .messages
                .into_iter()
                .map(|entry| MessageRef {
                    id: entry.id,
                    thread_id: entry.thread_id,
                })
                .collect(),
            next_page_token: response.next_page_token,
        })
    }

    fn is_outbound(&self, account_address: &str, message: &ParsedMessage) -> bool {
        if message.labels.iter().any(|label| label == SENT_LABEL) {
            return true;
        }

        !account_address.is_empty()
            && message
                .from_address()
                .to_lowercase()
                .contains(&account_address.to_lowercase())
    }

    async fn block_sender(&self, message_id: &str, _sender: &str) -> Result<(), ProviderError> {
        self.modify_labels(message_id, &[SPAM_LABEL], &[INBOX_LABEL])
            .await
    }

    async fn watch(&self) -> Result<String, ProviderError> {
        let topic = self.watch_topic.clone().unwrap_or_default();
        let response = self
            .post_json(self.url("watch"), json!({ "topicName": topic }))
            .await?;
        let watch: GmailWatchResponse = response.json().await?;
        Ok(watch.history_id.unwrap_or_default())
    }

    async fn unwatch(&self, _handle: &str) -> Result<(), ProviderError> {
        self.post_json(self.url("stop"), json!({})).await?;
        Ok(())
    }

    fn example_search_query(
        &self,
        clauses: &[SearchClause],
        window: Option<&DateWindow>,
    ) -> String {
        let ored = clauses
            .iter()
            .map(|clause| match clause.field {
                SearchField::From => format!("from:\"{}\"", clause.value),
                SearchField::Subject => format!("subject:\"{}\"", clause.value),
            })
            .collect::<Vec<_>>()
            .join(" OR ");

        let mut query = if clauses.len() > 1 {
            format!("({ored})")
        } else {
            ored
        };

        if let Some(window) = window {
            if let Some(after) = window.after {
                query.push_str(&format!(" after:{}", after.format("%Y/%m/%d")));
            }
            if let Some(before) = window.before {
                query.push_str(&format!(" before:{}", before.format("%Y/%m/%d")));
            }
        }

        query
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn provider() -> GmailProvider {
        GmailProvider::new(
            reqwest::Client::new(),
            "https://gmail.test".to_string(),
            "token".to_string(),
            None,
        )
    }

    #[test]
    fn example_query_ors_quoted_clauses_with_window() {
        let query = provider().example_search_query(
            &[
                SearchClause {
                    field: SearchField::From,
                    value: "shop.com".to_string(),
                },
                SearchClause {
                    field: SearchField::Subject,
                    value: "Order".to_string(),
                },
            ],
            Some(&DateWindow {
                after: NaiveDate::from_ymd_opt(2024, 1, 1),
                before: NaiveDate::from_ymd_opt(2024, 6, 30),
            }),
        );

        assert_eq!(
            query,
            "(from:\"shop.com\" OR subject:\"Order\") after:2024/01/01 before:2024/06/30"
        );
    }

    #[test]
    fn outbound_detection_uses_sent_label_or_own_address() {
        let provider = provider();

        let mut sent = ParsedMessage::default();
        sent.labels.push("SENT".to_string());
        assert!(provider.is_outbound("me@example.com", &sent));

        let mut own = ParsedMessage::default();
        own.headers
            .insert("from".into(), "Me <ME@example.com>".into());
        assert!(provider.is_outbound("me@example.com", &own));
        assert!(!provider.is_outbound("me@example.com", &ParsedMessage::default()));
    }

    #[test]
    fn raw_headers_cannot_be_split_by_embedded_line_breaks() {
        let outgoing = OutgoingMessage {
            to: vec!["victim@example.com".to_string()],
            subject: "Hello\r\nBcc: attacker@evil.example".to_string(),
            body: "body".to_string(),
            in_reply_to: Some("<orig@mail.example>\nX-Injected: 1".to_string()),
        };

        let encoded = GmailProvider::encode_raw(&outgoing);
        let raw = String::from_utf8(URL_SAFE_NO_PAD.decode(encoded).unwrap()).unwrap();

        assert!(raw.contains("Subject: Hello Bcc: attacker@evil.example\r\n"));
        assert!(raw.contains("In-Reply-To: <orig@mail.example> X-Injected: 1\r\n"));
        assert!(!raw.contains("\nBcc:"));
        assert!(!raw.contains("\nX-Injected:"));
    }

    #[test]
    fn parse_message_flattens_nested_parts() {
        let raw: GmailMessage = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "labelIds": ["INBOX", "UNREAD"],
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    { "name": "From", "value": "sender@example.com" },
                    { "name": "Subject", "value": "Hello" }
                ],
                "parts": [
                    {
                        "mimeType": "text/plain",
                        "body": { "size": 5, "data": "aGVsbG8" }
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "invoice.pdf",
                        "body": { "size": 1024, "attachmentId": "att-1" }
                    }
                ]
            }
        }))
        .unwrap();

        let parsed = parse_message(raw);
        assert_eq!(parsed.id, "m1");
        assert_eq!(parsed.thread_id.as_deref(), Some("t1"));
        assert_eq!(parsed.from_address(), "sender@example.com");
        assert_eq!(parsed.text_body.as_deref(), Some("hello"));
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "invoice.pdf");
        assert_eq!(parsed.attachments[0].content_locator, "att-1");
    }
}
