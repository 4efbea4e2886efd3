//! Historical example retrieval for rules under construction.
//!
//! Given a set of sender/subject fragments ("group items") and an optional
//! date window, returns pages of real messages that match at least one item.
//! Items are walked by kind (FROM before SUBJECT) in fixed-size chunks, one
//! OR-ed provider query per chunk, with the provider's superset results
//! re-filtered locally. The cursor is opaque to callers and embeds a hash of
//! the item set; editing the items invalidates the cursor silently.

use crate::account::AccountStore;
use crate::config::HistoryConfig;
use crate::error::ProviderError;
use crate::patterns;
use crate::provider::{
    DateWindow, MailProvider, ParsedMessage, ProviderRegistry, SearchClause, SearchField,
};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

/// Kind of fragment a group item matches on. FROM items are traversed
/// before SUBJECT items, always.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupItemKind {
    From,
    Subject,
}

impl GroupItemKind {
    fn search_field(self) -> SearchField {
        match self {
            Self::From => SearchField::From,
            Self::Subject => SearchField::Subject,
        }
    }
}

/// A sender or subject fragment belonging to a rule's group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupItem {
    pub kind: GroupItemKind,
    pub value: String,
}

/// Internal pagination state, serialized opaquely into the cursor string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorState {
    kind: GroupItemKind,
    chunk_index: usize,
    #[serde(default)]
    page_token: Option<String>,
    items_hash: String,
}

/// One page of matching examples. `cursor` is `None` once the traversal is
/// complete.
#[derive(Debug, Clone)]
pub struct ExamplePage {
    pub messages: Vec<ParsedMessage>,
    pub cursor: Option<String>,
}

pub struct ExampleRetriever {
    page_size: usize,
}

impl ExampleRetriever {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
        }
    }

    /// Fetch the next page of examples.
    ///
    /// A cursor whose embedded hash no longer matches the supplied item set
    /// is discarded and the traversal restarts from FROM, chunk 0. Stale
    /// cursors never error.
    pub async fn fetch_page(
        &self,
        provider: &dyn MailProvider,
        items: &[GroupItem],
        window: Option<&DateWindow>,
        cursor: Option<&str>,
    ) -> Result<ExamplePage, ProviderError> {
        let ordered = order_items(items);
        let hash = items_hash(&ordered);

        let mut state = match cursor.and_then(decode_cursor) {
            Some(state) if state.items_hash == hash => state,
            Some(_) => {
                tracing::debug!("group items changed, restarting pagination");
                initial_state(&hash)
            }
            None => initial_state(&hash),
        };

        let mut collected: Vec<ParsedMessage> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        loop {
            let Some(normalized) = normalize_state(state, &ordered, self.page_size) else {
                return Ok(ExamplePage {
                    messages: collected,
                    cursor: None,
                });
            };
            state = normalized;

            let (chunk_start, chunk) = chunk_at(&ordered, state.kind, state.chunk_index, self.page_size);

            let clauses: Vec<SearchClause> = chunk
                .iter()
                .map(|item| SearchClause {
                    field: item.kind.search_field(),
                    value: item.value.clone(),
                })
                .collect();
            let query = provider.example_search_query(&clauses, window);

            let page = provider
                .search_messages(&query, state.page_token.as_deref(), self.page_size)
                .await?;

            // Full bodies, fetched together; messages deleted since the
            // search are skipped, not errors.
            let fetches = page
                .messages
                .iter()
                .map(|reference| provider.fetch_message(&reference.id));
            for result in join_all(fetches).await {
                let message = match result {
                    Ok(message) => message,
                    Err(ProviderError::NotFound) => continue,
                    Err(error) => return Err(error),
                };

                // Provider search is a superset match; keep only messages
                // that actually match an item, attributed to their first
                // matching item so no message repeats across chunks.
                let Some(item_index) = first_matching_item(&ordered, &message) else {
                    continue;
                };
                let in_chunk = item_index >= chunk_start && item_index < chunk_start + chunk.len();
                if in_chunk && seen.insert(message.id.clone()) {
                    collected.push(message);
                }
            }

            if let Some(token) = page.next_page_token {
                // Same chunk, resumed mid-stream on the next call.
                state.page_token = Some(token);
                return Ok(ExamplePage {
                    messages: collected,
                    cursor: Some(encode_cursor(&state)),
                });
            }

            state.chunk_index += 1;
            state.page_token = None;

            if !collected.is_empty() {
                let cursor = normalize_state(state, &ordered, self.page_size)
                    .as_ref()
                    .map(encode_cursor);
                return Ok(ExamplePage {
                    messages: collected,
                    cursor,
                });
            }
        }
    }
}

/// Account-aware front door for example retrieval: resolves the provider for
/// the account and pages with the configured page size.
pub struct ExampleService {
    accounts: AccountStore,
    registry: Arc<dyn ProviderRegistry>,
    retriever: ExampleRetriever,
}

impl ExampleService {
    pub fn new(
        accounts: AccountStore,
        registry: Arc<dyn ProviderRegistry>,
        config: &HistoryConfig,
    ) -> Self {
        Self {
            accounts,
            registry,
            retriever: ExampleRetriever::new(config.page_size),
        }
    }

    pub async fn fetch_page(
        &self,
        account_id: &str,
        items: &[GroupItem],
        window: Option<&DateWindow>,
        cursor: Option<&str>,
    ) -> crate::Result<ExamplePage> {
        let Some(account) = self.accounts.load(account_id).await? else {
            return Err(crate::PipelineError::UnknownAccount(account_id.to_string()));
        };
        let provider = self.registry.provider_for(&account).await?;

        Ok(self
            .retriever
            .fetch_page(provider.as_ref(), items, window, cursor)
            .await?)
    }
}

fn initial_state(hash: &str) -> CursorState {
    CursorState {
        kind: GroupItemKind::From,
        chunk_index: 0,
        page_token: None,
        items_hash: hash.to_string(),
    }
}

/// FROM items first, then SUBJECT, each preserving input order.
fn order_items(items: &[GroupItem]) -> Vec<GroupItem> {
    let mut ordered: Vec<GroupItem> = items
        .iter()
        .filter(|item| item.kind == GroupItemKind::From)
        .cloned()
        .collect();
    ordered.extend(
        items
            .iter()
            .filter(|item| item.kind == GroupItemKind::Subject)
            .cloned(),
    );
    ordered
}

fn items_of_kind(ordered: &[GroupItem], kind: GroupItemKind) -> (usize, usize) {
    let start = ordered
        .iter()
        .position(|item| item.kind == kind)
        .unwrap_or(ordered.len());
    let count = ordered.iter().filter(|item| item.kind == kind).count();
    (start, count)
}

/// Skip exhausted kinds. `None` means the whole traversal is complete.
fn normalize_state(
    mut state: CursorState,
    ordered: &[GroupItem],
    page_size: usize,
) -> Option<CursorState> {
    loop {
        let (_, count) = items_of_kind(ordered, state.kind);
        let chunk_count = count.div_ceil(page_size);
        if state.chunk_index < chunk_count {
            return Some(state);
        }

        match state.kind {
            GroupItemKind::From => {
                state.kind = GroupItemKind::Subject;
                state.chunk_index = 0;
                state.page_token = None;
            }
            GroupItemKind::Subject => return None,
        }
    }
}

/// The chunk's slice plus its starting index in the ordered item list.
fn chunk_at(
    ordered: &[GroupItem],
    kind: GroupItemKind,
    chunk_index: usize,
    page_size: usize,
) -> (usize, &[GroupItem]) {
    let (kind_start, count) = items_of_kind(ordered, kind);
    let start = kind_start + chunk_index * page_size;
    let end = (start + page_size).min(kind_start + count);
    (start, &ordered[start..end])
}

fn first_matching_item(ordered: &[GroupItem], message: &ParsedMessage) -> Option<usize> {
    ordered.iter().position(|item| match item.kind {
        GroupItemKind::From => patterns::matches_from(&item.value, message.from_address()),
        GroupItemKind::Subject => patterns::matches_subject(&item.value, message.subject()),
    })
}

fn items_hash(ordered: &[GroupItem]) -> String {
    let mut hasher = Sha256::new();
    for item in ordered {
        let kind = match item.kind {
            GroupItemKind::From => "from",
            GroupItemKind::Subject => "subject",
        };
        hasher.update(kind.as_bytes());
        hasher.update(b":");
        hasher.update(item.value.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn encode_cursor(state: &CursorState) -> String {
    let json = serde_json::to_vec(state).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

fn decode_cursor(cursor: &str) -> Option<CursorState> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::provider::{Label, MessageRef, OutgoingMessage, ProviderKind, SearchPage};
    use crate::testing::memory_pool;

    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Provider stub with scripted search pages and an in-memory message map.
    #[derive(Default)]
    struct ScriptedProvider {
        messages: HashMap<String, ParsedMessage>,
        /// Pages keyed by (query, page_token).
        pages: HashMap<(String, Option<String>), SearchPage>,
        queries: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedProvider {
        fn message(mut self, id: &str, from: &str, subject: &str) -> Self {
            let mut message = ParsedMessage {
                id: id.to_string(),
                ..ParsedMessage::default()
            };
            message.headers.insert("from".into(), from.to_string());
            message.headers.insert("subject".into(), subject.to_string());
            self.messages.insert(id.to_string(), message);
            self
        }

        fn page(mut self, query: &str, token: Option<&str>, ids: &[&str], next: Option<&str>) -> Self {
            self.pages.insert(
                (query.to_string(), token.map(str::to_string)),
                SearchPage {
                    messages: ids
                        .iter()
                        .map(|id| MessageRef {
                            id: (*id).to_string(),
                            thread_id: None,
                        })
                        .collect(),
                    next_page_token: next.map(str::to_string),
                },
            );
            self
        }
    }

    #[async_trait]
    impl MailProvider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Gmail
        }

        async fn fetch_message(&self, message_id: &str) -> Result<ParsedMessage, ProviderError> {
            self.messages
                .get(message_id)
                .cloned()
                .ok_or(ProviderError::NotFound)
        }

        async fn fetch_thread(&self, _thread_id: &str) -> Result<Vec<ParsedMessage>, ProviderError> {
            Ok(Vec::new())
        }

        async fn list_labels(&self) -> Result<Vec<Label>, ProviderError> {
            Ok(Vec::new())
        }

        async fn apply_label(&self, _m: &str, _l: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn remove_label(&self, _m: &str, _l: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn archive(&self, _m: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn move_to_folder(&self, _m: &str, _f: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn mark_read(&self, _m: &str, _r: bool) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn send_message(&self, _o: &OutgoingMessage) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn create_draft(&self, _o: &OutgoingMessage) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn search_messages(
            &self,
            query: &str,
            page_token: Option<&str>,
            _max_results: usize,
        ) -> Result<SearchPage, ProviderError> {
            let key = (query.to_string(), page_token.map(str::to_string));
            self.queries.lock().unwrap().push(key.clone());
            Ok(self.pages.get(&key).cloned().unwrap_or_default())
        }

        fn is_outbound(&self, _a: &str, _m: &ParsedMessage) -> bool {
            false
        }

        async fn block_sender(&self, _m: &str, _s: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn watch(&self) -> Result<String, ProviderError> {
            Ok(String::new())
        }

        async fn unwatch(&self, _h: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        fn example_search_query(
            &self,
            clauses: &[SearchClause],
            _window: Option<&DateWindow>,
        ) -> String {
            clauses
                .iter()
                .map(|clause| match clause.field {
                    SearchField::From => format!("from:{}", clause.value),
                    SearchField::Subject => format!("subject:{}", clause.value),
                })
                .collect::<Vec<_>>()
                .join(" OR ")
        }
    }

    fn from_item(value: &str) -> GroupItem {
        GroupItem {
            kind: GroupItemKind::From,
            value: value.to_string(),
        }
    }

    fn subject_item(value: &str) -> GroupItem {
        GroupItem {
            kind: GroupItemKind::Subject,
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn traversal_visits_from_before_subject_and_terminates() {
        let provider = ScriptedProvider::default()
            .message("m1", "news@shop.com", "Weekly digest")
            .message("m2", "other@corp.example", "Invoice 12")
            .page("from:shop.com", None, &["m1"], None)
            .page("subject:Invoice", None, &["m2"], None);

        let retriever = ExampleRetriever::new(10);
        let items = vec![from_item("shop.com"), subject_item("Invoice")];

        let first = retriever
            .fetch_page(&provider, &items, None, None)
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.messages[0].id, "m1");
        let cursor = first.cursor.expect("subject chunk still pending");

        let second = retriever
            .fetch_page(&provider, &items, None, Some(&cursor))
            .await
            .unwrap();
        assert_eq!(second.messages.len(), 1);
        assert_eq!(second.messages[0].id, "m2");
        assert!(second.cursor.is_none(), "traversal complete");

        let queries = provider.queries.lock().unwrap();
        assert_eq!(
            *queries,
            vec![
                ("from:shop.com".to_string(), None),
                ("subject:Invoice".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn provider_continuation_resumes_the_same_chunk() {
        let provider = ScriptedProvider::default()
            .message("m1", "news@shop.com", "A")
            .message("m2", "promo@shop.com", "B")
            .page("from:shop.com", None, &["m1"], Some("tok-1"))
            .page("from:shop.com", Some("tok-1"), &["m2"], None);

        let retriever = ExampleRetriever::new(10);
        let items = vec![from_item("shop.com")];

        let first = retriever
            .fetch_page(&provider, &items, None, None)
            .await
            .unwrap();
        assert_eq!(first.messages[0].id, "m1");
        let cursor = first.cursor.expect("mid-chunk cursor");

        // The re-emitted cursor stays on chunk 0 and carries the token.
        let state = decode_cursor(&cursor).unwrap();
        assert_eq!(state.kind, GroupItemKind::From);
        assert_eq!(state.chunk_index, 0);
        assert_eq!(state.page_token.as_deref(), Some("tok-1"));

        let second = retriever
            .fetch_page(&provider, &items, None, Some(&cursor))
            .await
            .unwrap();
        assert_eq!(second.messages[0].id, "m2");
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn superset_results_are_refiltered_locally() {
        // Provider returns m2 for the shop.com query even though its sender
        // does not actually match; the local re-filter drops it.
        let provider = ScriptedProvider::default()
            .message("m1", "news@shop.com", "A")
            .message("m2", "unrelated@corp.example", "A")
            .page("from:shop.com", None, &["m1", "m2"], None);

        let retriever = ExampleRetriever::new(10);
        let items = vec![from_item("shop.com")];

        let page = retriever
            .fetch_page(&provider, &items, None, None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, "m1");
    }

    #[tokio::test]
    async fn vanished_search_hits_are_skipped() {
        let provider = ScriptedProvider::default()
            .message("m1", "news@shop.com", "A")
            .page("from:shop.com", None, &["ghost", "m1"], None);

        let retriever = ExampleRetriever::new(10);
        let items = vec![from_item("shop.com")];

        let page = retriever
            .fetch_page(&provider, &items, None, None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, "m1");
    }

    #[tokio::test]
    async fn message_matching_items_in_two_chunks_is_returned_once() {
        // m1 matches both the FROM item and the SUBJECT item; attribution to
        // the first matching item keeps it out of the subject chunk.
        let provider = ScriptedProvider::default()
            .message("m1", "news@shop.com", "Invoice 42")
            .page("from:shop.com", None, &["m1"], None)
            .page("subject:Invoice", None, &["m1"], None);

        let retriever = ExampleRetriever::new(10);
        let items = vec![from_item("shop.com"), subject_item("Invoice")];

        let first = retriever
            .fetch_page(&provider, &items, None, None)
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 1);
        let cursor = first.cursor.unwrap();

        let second = retriever
            .fetch_page(&provider, &items, None, Some(&cursor))
            .await
            .unwrap();
        assert!(second.messages.is_empty());
        assert!(second.cursor.is_none());
    }

    #[tokio::test]
    async fn stale_cursor_restarts_from_the_beginning() {
        let provider = ScriptedProvider::default()
            .message("m1", "news@shop.com", "A")
            .page("from:shop.com", None, &["m1"], None);

        let retriever = ExampleRetriever::new(10);

        // Cursor built against a different item set.
        let old_items = vec![from_item("old.example")];
        let stale = encode_cursor(&CursorState {
            kind: GroupItemKind::Subject,
            chunk_index: 3,
            page_token: Some("tok".to_string()),
            items_hash: items_hash(&order_items(&old_items)),
        });

        let items = vec![from_item("shop.com")];
        let page = retriever
            .fetch_page(&provider, &items, None, Some(&stale))
            .await
            .unwrap();

        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, "m1");
        let queries = provider.queries.lock().unwrap();
        assert_eq!(queries[0], ("from:shop.com".to_string(), None));
    }

    #[tokio::test]
    async fn garbage_cursor_is_treated_as_no_cursor() {
        let provider = ScriptedProvider::default()
            .message("m1", "news@shop.com", "A")
            .page("from:shop.com", None, &["m1"], None);

        let retriever = ExampleRetriever::new(10);
        let items = vec![from_item("shop.com")];

        let page = retriever
            .fetch_page(&provider, &items, None, Some("!!not-base64!!"))
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
    }

    #[tokio::test]
    async fn items_are_chunked_by_page_size() {
        // Three FROM items with page_size 2: chunk 0 = [a, b], chunk 1 = [c].
        let provider = ScriptedProvider::default()
            .message("m1", "x@a.example", "_")
            .message("m2", "x@c.example", "_")
            .page("from:a.example OR from:b.example", None, &["m1"], None)
            .page("from:c.example", None, &["m2"], None);

        let retriever = ExampleRetriever::new(2);
        let items = vec![
            from_item("a.example"),
            from_item("b.example"),
            from_item("c.example"),
        ];

        let first = retriever
            .fetch_page(&provider, &items, None, None)
            .await
            .unwrap();
        assert_eq!(first.messages[0].id, "m1");

        let second = retriever
            .fetch_page(&provider, &items, None, first.cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.messages[0].id, "m2");
        assert!(second.cursor.is_none());
    }

    struct StubRegistry {
        provider: Arc<ScriptedProvider>,
    }

    #[async_trait]
    impl ProviderRegistry for StubRegistry {
        async fn provider_for(&self, _account: &Account) -> crate::Result<Arc<dyn MailProvider>> {
            Ok(self.provider.clone())
        }
    }

    #[tokio::test]
    async fn service_pages_with_the_configured_page_size() {
        let pool = memory_pool().await;
        sqlx::query(
            r#"
            INSERT INTO accounts
                (id, user_id, provider, email_address, automation_enabled,
                 ai_access_enabled, auto_categorize_senders, filing_enabled)
            VALUES ('acct', 'user', 'gmail', 'owner@corp.example', 1, 1, 0, 0)
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();

        let provider = Arc::new(
            ScriptedProvider::default()
                .message("m1", "x@a.example", "_")
                .message("m2", "x@c.example", "_")
                .page("from:a.example OR from:b.example", None, &["m1"], None)
                .page("from:c.example", None, &["m2"], None),
        );

        let service = ExampleService::new(
            AccountStore::new(pool),
            Arc::new(StubRegistry {
                provider: provider.clone(),
            }),
            &HistoryConfig { page_size: 2 },
        );

        let items = vec![
            from_item("a.example"),
            from_item("b.example"),
            from_item("c.example"),
        ];

        let first = service.fetch_page("acct", &items, None, None).await.unwrap();
        assert_eq!(first.messages[0].id, "m1");

        let second = service
            .fetch_page("acct", &items, None, first.cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.messages[0].id, "m2");
        assert!(second.cursor.is_none());

        let unknown = service.fetch_page("ghost", &items, None, None).await;
        assert!(matches!(
            unknown,
            Err(crate::PipelineError::UnknownAccount(_))
        ));
    }

    #[test]
    fn hash_is_order_sensitive_within_a_kind() {
        let a = items_hash(&[from_item("one"), from_item("two")]);
        let b = items_hash(&[from_item("two"), from_item("one")]);
        assert_ne!(a, b);
    }
}
