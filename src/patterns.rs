//! Learned-pattern matching: the cheap shortcut consulted before full rule
//! evaluation.
//!
//! Patterns are written by the correction/feedback flow (external) and only
//! read here. Matching is pure; executing a matched pattern's actions is the
//! router's job.

use crate::actions::Action;
use crate::provider::ProviderKind;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::OnceLock;

/// Header field a matcher targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherField {
    From,
    Subject,
}

/// A stored (field, value) matcher. Validated strictly on load; anything
/// malformed is skipped, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Matcher {
    pub field: MatcherField,
    pub value: String,
}

impl Matcher {
    pub fn is_valid(&self) -> bool {
        !self.value.trim().is_empty()
    }
}

/// A learned matcher plus the ordered actions it shortcuts to.
#[derive(Debug, Clone)]
pub struct LearnedPattern {
    pub id: String,
    pub account_id: String,
    pub matcher: Matcher,
    pub actions: Vec<Action>,
    pub created_at: DateTime<Utc>,
}

/// The first matching pattern for a message.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternHit {
    pub pattern_id: String,
    pub matcher: Matcher,
    pub actions: Vec<Action>,
}

/// Find the first pattern matching the message headers. Patterns must be
/// supplied in creation order (ascending); ties were broken by the store's
/// ORDER BY, so first match wins here.
pub fn find_match(patterns: &[LearnedPattern], from: &str, subject: &str) -> Option<PatternHit> {
    for pattern in patterns {
        if !pattern.matcher.is_valid() {
            tracing::debug!(pattern_id = %pattern.id, "skipping malformed matcher");
            continue;
        }

        let hit = match pattern.matcher.field {
            MatcherField::From => matches_from(&pattern.matcher.value, from),
            MatcherField::Subject => matches_subject(&pattern.matcher.value, subject),
        };

        if hit {
            return Some(PatternHit {
                pattern_id: pattern.id.clone(),
                matcher: pattern.matcher.clone(),
                actions: pattern.actions.clone(),
            });
        }
    }

    None
}

/// Case-insensitive bidirectional containment, tolerant of partial addresses
/// vs. display-name-qualified ones.
pub fn matches_from(pattern_value: &str, sender: &str) -> bool {
    let pattern_value = pattern_value.trim().to_lowercase();
    let sender = sender.trim().to_lowercase();
    if pattern_value.is_empty() || sender.is_empty() {
        return false;
    }

    pattern_value.contains(&sender) || sender.contains(&pattern_value)
}

/// Case-insensitive containment, with a second chance after generalizing
/// both sides (so "Order #123" matches a pattern stored as "Order #456").
pub fn matches_subject(pattern_value: &str, subject: &str) -> bool {
    let pattern_value = pattern_value.trim().to_lowercase();
    let subject = subject.trim().to_lowercase();
    if pattern_value.is_empty() {
        return false;
    }

    if subject.contains(&pattern_value) {
        return true;
    }

    let general_pattern = generalize_subject(&pattern_value);
    let general_subject = generalize_subject(&subject);

    !general_pattern.is_empty() && general_subject.contains(&general_pattern)
}

/// Strip the volatile parts of a subject: numeric tokens, bracketed and
/// parenthesized segments, and `#id`-style tokens. Whitespace is collapsed.
pub fn generalize_subject(subject: &str) -> String {
    static VOLATILE: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();

    let volatile = VOLATILE
        .get_or_init(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)|#\w+|\b\d+\b").expect("valid regex"));
    let spaces = SPACES.get_or_init(|| Regex::new(r"\s+").expect("valid regex"));

    let stripped = volatile.replace_all(subject, " ");
    spaces.replace_all(&stripped, " ").trim().to_lowercase()
}

/// Read access to an account's learned patterns.
pub struct PatternStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for PatternStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl PatternStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load patterns for an account, oldest first. Rows whose stored matcher
    /// or action list fails to parse are skipped at debug severity.
    pub async fn load_for_account(
        &self,
        account_id: &str,
        provider: ProviderKind,
        resource: &str,
    ) -> crate::Result<Vec<LearnedPattern>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, matcher, actions, created_at
            FROM learned_patterns
            WHERE account_id = ? AND provider = ? AND resource = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(account_id)
        .bind(provider.as_str())
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;

        let mut patterns = Vec::with_capacity(rows.len());
        for row in rows {
            match row_to_pattern(&row) {
                Ok(pattern) => patterns.push(pattern),
                Err(error) => {
                    let id: String = row.try_get("id").unwrap_or_default();
                    tracing::debug!(pattern_id = %id, %error, "skipping unparsable pattern row");
                }
            }
        }

        Ok(patterns)
    }
}

fn row_to_pattern(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<LearnedPattern> {
    let matcher_json: String = row.try_get("matcher")?;
    let actions_json: String = row.try_get("actions")?;

    Ok(LearnedPattern {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        matcher: serde_json::from_str(&matcher_json)?,
        actions: serde_json::from_str(&actions_json)?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn pattern(id: &str, field: MatcherField, value: &str, minute: u32) -> LearnedPattern {
        LearnedPattern {
            id: id.to_string(),
            account_id: "acct".to_string(),
            matcher: Matcher {
                field,
                value: value.to_string(),
            },
            actions: vec![Action::Archive],
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
        }
    }

    #[test]
    fn subject_generalization_matches_shifting_ids() {
        assert!(matches_subject("Order #456", "Order #123"));
        assert!(!matches_subject("Welcome", "Invoice 789"));
    }

    #[test]
    fn generalize_strips_brackets_parens_and_numbers() {
        assert_eq!(generalize_subject("Order #123"), "order");
        assert_eq!(generalize_subject("[urgent] Build (nightly) 42 failed"), "build failed");
        assert_eq!(generalize_subject("Re: ticket #A12b"), "re: ticket");
    }

    #[test]
    fn from_match_is_bidirectional() {
        // Pattern value contained in the sender.
        assert!(matches_from("example.com", "newsletter@example.com"));
        // Sender contained in the pattern value.
        assert!(matches_from("newsletter@example.com", "example.com"));
        // Neither contains the other.
        assert!(!matches_from("other.org", "newsletter@example.com"));
    }

    #[test]
    fn from_match_tolerates_display_names() {
        assert!(matches_from(
            "shop.com",
            "Promo Desk <promo@shop.com>"
        ));
    }

    #[test]
    fn first_match_by_creation_time_wins() {
        let patterns = vec![
            pattern("older", MatcherField::From, "shop.com", 0),
            pattern("newer", MatcherField::From, "promo@shop.com", 5),
        ];

        let hit = find_match(&patterns, "promo@shop.com", "Sale!").unwrap();
        assert_eq!(hit.pattern_id, "older");
    }

    #[test]
    fn malformed_matchers_are_skipped_not_fatal() {
        let patterns = vec![
            pattern("blank", MatcherField::From, "   ", 0),
            pattern("valid", MatcherField::From, "shop.com", 1),
        ];

        let hit = find_match(&patterns, "promo@shop.com", "").unwrap();
        assert_eq!(hit.pattern_id, "valid");
    }

    #[test]
    fn no_match_returns_none() {
        let patterns = vec![pattern("p1", MatcherField::Subject, "Digest", 0)];
        assert!(find_match(&patterns, "promo@shop.com", "Sale!").is_none());
    }

    #[test]
    fn matcher_json_is_validated_strictly() {
        let valid: Result<Matcher, _> =
            serde_json::from_str(r#"{"field":"from","value":"shop.com"}"#);
        assert!(valid.is_ok());

        let bad_field: Result<Matcher, _> =
            serde_json::from_str(r#"{"field":"body","value":"x"}"#);
        assert!(bad_field.is_err());

        let extra_key: Result<Matcher, _> =
            serde_json::from_str(r#"{"field":"from","value":"x","weight":2}"#);
        assert!(extra_key.is_err());
    }
}
