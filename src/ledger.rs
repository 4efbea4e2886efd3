//! Idempotent execution ledger.
//!
//! One row per (account, thread, message). The UNIQUE constraint on that key
//! is the sole idempotency guard: a redelivered event conflicts on insert and
//! is treated as already claimed, so no side effect ever runs twice.

use crate::actions::ActionRecord;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This delivery owns the event; a PENDING row now exists.
    Claimed,
    /// A row already exists (PENDING rows from crashed workers included);
    /// the caller must skip all further processing.
    AlreadyHandled,
}

/// Ledger row status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Pending,
    Applied,
    Skipped,
}

impl LedgerStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Applied => "APPLIED",
            Self::Skipped => "SKIPPED",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "APPLIED" => Self::Applied,
            "SKIPPED" => Self::Skipped,
            _ => Self::Pending,
        }
    }
}

/// A terminal or in-flight ledger row.
#[derive(Debug, Clone)]
pub struct ExecutedRule {
    pub account_id: String,
    pub thread_id: Option<String>,
    pub message_id: String,
    /// Matched rule or learned-pattern id. `None` on a no-match row; "no
    /// match" is itself a terminal record.
    pub matched_id: Option<String>,
    pub status: LedgerStatus,
    pub actions: Vec<ActionRecord>,
    pub created_at: DateTime<Utc>,
}

pub struct ExecutionLedger {
    pool: SqlitePool,
}

impl std::fmt::Debug for ExecutionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLedger")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl ExecutionLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Cheap existence check for the router's early-exit step. The atomic
    /// claim happens in [`try_claim`](Self::try_claim).
    pub async fn is_handled(
        &self,
        account_id: &str,
        thread_id: Option<&str>,
        message_id: &str,
    ) -> crate::Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT 1 FROM executed_rules
            WHERE account_id = ? AND thread_id = ? AND message_id = ?
            "#,
        )
        .bind(account_id)
        .bind(thread_key(thread_id))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Atomically claim the event by inserting a PENDING row. Insert
    /// conflict means another delivery got there first.
    pub async fn try_claim(
        &self,
        account_id: &str,
        thread_id: Option<&str>,
        message_id: &str,
    ) -> crate::Result<Claim> {
        let result = sqlx::query(
            r#"
            INSERT INTO executed_rules
                (id, account_id, thread_id, message_id, matched_id, status, actions, created_at)
            VALUES (?, ?, ?, ?, NULL, 'PENDING', '[]', ?)
            ON CONFLICT(account_id, thread_id, message_id) DO NOTHING
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(thread_key(thread_id))
        .bind(message_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to claim event for message {message_id}"))?;

        if result.rows_affected() == 0 {
            Ok(Claim::AlreadyHandled)
        } else {
            Ok(Claim::Claimed)
        }
    }

    /// Transition the claimed row to APPLIED with the actions actually run.
    pub async fn mark_applied(
        &self,
        account_id: &str,
        thread_id: Option<&str>,
        message_id: &str,
        matched_id: &str,
        actions: &[ActionRecord],
    ) -> crate::Result<()> {
        let actions_json =
            serde_json::to_string(actions).context("failed to serialize action records")?;

        sqlx::query(
            r#"
            UPDATE executed_rules
            SET status = 'APPLIED', matched_id = ?, actions = ?
            WHERE account_id = ? AND thread_id = ? AND message_id = ?
            "#,
        )
        .bind(matched_id)
        .bind(actions_json)
        .bind(account_id)
        .bind(thread_key(thread_id))
        .bind(message_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark message {message_id} applied"))?;

        Ok(())
    }

    /// Transition the claimed row to SKIPPED: no rule or pattern matched.
    pub async fn mark_skipped(
        &self,
        account_id: &str,
        thread_id: Option<&str>,
        message_id: &str,
    ) -> crate::Result<()> {
        sqlx::query(
            r#"
            UPDATE executed_rules
            SET status = 'SKIPPED'
            WHERE account_id = ? AND thread_id = ? AND message_id = ?
            "#,
        )
        .bind(account_id)
        .bind(thread_key(thread_id))
        .bind(message_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to mark message {message_id} skipped"))?;

        Ok(())
    }

    /// Load a ledger row by key.
    pub async fn load(
        &self,
        account_id: &str,
        thread_id: Option<&str>,
        message_id: &str,
    ) -> crate::Result<Option<ExecutedRule>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, thread_id, message_id, matched_id, status, actions, created_at
            FROM executed_rules
            WHERE account_id = ? AND thread_id = ? AND message_id = ?
            "#,
        )
        .bind(account_id)
        .bind(thread_key(thread_id))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_executed_rule).transpose()?)
    }
}

/// Events without a thread id share an empty-string sentinel so the UNIQUE
/// key still applies (SQLite treats NULLs as distinct in unique indexes).
fn thread_key(thread_id: Option<&str>) -> &str {
    thread_id.unwrap_or("")
}

fn row_to_executed_rule(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<ExecutedRule> {
    let status_str: String = row.try_get("status")?;
    let actions_json: String = row.try_get("actions")?;
    let actions =
        serde_json::from_str(&actions_json).context("failed to parse ledger action records")?;
    let thread_id: String = row.try_get("thread_id")?;

    Ok(ExecutedRule {
        account_id: row.try_get("account_id")?,
        thread_id: (!thread_id.is_empty()).then_some(thread_id),
        message_id: row.try_get("message_id")?,
        matched_id: row.try_get("matched_id")?,
        status: LedgerStatus::parse(&status_str),
        actions,
        created_at: row.try_get("created_at")?,
    })
}
