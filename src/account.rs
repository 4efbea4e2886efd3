//! Connected mailbox accounts and their capability flags.
//!
//! Accounts are created on OAuth connect and mutated by the settings UI,
//! both outside this core. Everything here is read-only.

use crate::provider::ProviderKind;

use anyhow::Context as _;
use sqlx::{Row, SqlitePool};

/// A connected mailbox identity.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub provider: ProviderKind,
    pub email_address: String,
    pub automation_enabled: bool,
    pub ai_access_enabled: bool,
    pub auto_categorize_senders: bool,
    pub filing_enabled: bool,
}

/// Read-only access to accounts and the product tables the router consults
/// (unsubscribed senders, sender categories).
pub struct AccountStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for AccountStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl AccountStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load an account by id.
    pub async fn load(&self, account_id: &str) -> crate::Result<Option<Account>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, provider, email_address, automation_enabled,
                   ai_access_enabled, auto_categorize_senders, filing_enabled
            FROM accounts
            WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_account).transpose()?)
    }

    /// Whether the account previously unsubscribed from this sender.
    pub async fn is_unsubscribed(&self, account_id: &str, sender: &str) -> crate::Result<bool> {
        let address = extract_address(sender);
        let row = sqlx::query(
            "SELECT 1 FROM unsubscribed_senders WHERE account_id = ? AND address = ?",
        )
        .bind(account_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Whether a category has already been assigned to this sender.
    pub async fn is_sender_categorized(
        &self,
        account_id: &str,
        sender: &str,
    ) -> crate::Result<bool> {
        let address = extract_address(sender);
        let row =
            sqlx::query("SELECT 1 FROM sender_categories WHERE account_id = ? AND address = ?")
                .bind(account_id)
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }
}

fn row_to_account(row: sqlx::sqlite::SqliteRow) -> anyhow::Result<Account> {
    let provider_str: String = row.try_get("provider")?;
    let provider = ProviderKind::parse(&provider_str)
        .with_context(|| format!("unknown provider kind '{provider_str}'"))?;

    Ok(Account {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        provider,
        email_address: row.try_get("email_address")?,
        automation_enabled: row.try_get("automation_enabled")?,
        ai_access_enabled: row.try_get("ai_access_enabled")?,
        auto_categorize_senders: row.try_get("auto_categorize_senders")?,
        filing_enabled: row.try_get("filing_enabled")?,
    })
}

/// Pull the bare address out of a possibly display-name-qualified header
/// value, lowercased.
pub fn extract_address(sender: &str) -> String {
    let sender = sender.trim();
    if let (Some(start), Some(end)) = (sender.rfind('<'), sender.rfind('>')) {
        if start < end {
            return sender[start + 1..end].trim().to_lowercase();
        }
    }
    sender.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::extract_address;

    #[test]
    fn extract_address_strips_display_name() {
        assert_eq!(
            extract_address("Promo Desk <PROMO@shop.com>"),
            "promo@shop.com"
        );
        assert_eq!(extract_address("promo@shop.com"), "promo@shop.com");
        assert_eq!(extract_address("  Plain Name  "), "plain name");
    }
}
