//! Service configuration.
//!
//! Loaded from a TOML file with environment-variable layering. Deny-lists,
//! alias addresses, and rate limits are all injected here rather than living
//! as module statics, so deployments can swap them and tests can construct
//! them directly.

use anyhow::Context as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for the pipeline service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path. Defaults to `mailrouted.db` under the user data
    /// directory.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailrouted")
        .join("mailrouted.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token required on inbound event posts. `None` disables auth.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            auth_token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8750
}

/// Router classification inputs: deny-lists and special-purpose aliases.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RoutingConfig {
    /// Senders dropped before any other processing. Matched as a
    /// case-insensitive substring of the from header.
    #[serde(default)]
    pub ignored_senders: Vec<String>,
    /// Address suffix identifying mail addressed to the assistant.
    #[serde(default)]
    pub assistant_alias: Option<String>,
    /// Address suffix identifying mail addressed to the filing bot.
    #[serde(default)]
    pub filing_alias: Option<String>,
}

impl RoutingConfig {
    /// Whether a sender address hits the ignored-senders deny-list.
    pub fn is_ignored_sender(&self, sender: &str) -> bool {
        let sender = sender.to_lowercase();
        self.ignored_senders
            .iter()
            .any(|entry| !entry.trim().is_empty() && sender.contains(&entry.trim().to_lowercase()))
    }
}

/// Per-account token bucket for outbound provider actions.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens available per account before refills are needed.
    #[serde(default = "default_burst")]
    pub burst: usize,
    /// Seconds until a spent token is returned to the bucket.
    #[serde(default = "default_refill_secs")]
    pub refill_secs: u64,
    /// Bounded wait for a token before the action fails hard.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl RateLimitConfig {
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(self.refill_secs.max(1))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs.max(1))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            refill_secs: default_refill_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_burst() -> usize {
    5
}

fn default_refill_secs() -> u64 {
    12
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Messages per page, and therefore group items per search chunk.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    10
}

/// Provider API endpoints. Overridable so tests can point at a local server.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_gmail_base_url")]
    pub gmail_base_url: String,
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    /// Pub/Sub topic passed to Gmail watch registrations.
    #[serde(default)]
    pub gmail_watch_topic: Option<String>,
    /// Callback URL passed to Graph change-notification subscriptions.
    #[serde(default)]
    pub graph_notification_url: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            gmail_base_url: default_gmail_base_url(),
            graph_base_url: default_graph_base_url(),
            gmail_watch_topic: None,
            graph_notification_url: None,
        }
    }
}

fn default_gmail_base_url() -> String {
    "https://gmail.googleapis.com".to_string()
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

/// Endpoints for the external collaborators this core defers to: the rule
/// evaluation engine, the assistant/filing/outbound handlers, and the
/// sender-categorization and attachment-filing services.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CollaboratorsConfig {
    #[serde(default)]
    pub rules_url: Option<String>,
    #[serde(default)]
    pub handoff_url: Option<String>,
    #[serde(default)]
    pub sidecar_url: Option<String>,
}

impl Config {
    /// Load configuration from a TOML file, layered with `MAILROUTED_*`
    /// environment variables. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("MAILROUTED").separator("__"))
            .build()
            .context("failed to assemble configuration sources")?;

        settings
            .try_deserialize()
            .context("failed to deserialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, RoutingConfig};
    use indoc::indoc;

    #[test]
    fn full_document_deserializes() {
        let document = indoc! {r#"
            [ingress]
            bind = "0.0.0.0"
            port = 9000
            auth_token = "s3cret"

            [routing]
            ignored_senders = ["no-reply@spam.example"]
            assistant_alias = "+assistant@"

            [rate_limit]
            burst = 2
            refill_secs = 30

            [collaborators]
            rules_url = "http://rules.internal/evaluate"
        "#};

        let settings = config::Config::builder()
            .add_source(config::File::from_str(document, config::FileFormat::Toml))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();

        assert_eq!(config.ingress.port, 9000);
        assert_eq!(config.ingress.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.rate_limit.burst, 2);
        assert_eq!(config.history.page_size, 10);
        assert!(config.routing.is_ignored_sender("no-reply@spam.example"));
        assert_eq!(
            config.collaborators.rules_url.as_deref(),
            Some("http://rules.internal/evaluate")
        );
    }

    #[test]
    fn ignored_sender_matches_substring_case_insensitively() {
        let routing = RoutingConfig {
            ignored_senders: vec!["no-reply@spam.example".to_string(), "Bounces.".to_string()],
            assistant_alias: None,
            filing_alias: None,
        };

        assert!(routing.is_ignored_sender("NO-REPLY@SPAM.EXAMPLE"));
        assert!(routing.is_ignored_sender("mailer@bounces.example.net"));
        assert!(!routing.is_ignored_sender("person@real.example"));
    }

    #[test]
    fn blank_deny_list_entries_never_match() {
        let routing = RoutingConfig {
            ignored_senders: vec!["   ".to_string()],
            assistant_alias: None,
            filing_alias: None,
        };

        assert!(!routing.is_ignored_sender("anyone@example.com"));
    }
}
