//! mailrouted binary entry point.

use mailrouted::account::AccountStore;
use mailrouted::actions::RateLimiter;
use mailrouted::config::Config;
use mailrouted::history::ExampleService;
use mailrouted::ingress::{self, AppState};
use mailrouted::ledger::ExecutionLedger;
use mailrouted::patterns::PatternStore;
use mailrouted::provider::SqliteProviderRegistry;
use mailrouted::router::{EventRouter, Handoff, HttpHandoff, NoopHandoff};
use mailrouted::rules::{DisabledRuleEngine, RemoteRuleEngine, RuleEngine};
use mailrouted::sidecar::{HttpSidecarHandler, NoopSidecarHandler, SidecarHandler, SidecarQueue};
use mailrouted::telemetry;

use anyhow::Context as _;
use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "mailrouted", version, about = "Mailbox event routing service")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "mailrouted.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&config.database.path)
                .create_if_missing(true),
        )
        .await
        .context("failed to open the database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let http = reqwest::Client::new();

    let registry = Arc::new(SqliteProviderRegistry::new(pool.clone(), &config.providers));
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));

    let rules: Arc<dyn RuleEngine> = match &config.collaborators.rules_url {
        Some(url) => Arc::new(RemoteRuleEngine::new(http.clone(), url.clone())),
        None => {
            tracing::warn!("no rule engine configured, rule evaluation disabled");
            Arc::new(DisabledRuleEngine)
        }
    };

    let handoff: Arc<dyn Handoff> = match &config.collaborators.handoff_url {
        Some(url) => Arc::new(HttpHandoff::new(http.clone(), url.clone())),
        None => Arc::new(NoopHandoff),
    };

    let sidecar_handler: Arc<dyn SidecarHandler> = match &config.collaborators.sidecar_url {
        Some(url) => Arc::new(HttpSidecarHandler::new(http.clone(), url.clone())),
        None => Arc::new(NoopSidecarHandler),
    };
    let (sidecar, _sidecar_worker) = SidecarQueue::spawn(sidecar_handler, 256);

    let router = EventRouter::new(
        AccountStore::new(pool.clone()),
        ExecutionLedger::new(pool.clone()),
        PatternStore::new(pool.clone()),
        registry.clone(),
        rules,
        handoff,
        sidecar,
        limiter,
        config.routing.clone(),
    );

    let examples = ExampleService::new(
        AccountStore::new(pool.clone()),
        registry,
        &config.history,
    );

    let state = AppState {
        router: Arc::new(router),
        examples: Arc::new(examples),
        auth_token: config.ingress.auth_token.clone(),
    };

    ingress::serve(state, &config.ingress.bind, config.ingress.port).await
}
