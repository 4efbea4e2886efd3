//! HTTP ingress for mailbox event notifications.
//!
//! Webhook deliveries and poll bridges post events here. Responses are
//! chosen for at-least-once delivery semantics: transient pipeline failures
//! return 500 so the sender redelivers, permanently unroutable events return
//! 4xx so it does not.

use crate::history::{ExampleService, GroupItem};
use crate::provider::DateWindow;
use crate::router::{EventRouter, RouteOutcome};
use crate::{InboundEvent, PipelineError};

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<EventRouter>,
    pub examples: Arc<ExampleService>,
    pub auth_token: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(receive_event))
        .route("/examples", post(fetch_examples))
        .with_state(state)
}

/// Bind and serve until ctrl-c.
pub async fn serve(state: AppState, bind: &str, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind, port)).await?;
    tracing::info!(%bind, port, "ingress listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

async fn health() -> &'static str {
    "ok"
}

fn authorized(headers: &HeaderMap, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

async fn receive_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<InboundEvent>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !authorized(&headers, state.auth_token.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized" })),
        );
    }

    match state.router.handle_event(&event).await {
        Ok(outcome) => {
            tracing::info!(
                account_id = %event.account_id,
                message_id = %event.message_id,
                outcome = outcome.name(),
                "event routed"
            );
            (
                StatusCode::OK,
                Json(outcome_body(&outcome)),
            )
        }
        Err(PipelineError::UnknownAccount(account_id)) => {
            tracing::warn!(%account_id, "event for unknown account");
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "unknown account" })),
            )
        }
        // 500 keeps at-least-once delivery retrying; the ledger absorbs the
        // redelivery.
        Err(error) => {
            tracing::error!(
                account_id = %event.account_id,
                message_id = %event.message_id,
                %error,
                "event processing failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": error.to_string() })),
            )
        }
    }
}

/// One page of historical examples for a set of group items.
#[derive(Debug, Deserialize)]
struct ExampleRequest {
    account_id: String,
    items: Vec<GroupItem>,
    #[serde(default)]
    window: Option<DateWindow>,
    #[serde(default)]
    cursor: Option<String>,
}

async fn fetch_examples(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ExampleRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    if !authorized(&headers, state.auth_token.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "unauthorized" })),
        );
    }

    match state
        .examples
        .fetch_page(
            &request.account_id,
            &request.items,
            request.window.as_ref(),
            request.cursor.as_deref(),
        )
        .await
    {
        Ok(page) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "messages": page.messages,
                "cursor": page.cursor,
            })),
        ),
        Err(PipelineError::UnknownAccount(account_id)) => {
            tracing::warn!(%account_id, "example request for unknown account");
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "unknown account" })),
            )
        }
        Err(error) => {
            tracing::error!(
                account_id = %request.account_id,
                %error,
                "example retrieval failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": error.to_string() })),
            )
        }
    }
}

fn outcome_body(outcome: &RouteOutcome) -> serde_json::Value {
    match outcome {
        RouteOutcome::Applied {
            matched_id,
            records,
            ..
        } => serde_json::json!({
            "outcome": outcome.name(),
            "matched_id": matched_id,
            "actions": records,
        }),
        other => serde_json::json!({ "outcome": other.name() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            headers.insert("authorization", format!("Bearer {token}").parse().unwrap());
        }
        headers
    }

    #[test]
    fn missing_token_config_disables_auth() {
        assert!(authorized(&headers_with(None), None));
        assert!(authorized(&headers_with(Some("anything")), None));
    }

    #[test]
    fn configured_token_must_match() {
        assert!(authorized(&headers_with(Some("s3cret")), Some("s3cret")));
        assert!(!authorized(&headers_with(Some("wrong")), Some("s3cret")));
        assert!(!authorized(&headers_with(None), Some("s3cret")));
    }

    #[test]
    fn example_request_accepts_minimal_payload() {
        let request: ExampleRequest = serde_json::from_str(
            r#"{"account_id":"acct","items":[{"kind":"from","value":"shop.com"}]}"#,
        )
        .unwrap();

        assert_eq!(request.account_id, "acct");
        assert_eq!(request.items.len(), 1);
        assert_eq!(request.items[0].kind, crate::history::GroupItemKind::From);
        assert!(request.window.is_none());
        assert!(request.cursor.is_none());
    }

    #[test]
    fn applied_outcome_serializes_action_records() {
        let outcome = RouteOutcome::Applied {
            matched_id: "pat-1".to_string(),
            source: crate::router::MatchSource::Pattern,
            records: vec![crate::actions::ActionRecord::ok(
                crate::actions::Action::Archive,
            )],
        };

        let body = outcome_body(&outcome);
        assert_eq!(body["outcome"], "applied");
        assert_eq!(body["matched_id"], "pat-1");
        assert_eq!(body["actions"][0]["ok"], true);
    }
}
