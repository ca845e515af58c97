//! HTTP surface: the webhook endpoint and the read-only status API.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use issuewright_agents::error::Error;
use issuewright_agents::models::{Analysis, CodeGenerationRecord};
use issuewright_agents::store::{ConversationStore, DeliveryClaim};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::error::{GatewayError, WebhookResponse};
use crate::events::{WebhookEvent, classify};
use crate::orchestrator::{Orchestrator, Outcome, OutcomeStatus};
use crate::signature::verify_signature;

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub webhook_secret: String,
    /// Upper bound on one delivery. Also the age after which an unfinished
    /// delivery claim is considered abandoned.
    pub handler_timeout: Duration,
}

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub settings: GatewaySettings,
}

impl AppState {
    fn store(&self) -> &Arc<dyn ConversationStore> {
        self.orchestrator.store()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/vcs", post(github_webhook))
        .route(
            "/api/v1/conversations/{owner}/{repo}/{issue}",
            get(api_conversation),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

// ── Webhook ────────────────────────────────────────────────────────────

async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_webhook(&state, &headers, &body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => e.into_response(),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn handle_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<WebhookResponse, GatewayError> {
    // Nothing is parsed or touched before the signature checks out.
    if !verify_signature(
        body,
        header(headers, SIGNATURE_HEADER),
        &state.settings.webhook_secret,
    ) {
        tracing::warn!(body_len = body.len(), "Rejected webhook with invalid signature");
        return Err(GatewayError::SignatureInvalid);
    }

    let delivery_id = header(headers, DELIVERY_HEADER).map(str::to_string);
    let Some(event_type) = header(headers, EVENT_HEADER) else {
        tracing::warn!(delivery_id = ?delivery_id, "Webhook without event type");
        return Err(GatewayError::MalformedEvent("Missing event type".into()));
    };

    let event = classify(event_type, body).map_err(|reason| {
        tracing::warn!(delivery_id = ?delivery_id, event_type, %reason, "Malformed webhook payload");
        GatewayError::MalformedEvent(reason)
    })?;
    tracing::info!(delivery_id = ?delivery_id, event_type, kind = event.kind(), "Webhook received");

    match &event {
        WebhookEvent::Ping => return Ok(WebhookResponse::success("pong")),
        WebhookEvent::Ignored { reason } => return Ok(WebhookResponse::ignored(reason.clone())),
        _ => {}
    }

    let Some(delivery_id) = delivery_id else {
        tracing::warn!(event_type, "Webhook without delivery id");
        return Err(GatewayError::MalformedEvent("Missing delivery id".into()));
    };

    let store = state.store();
    match store
        .claim_delivery(&delivery_id, event.kind(), state.settings.handler_timeout)
        .await
    {
        Ok(DeliveryClaim::New) => {}
        Ok(DeliveryClaim::Duplicate(previous)) => {
            tracing::info!(%delivery_id, ?previous, "Duplicate delivery skipped");
            return Ok(WebhookResponse::ignored("Duplicate delivery"));
        }
        Err(e) => {
            tracing::error!(%delivery_id, error = %e, "Failed to claim delivery");
            return Err(GatewayError::Internal(e.to_string()));
        }
    }

    let dispatched = tokio::time::timeout(
        state.settings.handler_timeout,
        state.orchestrator.dispatch(&event, &delivery_id),
    )
    .await;

    match dispatched {
        Ok(Ok(outcome)) => {
            if let Err(e) = store.complete_delivery(&delivery_id).await {
                tracing::warn!(%delivery_id, error = %e, "Failed to mark delivery completed");
            }
            tracing::info!(
                %delivery_id,
                kind = event.kind(),
                status = ?outcome.status,
                message = %outcome.message,
                "Webhook handled"
            );
            Ok(outcome_response(outcome))
        }
        Ok(Err(e @ (Error::ConversationBusy(_) | Error::VersionConflict { .. }))) => {
            tracing::warn!(%delivery_id, kind = event.kind(), error = %e, "Deferring delivery");
            if let Err(release) = store.release_delivery(&delivery_id).await {
                tracing::warn!(%delivery_id, error = %release, "Failed to release delivery claim");
            }
            Err(GatewayError::Busy(e.to_string()))
        }
        Ok(Err(e)) => {
            tracing::error!(
                %delivery_id,
                kind = event.kind(),
                repo = event.repo(),
                error = %e,
                "Webhook handling failed"
            );
            fail_delivery(store.as_ref(), &delivery_id).await;
            Err(GatewayError::Internal(e.to_string()))
        }
        Err(_) => {
            tracing::error!(
                %delivery_id,
                kind = event.kind(),
                repo = event.repo(),
                timeout_secs = state.settings.handler_timeout.as_secs(),
                "Webhook handling timed out"
            );
            fail_delivery(store.as_ref(), &delivery_id).await;
            Err(GatewayError::Internal("handler timed out".into()))
        }
    }
}

async fn fail_delivery(store: &dyn ConversationStore, delivery_id: &str) {
    if let Err(e) = store.fail_delivery(delivery_id).await {
        tracing::warn!(%delivery_id, error = %e, "Failed to mark delivery failed");
    }
}

fn outcome_response(outcome: Outcome) -> WebhookResponse {
    let mut response = match outcome.status {
        OutcomeStatus::Success => WebhookResponse::success(outcome.message),
        OutcomeStatus::Ignored => WebhookResponse::ignored(outcome.message),
        OutcomeStatus::Failed => WebhookResponse::error(outcome.message),
    };
    response.conversation_status = outcome.conversation_status.map(|s| s.to_string());
    response.pr_number = outcome.pr_number;
    response
}

// ── Status API ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ConversationStatusResponse {
    status: &'static str,
    conversation_id: String,
    repo: String,
    issue_number: u64,
    title: String,
    stage: String,
    version: i64,
    turns: usize,
    created_at: String,
    updated_at: String,
    analysis: Option<Analysis>,
    action_count: usize,
    latest_code_generation: Option<CodeGenerationSummary>,
}

#[derive(Serialize)]
struct CodeGenerationSummary {
    id: String,
    status: String,
    branch: String,
    pr_number: Option<u64>,
    error_message: Option<String>,
    files: usize,
    tests: usize,
    created_at: String,
}

impl From<CodeGenerationRecord> for CodeGenerationSummary {
    fn from(record: CodeGenerationRecord) -> Self {
        Self {
            id: record.id,
            status: record.status.as_str().to_string(),
            branch: record.branch,
            pr_number: record.pr_number,
            error_message: record.error_message,
            files: record.files.len(),
            tests: record.tests.len(),
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

async fn api_conversation(
    Path((owner, repo, issue)): Path<(String, String, u64)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let repo = format!("{owner}/{repo}");
    match conversation_status(state.store().as_ref(), &repo, issue).await {
        Ok(Some(body)) => Json(body).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(WebhookResponse::error(format!("No conversation for {repo}#{issue}"))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(%repo, issue, error = %e, "Status lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(WebhookResponse::error("Internal server error")),
            )
                .into_response()
        }
    }
}

async fn conversation_status(
    store: &dyn ConversationStore,
    repo: &str,
    issue: u64,
) -> issuewright_agents::Result<Option<ConversationStatusResponse>> {
    let Some(conversation) = store.get_conversation(repo, issue).await? else {
        return Ok(None);
    };
    let action_count = store.list_agent_actions(&conversation.id).await?.len();
    let latest = store.latest_code_generation(&conversation.id).await?;
    Ok(Some(ConversationStatusResponse {
        status: "success",
        stage: conversation.status.to_string(),
        version: conversation.version,
        turns: conversation.turns.len(),
        created_at: conversation.created_at.to_rfc3339(),
        updated_at: conversation.updated_at.to_rfc3339(),
        action_count,
        latest_code_generation: latest.map(CodeGenerationSummary::from),
        conversation_id: conversation.id,
        repo: conversation.repo,
        issue_number: conversation.issue_number,
        title: conversation.title,
        analysis: conversation.analysis,
    }))
}
