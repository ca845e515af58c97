//! Webhook gateway tests through the axum router.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use clap::Parser;
use common::*;
use issuewright_agents::models::ConversationStatus;
use issuewright_agents::store::ConversationStore;
use issuewright_server::config::ServerConfig;
use issuewright_server::server::Server;
use issuewright_server::signature::sign;
use serde_json::{Value, json};
use tower::ServiceExt;

fn webhook(event_type: Option<&str>, payload: &Value, delivery: Option<&str>) -> Request<Body> {
    let body = serde_json::to_vec(payload).unwrap();
    signed_webhook(event_type, body, delivery, SECRET)
}

fn signed_webhook(
    event_type: Option<&str>,
    body: Vec<u8>,
    delivery: Option<&str>,
    secret: &str,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks/vcs")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", sign(&body, secret));
    if let Some(event_type) = event_type {
        builder = builder.header("x-github-event", event_type);
    }
    if let Some(delivery) = delivery {
        builder = builder.header("x-github-delivery", delivery);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn send(h: &Harness, request: Request<Body>) -> (StatusCode, Value) {
    let response = h.router().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn invalid_signature_is_rejected_before_anything_else() {
    let h = Harness::new();
    h.reasoner.push(clarification(&["Which PSP?"]));
    let body = serde_json::to_vec(&issue_opened(42, "Add shopping cart")).unwrap();

    let forged = signed_webhook(Some("issues"), body.clone(), Some("d-1"), "wrong-secret");
    let (status, _) = send(&h, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut unsigned = signed_webhook(Some("issues"), body.clone(), Some("d-1"), SECRET);
    unsigned.headers_mut().remove("x-hub-signature-256");
    let (status, _) = send(&h, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert_eq!(h.reasoner.call_count(), 0);
    assert!(h.vcs.calls().is_empty());
    assert!(h.store.get_conversation(REPO, 42).await.unwrap().is_none());

    // The delivery id was never claimed, so the genuine delivery goes through.
    let (status, json) = send(&h, signed_webhook(Some("issues"), body, Some("d-1"), SECRET)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "success");
}

#[tokio::test]
async fn ping_answers_pong() {
    let h = Harness::new();
    let (status, body) = send(&h, webhook(Some("ping"), &json!({ "zen": "Keep it simple" }), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "success", "message": "pong" }));
}

#[tokio::test]
async fn unsupported_and_malformed_events_are_ignored() {
    let h = Harness::new();

    let (status, body) = send(&h, webhook(Some("push"), &json!({}), Some("d-push"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["message"], "Event type 'push' not handled");

    let (status, body) = send(&h, webhook(Some("issues"), &json!({ "action": "opened" }), Some("d-bad"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");

    let (status, body) = send(&h, webhook(None, &issue_opened(42, "x"), Some("d-none"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");

    assert_eq!(h.reasoner.call_count(), 0);
}

#[tokio::test]
async fn missing_delivery_id_is_ignored() {
    let h = Harness::new();
    let (status, body) = send(&h, webhook(Some("issues"), &issue_opened(42, "Add shopping cart"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ignored");
    assert_eq!(body["message"], "Missing delivery id");
    assert!(h.store.get_conversation(REPO, 42).await.unwrap().is_none());
}

#[tokio::test]
async fn redelivery_is_deduplicated() {
    let h = Harness::new();
    h.reasoner.push(clarification(&["Which PSP?", "Guest checkout?"]));
    h.reasoner.push(clarification(&["Should not be asked"]));

    let payload = issue_opened(42, "Add shopping cart");
    let (status, first) = send(&h, webhook(Some("issues"), &payload, Some("d-42"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "success");
    assert_eq!(first["conversation_status"], "needs_clarification");

    let (status, second) = send(&h, webhook(Some("issues"), &payload, Some("d-42"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "ignored");
    assert_eq!(second["message"], "Duplicate delivery");

    assert_eq!(h.reasoner.call_count(), 1);
    assert_eq!(h.vcs.comments(42).len(), 1);
}

/// Drive issue #42 to ready-for-dev over HTTP.
async fn ready_issue_42(h: &Harness) {
    h.reasoner.push(clarification(&["Which PSP?", "Guest checkout?"]));
    send(h, webhook(Some("issues"), &issue_opened(42, "Add shopping cart"), Some("d-open"))).await;
    h.reasoner.push(complete(&["Users can add items", "Cart persists"], &["feature"]));
    let (_, body) = send(
        h,
        webhook(Some("issue_comment"), &comment_created(42, 555, "Stripe, and yes"), Some("d-answer")),
    )
    .await;
    assert_eq!(body["conversation_status"], "ready_for_dev");
}

async fn generation_count(h: &Harness) -> usize {
    let conversation = h.store.get_conversation(REPO, 42).await.unwrap().unwrap();
    h.store.list_code_generations(&conversation.id).await.unwrap().len()
}

#[tokio::test]
async fn redelivered_comment_is_processed_once() {
    let h = Harness::new();
    h.reasoner.push(clarification(&["Which PSP?"]));
    send(&h, webhook(Some("issues"), &issue_opened(42, "Add shopping cart"), Some("d-open"))).await;

    h.reasoner.push(clarification(&["Which currency?"]));
    h.reasoner.push(clarification(&["Should not be asked"]));
    let payload = comment_created(42, 555, "Stripe");
    let (_, first) = send(&h, webhook(Some("issue_comment"), &payload, Some("d-answer"))).await;
    assert_eq!(first["status"], "success");
    let (status, second) = send(&h, webhook(Some("issue_comment"), &payload, Some("d-answer"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["message"], "Duplicate delivery");

    let conversation = h.store.get_conversation(REPO, 42).await.unwrap().unwrap();
    assert_eq!(conversation.turns.len(), 2);
    assert_eq!(conversation.turns[0].responses, vec!["Stripe"]);
    assert_eq!(h.reasoner.call_count(), 2);
    assert_eq!(h.vcs.comments(42).len(), 2);
}

#[tokio::test]
async fn redelivered_ready_label_generates_once() {
    let h = Harness::new();
    ready_issue_42(&h).await;

    h.reasoner.push(cart_generation());
    h.reasoner.push(cart_generation());
    let label = issue_labeled(42, "ready-for-dev");
    let (_, first) = send(&h, webhook(Some("issues"), &label, Some("d-label"))).await;
    assert_eq!(first["pr_number"], 101);
    let (status, second) = send(&h, webhook(Some("issues"), &label, Some("d-label"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["status"], "ignored");
    assert_eq!(second["message"], "Duplicate delivery");

    assert_eq!(generation_count(&h).await, 1);
    assert_eq!(h.vcs.pull_requests().len(), 1);
    assert_eq!(h.reasoner.call_count(), 3);
}

#[tokio::test]
async fn redelivery_after_failed_generation_does_not_retry() {
    let h = Harness::new();
    ready_issue_42(&h).await;
    h.vcs.fail_write_at(2);

    h.reasoner.push(cart_generation());
    h.reasoner.push(cart_generation());
    let label = issue_labeled(42, "ready-for-dev");
    let (status, first) = send(&h, webhook(Some("issues"), &label, Some("d-label"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "error");

    // The failed attempt was answered, so the claim is completed: the
    // provider's redelivery must not start a second attempt.
    let (_, second) = send(&h, webhook(Some("issues"), &label, Some("d-label"))).await;
    assert_eq!(second["message"], "Duplicate delivery");

    assert_eq!(generation_count(&h).await, 1);
    assert_eq!(h.vcs.branches_created(), vec!["feature/cart"]);
    assert_eq!(h.vcs.written_paths(), vec!["src/cart/mod.rs"]);
    assert!(h.vcs.pull_requests().is_empty());
    assert_eq!(h.reasoner.call_count(), 3);
}

#[tokio::test]
async fn failed_delivery_is_reprocessed_on_redelivery() {
    let h = Harness::new();
    h.reasoner.push("not json at all");

    let payload = issue_opened(42, "Add shopping cart");
    let (status, body) = send(&h, webhook(Some("issues"), &payload, Some("d-42"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "status": "error", "message": "Internal server error" }));
    assert!(h.vcs.calls().is_empty());

    h.reasoner.push(clarification(&["Which PSP?"]));
    let (status, body) = send(&h, webhook(Some("issues"), &payload, Some("d-42"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(h.vcs.comments(42).len(), 1);
}

#[tokio::test]
async fn full_lifecycle_over_http() {
    let h = Harness::new();

    h.reasoner.push(clarification(&["Which PSP?", "Guest checkout?"]));
    let (_, body) = send(&h, webhook(Some("issues"), &issue_opened(42, "Add shopping cart"), Some("d-1"))).await;
    assert_eq!(body["conversation_status"], "needs_clarification");

    h.reasoner.push(complete(&["Users can add items", "Cart persists"], &["feature"]));
    let (_, body) = send(
        &h,
        webhook(Some("issue_comment"), &comment_created(42, 555, "Stripe, and yes"), Some("d-2")),
    )
    .await;
    assert_eq!(body["conversation_status"], "ready_for_dev");

    let (_, body) = send(&h, webhook(Some("issues"), &issue_labeled(42, "bug"), Some("d-3"))).await;
    assert_eq!(body["status"], "ignored");

    h.reasoner.push(cart_generation());
    let (status, body) = send(&h, webhook(Some("issues"), &issue_labeled(42, "ready-for-dev"), Some("d-4"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["pr_number"], 101);

    let (_, body) = send(
        &h,
        webhook(Some("pull_request"), &pull_request_opened(101, "Closes #42"), Some("d-5")),
    )
    .await;
    assert_eq!(body["conversation_status"], "in_development");

    let conversation = h.store.get_conversation(REPO, 42).await.unwrap().unwrap();
    assert_eq!(conversation.status, ConversationStatus::InDevelopment);
}

#[tokio::test]
async fn status_api_reports_conversation() {
    let h = Harness::new();
    h.reasoner.push(clarification(&["Which PSP?", "Guest checkout?"]));
    send(&h, webhook(Some("issues"), &issue_opened(42, "Add shopping cart"), Some("d-1"))).await;

    let request = Request::get("/api/v1/conversations/acme/shop/42")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["repo"], "acme/shop");
    assert_eq!(body["issue_number"], 42);
    assert_eq!(body["stage"], "needs_clarification");
    assert_eq!(body["turns"], 1);
    assert_eq!(body["version"], 1);
    assert_eq!(body["action_count"], 2);
    assert_eq!(body["analysis"]["needs_clarification"], true);
    assert!(body["latest_code_generation"].is_null());

    let request = Request::get("/api/v1/conversations/acme/shop/43")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn server_starts_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("issuewright.db");
    let config = ServerConfig::try_parse_from([
        "issuewright-server",
        "--listen-addr",
        "127.0.0.1:0",
        "--db-path",
        db.to_str().unwrap(),
        "--webhook-secret",
        SECRET,
        "--github-token",
        "ghp_test",
        "--ai-api-key",
        "sk-test",
    ])
    .unwrap();
    let (addr, handle) = Server::new(config).start().await.unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/webhooks/vcs"))
        .header("x-github-event", "issues")
        .header("x-github-delivery", "d-1")
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    let response = client
        .get(format!("http://{addr}/api/v1/conversations/acme/shop/1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    assert!(db.exists());
    handle.abort();
}
