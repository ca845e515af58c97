//! Concurrent deliveries for the same issue must serialize: exactly one of
//! them commits a transition, the other waits or fails cleanly.

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use issuewright_agents::error::Error;
use issuewright_agents::models::ConversationStatus;
use issuewright_agents::store::ConversationStore;
use issuewright_server::orchestrator::{OrchestratorSettings, OutcomeStatus};
use issuewright_server::signature::sign;
use tower::ServiceExt;

fn settings(lease_wait: Duration) -> OrchestratorSettings {
    OrchestratorSettings {
        lease_wait,
        ..OrchestratorSettings::default()
    }
}

/// Issue #42 waiting on answers, with the gate closed again afterwards.
async fn awaiting_answers(h: &Harness) {
    h.reasoner.push(clarification(&["Which PSP?"]));
    h.reasoner.open_gate(1);
    h.orchestrator()
        .dispatch(&event("issues", &issue_opened(42, "Add shopping cart")), "d-open")
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_comments_commit_one_transition() {
    let h = Harness::with(settings(Duration::from_secs(10)), ScriptedReasoner::gated());
    awaiting_answers(&h).await;
    h.reasoner.push(complete(&["Cart persists"], &["feature"]));
    h.reasoner.push(complete(&["Should not be used"], &[]));

    let state = h.state.clone();
    let first = tokio::spawn(async move {
        state
            .orchestrator
            .dispatch(&event("issue_comment", &comment_created(42, 1, "Stripe")), "d-a")
            .await
    });
    h.reasoner.wait_for_calls(2).await;

    let state = h.state.clone();
    let second = tokio::spawn(async move {
        state
            .orchestrator
            .dispatch(&event("issue_comment", &comment_created(42, 2, "Adyen")), "d-b")
            .await
    });
    // Let the second delivery find the lease held.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.reasoner.call_count(), 2);
    h.reasoner.open_gate(2);

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.status, OutcomeStatus::Success);
    assert_eq!(first.conversation_status, Some(ConversationStatus::ReadyForDev));
    assert_eq!(second.status, OutcomeStatus::Ignored);

    let conversation = h.store.get_conversation(REPO, 42).await.unwrap().unwrap();
    assert_eq!(conversation.status, ConversationStatus::ReadyForDev);
    // One commit for the questions, one for the answer.
    assert_eq!(conversation.version, 2);
    assert_eq!(conversation.turns[0].responses, vec!["Stripe"]);
    assert_eq!(h.reasoner.call_count(), 2);
    let refined: Vec<_> = h
        .vcs
        .comments(42)
        .into_iter()
        .filter(|c| c.contains("Requirements Refined"))
        .collect();
    assert_eq!(refined.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_conversation_fails_cleanly() {
    let h = Harness::with(settings(Duration::from_millis(100)), ScriptedReasoner::gated());
    awaiting_answers(&h).await;
    h.reasoner.push(complete(&["Cart persists"], &[]));

    let state = h.state.clone();
    let first = tokio::spawn(async move {
        state
            .orchestrator
            .dispatch(&event("issue_comment", &comment_created(42, 1, "Stripe")), "d-a")
            .await
    });
    h.reasoner.wait_for_calls(2).await;

    let err = h
        .orchestrator()
        .dispatch(&event("issue_comment", &comment_created(42, 2, "Adyen")), "d-b")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConversationBusy(_)), "{err:?}");

    h.reasoner.open_gate(1);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.conversation_status, Some(ConversationStatus::ReadyForDev));
    let conversation = h.store.get_conversation(REPO, 42).await.unwrap().unwrap();
    assert_eq!(conversation.version, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_opens_create_one_conversation() {
    let h = Harness::with(settings(Duration::from_secs(10)), ScriptedReasoner::gated());
    h.reasoner.push(clarification(&["Which PSP?"]));

    let state = h.state.clone();
    let first = tokio::spawn(async move {
        state
            .orchestrator
            .dispatch(&event("issues", &issue_opened(42, "Add shopping cart")), "d-a")
            .await
    });
    h.reasoner.wait_for_calls(1).await;

    let state = h.state.clone();
    let second = tokio::spawn(async move {
        state
            .orchestrator
            .dispatch(&event("issues", &issue_opened(42, "Add shopping cart")), "d-b")
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.reasoner.open_gate(2);

    let outcomes = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
    let successes = outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::Success)
        .count();
    assert_eq!(successes, 1);
    assert_eq!(h.reasoner.call_count(), 1);
    assert_eq!(h.vcs.comments(42).len(), 1);
    let conversation = h.store.get_conversation(REPO, 42).await.unwrap().unwrap();
    assert_eq!(conversation.turns.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_delivery_answers_409_and_can_be_redelivered() {
    let h = Harness::with(settings(Duration::from_millis(100)), ScriptedReasoner::gated());
    awaiting_answers(&h).await;
    h.reasoner.push(complete(&["Cart persists"], &[]));

    let post = |payload: serde_json::Value, delivery: &str| {
        let body = serde_json::to_vec(&payload).unwrap();
        Request::post("/webhooks/vcs")
            .header("x-github-event", "issue_comment")
            .header("x-github-delivery", delivery)
            .header("x-hub-signature-256", sign(&body, SECRET))
            .body(Body::from(body))
            .unwrap()
    };

    let router = h.router();
    let first_request = post(comment_created(42, 1, "Stripe"), "d-a");
    let first = tokio::spawn(async move { router.oneshot(first_request).await.unwrap() });
    h.reasoner.wait_for_calls(2).await;

    let busy = h
        .router()
        .oneshot(post(comment_created(42, 2, "Adyen"), "d-b"))
        .await
        .unwrap();
    assert_eq!(busy.status(), StatusCode::CONFLICT);

    h.reasoner.open_gate(1);
    assert_eq!(first.await.unwrap().status(), StatusCode::OK);

    // The busy claim was released: the redelivery is handled, not deduplicated.
    let redelivered = h
        .router()
        .oneshot(post(comment_created(42, 2, "Adyen"), "d-b"))
        .await
        .unwrap();
    assert_eq!(redelivered.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(redelivered.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ignored");
    assert_ne!(body["message"], "Duplicate delivery");
}
