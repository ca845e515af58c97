//! Shared fixtures: a recording VCS, a scripted reasoner and an in-memory
//! store wired into a real orchestrator and router.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use issuewright_agents::domain::StaticDomainContext;
use issuewright_agents::error::{Error, Result};
use issuewright_agents::llm::{Prompt, Reasoner};
use issuewright_agents::retry::RetryPolicy;
use issuewright_agents::store::SqliteStore;
use issuewright_agents::vcs::{FileContent, FileWrite, Issue, NewPullRequest, PullRequest, Vcs};
use issuewright_agents::AgentDeps;
use issuewright_server::events::{WebhookEvent, classify};
use issuewright_server::orchestrator::{Orchestrator, OrchestratorSettings};
use issuewright_server::web::{self, AppState, GatewaySettings};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

pub const REPO: &str = "acme/shop";
pub const SECRET: &str = "webhook-secret";
pub const FIRST_PR: u64 = 101;

// ── VCS ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Comment { number: u64, body: String },
    AddLabels { number: u64, labels: Vec<String> },
    RemoveLabel { number: u64, label: String },
    CreateBranch { branch: String, from: String },
    WriteFile { path: String, branch: String },
    DeleteFile { path: String, branch: String },
    CreatePullRequest { number: u64, head: String, base: String },
    UpdatePullRequestBody { number: u64 },
}

/// Records every call. Can be told to fail the Nth file write.
#[derive(Default)]
pub struct FakeVcs {
    calls: Mutex<Vec<Call>>,
    branches: Mutex<HashSet<String>>,
    pulls: Mutex<HashMap<u64, PullRequest>>,
    writes: AtomicUsize,
    fail_write_at: Mutex<Option<usize>>,
}

impl FakeVcs {
    /// Make the `nth` (1-based) file write fail with a permanent error.
    pub fn fail_write_at(&self, nth: usize) {
        *self.fail_write_at.lock() = Some(nth);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn comments(&self, number: u64) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Comment { number: n, body } if n == number => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn labels_added(&self, number: u64) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::AddLabels { number: n, labels } if n == number => Some(labels),
                _ => None,
            })
            .collect()
    }

    pub fn labels_removed(&self, number: u64) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::RemoveLabel { number: n, label } if n == number => Some(label),
                _ => None,
            })
            .collect()
    }

    pub fn written_paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::WriteFile { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    pub fn branches_created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::CreateBranch { branch, .. } => Some(branch),
                _ => None,
            })
            .collect()
    }

    pub fn pull_requests(&self) -> Vec<PullRequest> {
        let mut prs: Vec<PullRequest> = self.pulls.lock().values().cloned().collect();
        prs.sort_by_key(|pr| pr.number);
        prs
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn get_issue(&self, _repo: &str, number: u64) -> Result<Issue> {
        Ok(Issue {
            number,
            title: format!("Issue {number}"),
            body: String::new(),
            state: "open".into(),
            labels: Vec::new(),
            is_pull_request: false,
        })
    }

    async fn create_issue_comment(&self, _repo: &str, number: u64, body: &str) -> Result<u64> {
        let mut calls = self.calls.lock();
        calls.push(Call::Comment {
            number,
            body: body.to_string(),
        });
        Ok(calls.len() as u64)
    }

    async fn add_labels(&self, _repo: &str, number: u64, labels: &[String]) -> Result<()> {
        self.record(Call::AddLabels {
            number,
            labels: labels.to_vec(),
        });
        Ok(())
    }

    async fn remove_label(&self, _repo: &str, number: u64, label: &str) -> Result<()> {
        self.record(Call::RemoveLabel {
            number,
            label: label.to_string(),
        });
        Ok(())
    }

    async fn create_pull_request(&self, repo: &str, pr: &NewPullRequest) -> Result<PullRequest> {
        let mut pulls = self.pulls.lock();
        let number = FIRST_PR + pulls.len() as u64;
        let created = PullRequest {
            number,
            title: pr.title.clone(),
            body: pr.body.clone(),
            html_url: format!("https://github.com/{repo}/pull/{number}"),
            head: pr.head.clone(),
            base: pr.base.clone(),
        };
        pulls.insert(number, created.clone());
        drop(pulls);
        self.record(Call::CreatePullRequest {
            number,
            head: pr.head.clone(),
            base: pr.base.clone(),
        });
        Ok(created)
    }

    async fn get_pull_request(&self, _repo: &str, number: u64) -> Result<PullRequest> {
        self.pulls
            .lock()
            .get(&number)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pull request {number}")))
    }

    async fn update_pull_request_body(
        &self,
        _repo: &str,
        number: u64,
        body: &str,
    ) -> Result<PullRequest> {
        let updated = {
            let mut pulls = self.pulls.lock();
            let pr = pulls
                .get_mut(&number)
                .ok_or_else(|| Error::NotFound(format!("pull request {number}")))?;
            pr.body = body.to_string();
            pr.clone()
        };
        self.record(Call::UpdatePullRequestBody { number });
        Ok(updated)
    }

    async fn create_pr_comment(&self, repo: &str, pr_number: u64, body: &str) -> Result<u64> {
        self.create_issue_comment(repo, pr_number, body).await
    }

    async fn create_branch(&self, _repo: &str, branch: &str, from: &str) -> Result<()> {
        self.branches.lock().insert(branch.to_string());
        self.record(Call::CreateBranch {
            branch: branch.to_string(),
            from: from.to_string(),
        });
        Ok(())
    }

    async fn branch_exists(&self, _repo: &str, branch: &str) -> Result<bool> {
        Ok(self.branches.lock().contains(branch))
    }

    async fn get_file_content(
        &self,
        _repo: &str,
        _path: &str,
        _branch: &str,
    ) -> Result<Option<FileContent>> {
        Ok(None)
    }

    async fn create_or_update_file(&self, _repo: &str, file: &FileWrite) -> Result<String> {
        let nth = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_write_at.lock() == Some(nth) {
            return Err(Error::Vcs {
                operation: format!("write {}", file.path),
                status: Some(422),
                message: "sha mismatch".into(),
            });
        }
        self.record(Call::WriteFile {
            path: file.path.clone(),
            branch: file.branch.clone(),
        });
        Ok(format!("commit{nth}"))
    }

    async fn delete_file(&self, _repo: &str, path: &str, _message: &str, branch: &str) -> Result<()> {
        self.record(Call::DeleteFile {
            path: path.to_string(),
            branch: branch.to_string(),
        });
        Ok(())
    }

    async fn list_repository_structure(&self, _repo: &str, _branch: &str) -> Result<Vec<String>> {
        Ok(vec!["Cargo.toml".into(), "src/lib.rs".into()])
    }
}

// ── Reasoner ───────────────────────────────────────────────────────────

/// Answers with queued responses, in order. With a gate, every call blocks
/// until the test hands out a permit.
#[derive(Default)]
pub struct ScriptedReasoner {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Prompt>>,
    gate: Option<Semaphore>,
}

impl ScriptedReasoner {
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn push(&self, response: impl Into<String>) {
        self.responses.lock().push_back(response.into());
    }

    pub fn open_gate(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().clone()
    }

    /// Wait until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.call_count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn invoke(&self, prompt: &Prompt) -> Result<String> {
        self.prompts.lock().push(prompt.clone());
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| Error::Provider {
                    status: 500,
                    message: e.to_string(),
                })?;
            permit.forget();
        }
        self.responses.lock().pop_front().ok_or_else(|| Error::Provider {
            status: 400,
            message: "no scripted response left".into(),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ── Harness ────────────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub vcs: Arc<FakeVcs>,
    pub reasoner: Arc<ScriptedReasoner>,
    pub state: Arc<AppState>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(OrchestratorSettings::default(), ScriptedReasoner::default())
    }

    pub fn with(settings: OrchestratorSettings, reasoner: ScriptedReasoner) -> Self {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        let vcs = Arc::new(FakeVcs::default());
        let reasoner = Arc::new(reasoner);
        let deps = AgentDeps {
            reasoner: reasoner.clone(),
            vcs: vcs.clone(),
            store: store.clone(),
            domain: Arc::new(StaticDomainContext::default()),
            reasoning_retry: RetryPolicy::no_retry(),
            vcs_retry: RetryPolicy::no_retry(),
        };
        let state = Arc::new(AppState {
            orchestrator: Orchestrator::new(deps, "main", settings),
            settings: GatewaySettings {
                webhook_secret: SECRET.into(),
                handler_timeout: Duration::from_secs(30),
            },
        });
        Self {
            store,
            vcs,
            reasoner,
            state,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.state.orchestrator
    }

    pub fn router(&self) -> Router {
        web::router(self.state.clone())
    }
}

// ── Payloads ───────────────────────────────────────────────────────────

pub fn issue_opened(number: u64, body: &str) -> Value {
    json!({
        "action": "opened",
        "issue": { "id": 9000 + number, "number": number, "title": "Shopping cart", "body": body },
        "repository": { "full_name": REPO }
    })
}

pub fn issue_labeled(number: u64, label: &str) -> Value {
    json!({
        "action": "labeled",
        "issue": { "id": 9000 + number, "number": number, "title": "Shopping cart", "body": "Add shopping cart" },
        "label": { "name": label },
        "repository": { "full_name": REPO }
    })
}

pub fn comment_created(number: u64, comment_id: u64, body: &str) -> Value {
    json!({
        "action": "created",
        "issue": { "id": 9000 + number, "number": number, "title": "Shopping cart", "body": "Add shopping cart" },
        "comment": { "id": comment_id, "body": body, "user": { "login": "alice", "type": "User" } },
        "repository": { "full_name": REPO }
    })
}

pub fn pull_request_opened(number: u64, body: &str) -> Value {
    json!({
        "action": "opened",
        "pull_request": {
            "number": number, "title": "Add cart", "body": body,
            "head": { "ref": "feature/cart" }
        },
        "repository": { "full_name": REPO }
    })
}

pub fn event(event_type: &str, payload: &Value) -> WebhookEvent {
    classify(event_type, &serde_json::to_vec(payload).unwrap()).unwrap()
}

// ── Reasoning responses ────────────────────────────────────────────────

pub fn clarification(questions: &[&str]) -> String {
    json!({
        "needs_clarification": true,
        "questions": questions,
        "is_complete": false,
        "estimated_complexity": "medium"
    })
    .to_string()
}

pub fn complete(criteria: &[&str], labels: &[&str]) -> String {
    format!(
        "Here is my analysis:\n```json\n{}\n```",
        json!({
            "needs_clarification": false,
            "questions": [],
            "refined_description": "Session-backed shopping cart",
            "is_complete": true,
            "acceptance_criteria": criteria,
            "suggested_labels": labels,
            "technical_considerations": ["store cart in session"],
            "estimated_complexity": "medium"
        })
    )
}

pub fn still_analyzing() -> String {
    json!({ "needs_clarification": false, "is_complete": false }).to_string()
}

/// Three implementation files and two test files on `feature/cart`.
pub fn cart_generation() -> String {
    json!({
        "files_to_create": [
            { "file_path": "src/cart/mod.rs", "content": "pub mod model;", "operation": "create" },
            { "file_path": "src/cart/model.rs", "content": "pub struct Cart;", "operation": "create" },
            { "file_path": "src/lib.rs", "content": "pub mod cart;", "operation": "modify" }
        ],
        "test_files": [
            { "file_path": "tests/cart_add.rs", "content": "#[test] fn add() {}", "test_framework": "cargo test", "test_count": 1 },
            { "file_path": "tests/cart_persist.rs", "content": "#[test] fn persist() {}", "test_framework": "cargo test", "test_count": 1 }
        ],
        "commit_message": "feat: add shopping cart",
        "pr_title": "Add shopping cart",
        "pr_description": "Implements a session-backed cart.",
        "branch_name": "feature/cart",
        "dependencies": [],
        "environment_variables": {},
        "migration_steps": [],
        "breaking_changes": []
    })
    .to_string()
}
