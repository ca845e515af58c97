//! Classification of raw webhook deliveries into orchestrator events.
//!
//! Only the fields the orchestrator needs are deserialized; everything else
//! in the provider envelope is ignored.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueEvent {
    pub repo: String,
    pub issue_id: i64,
    pub issue_number: u64,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentEvent {
    pub repo: String,
    pub issue_id: i64,
    pub issue_number: u64,
    pub comment_id: u64,
    pub body: String,
    pub author_login: String,
    pub author_is_bot: bool,
    pub on_pull_request: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestEvent {
    pub repo: String,
    pub pr_number: u64,
    pub title: String,
    pub body: String,
    pub head: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    Ping,
    IssueOpened(IssueEvent),
    IssueLabeled { issue: IssueEvent, label: String },
    CommentCreated(CommentEvent),
    PullRequestOpened(PullRequestEvent),
    /// Well-formed, but nothing the orchestrator acts on.
    Ignored { reason: String },
}

impl WebhookEvent {
    /// Short name for logs and the delivery table.
    pub fn kind(&self) -> &'static str {
        match self {
            WebhookEvent::Ping => "ping",
            WebhookEvent::IssueOpened(_) => "issues.opened",
            WebhookEvent::IssueLabeled { .. } => "issues.labeled",
            WebhookEvent::CommentCreated(_) => "issue_comment.created",
            WebhookEvent::PullRequestOpened(_) => "pull_request.opened",
            WebhookEvent::Ignored { .. } => "ignored",
        }
    }

    pub fn repo(&self) -> Option<&str> {
        match self {
            WebhookEvent::IssueOpened(issue) | WebhookEvent::IssueLabeled { issue, .. } => {
                Some(&issue.repo)
            }
            WebhookEvent::CommentCreated(comment) => Some(&comment.repo),
            WebhookEvent::PullRequestOpened(pr) => Some(&pr.repo),
            WebhookEvent::Ping | WebhookEvent::Ignored { .. } => None,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    repository: Option<RepositoryPayload>,
    #[serde(default)]
    issue: Option<IssuePayload>,
    #[serde(default)]
    comment: Option<CommentPayload>,
    #[serde(default)]
    label: Option<LabelPayload>,
    #[serde(default)]
    pull_request: Option<PullRequestPayload>,
}

#[derive(Deserialize)]
struct RepositoryPayload {
    full_name: String,
}

#[derive(Deserialize)]
struct IssuePayload {
    id: i64,
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct CommentPayload {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    user: UserPayload,
}

#[derive(Deserialize)]
struct UserPayload {
    login: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Deserialize)]
struct LabelPayload {
    name: String,
}

#[derive(Deserialize)]
struct PullRequestPayload {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    head: BranchRef,
}

#[derive(Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    name: String,
}

fn ignored(reason: impl Into<String>) -> WebhookEvent {
    WebhookEvent::Ignored {
        reason: reason.into(),
    }
}

/// Classify a delivery by its `X-GitHub-Event` type and JSON body.
///
/// `Err` means the body is not a valid envelope for its declared type.
pub fn classify(event_type: &str, body: &[u8]) -> Result<WebhookEvent, String> {
    if event_type == "ping" {
        return Ok(WebhookEvent::Ping);
    }
    if !matches!(event_type, "issues" | "issue_comment" | "pull_request") {
        return Ok(ignored(format!("Event type '{event_type}' not handled")));
    }

    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| format!("invalid {event_type} payload: {e}"))?;
    let action = envelope.action.as_deref().unwrap_or_default();
    let repo = envelope
        .repository
        .map(|r| r.full_name)
        .ok_or_else(|| format!("{event_type} payload has no repository"))?;

    match event_type {
        "issues" => {
            if !matches!(action, "opened" | "labeled") {
                return Ok(ignored(format!("Action '{action}' not handled")));
            }
            let issue = envelope
                .issue
                .ok_or_else(|| "issues payload has no issue".to_string())?;
            let issue = IssueEvent {
                repo,
                issue_id: issue.id,
                issue_number: issue.number,
                title: issue.title,
                body: issue.body.unwrap_or_default(),
            };
            if action == "opened" {
                return Ok(WebhookEvent::IssueOpened(issue));
            }
            let label = envelope
                .label
                .ok_or_else(|| "labeled payload has no label".to_string())?;
            Ok(WebhookEvent::IssueLabeled {
                issue,
                label: label.name,
            })
        }
        "issue_comment" => {
            if action != "created" {
                return Ok(ignored(format!("Action '{action}' not handled")));
            }
            let issue = envelope
                .issue
                .ok_or_else(|| "issue_comment payload has no issue".to_string())?;
            let comment = envelope
                .comment
                .ok_or_else(|| "issue_comment payload has no comment".to_string())?;
            Ok(WebhookEvent::CommentCreated(CommentEvent {
                repo,
                issue_id: issue.id,
                issue_number: issue.number,
                comment_id: comment.id,
                body: comment.body.unwrap_or_default(),
                author_is_bot: comment.user.kind == "Bot",
                author_login: comment.user.login,
                on_pull_request: issue.pull_request.is_some(),
            }))
        }
        _ => {
            if action != "opened" {
                return Ok(ignored(format!("Action '{action}' not handled")));
            }
            let pr = envelope
                .pull_request
                .ok_or_else(|| "pull_request payload has no pull_request".to_string())?;
            Ok(WebhookEvent::PullRequestOpened(PullRequestEvent {
                repo,
                pr_number: pr.number,
                title: pr.title,
                body: pr.body.unwrap_or_default(),
                head: pr.head.name,
            }))
        }
    }
}

static CLOSING_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s*:?\s+#(\d+)\b")
        .expect("closing keyword pattern is valid")
});

/// Issue numbers a PR body closes, in order of first mention.
pub fn referenced_issues(body: &str) -> Vec<u64> {
    let mut issues = Vec::new();
    let numbers = CLOSING_KEYWORD
        .captures_iter(body)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok());
    for n in numbers {
        if !issues.contains(&n) {
            issues.push(n);
        }
    }
    issues
}
