//! Version-control collaborator.
//!
//! [`Vcs`] is the capability the agents and the orchestrator consume;
//! [`GitHubClient`] implements it over the GitHub REST API. Provider status
//! codes are normalized into [`Error`]: 404 becomes `NotFound`, timeouts,
//! rate limits and 5xx become `Transient`, everything else is `Vcs`.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result, Service};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub labels: Vec<String>,
    pub is_pull_request: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub html_url: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    /// Blob SHA, required to update or delete the file.
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
    pub message: String,
    pub branch: String,
}

#[async_trait]
pub trait Vcs: Send + Sync {
    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue>;

    /// Returns the new comment's id.
    async fn create_issue_comment(&self, repo: &str, number: u64, body: &str) -> Result<u64>;

    async fn add_labels(&self, repo: &str, number: u64, labels: &[String]) -> Result<()>;

    /// Removing a label that is not present succeeds.
    async fn remove_label(&self, repo: &str, number: u64, label: &str) -> Result<()>;

    async fn create_pull_request(&self, repo: &str, pr: &NewPullRequest) -> Result<PullRequest>;

    async fn get_pull_request(&self, repo: &str, number: u64) -> Result<PullRequest>;

    async fn update_pull_request_body(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<PullRequest>;

    async fn create_pr_comment(&self, repo: &str, pr_number: u64, body: &str) -> Result<u64>;

    async fn create_branch(&self, repo: &str, branch: &str, from: &str) -> Result<()>;

    async fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool>;

    async fn get_file_content(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<FileContent>>;

    /// Update the file if it exists on `branch`, create it otherwise.
    /// Returns the commit SHA.
    async fn create_or_update_file(&self, repo: &str, file: &FileWrite) -> Result<String>;

    async fn delete_file(&self, repo: &str, path: &str, message: &str, branch: &str)
    -> Result<()>;

    /// File paths on `branch`.
    async fn list_repository_structure(&self, repo: &str, branch: &str) -> Result<Vec<String>>;

    /// Make sure the PR body references the issue. Returns whether the body
    /// had to be edited.
    async fn link_issue_to_pr(&self, repo: &str, issue_number: u64, pr_number: u64) -> Result<bool> {
        let pr = self.get_pull_request(repo, pr_number).await?;
        if references_issue(&pr.body, issue_number) {
            return Ok(false);
        }
        let body = if pr.body.trim().is_empty() {
            format!("Closes #{issue_number}")
        } else {
            format!("{}\n\nCloses #{issue_number}", pr.body)
        };
        self.update_pull_request_body(repo, pr_number, &body).await?;
        Ok(true)
    }
}

/// Whether `body` contains `Closes #N` (any case) for exactly this issue number.
pub fn references_issue(body: &str, issue_number: u64) -> bool {
    let needle = format!("closes #{issue_number}");
    let haystack = body.to_ascii_lowercase();
    haystack.match_indices(&needle).any(|(idx, m)| {
        !haystack[idx + m.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

#[derive(Debug, Clone)]
pub struct GitHubSettings {
    pub token: String,
    /// `https://api.github.com` unless pointed at an enterprise host.
    pub api_base: String,
    pub timeout: Duration,
}

/// GitHub REST client.
pub struct GitHubClient {
    http: reqwest::Client,
    api_base: String,
}

const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

impl GitHubClient {
    pub fn new(settings: &GitHubSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("issuewright"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            HeaderValue::from_static("2022-11-28"),
        );
        let auth = HeaderValue::from_str(&format!("Bearer {}", settings.token.trim())).map_err(
            |e| Error::Vcs {
                operation: "configure client".into(),
                status: None,
                message: format!("invalid token header: {e}"),
            },
        )?;
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::Vcs {
                operation: "configure client".into(),
                status: None,
                message: e.to_string(),
            })?;

        Ok(Self {
            http,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, repo: &str, path: &str) -> String {
        format!("{}/repos/{}/{}", self.api_base, repo, path)
    }

    fn contents_url(&self, repo: &str, path: &str) -> String {
        self.url(repo, &format!("contents/{}", encode_path(path)))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<T> {
        let resp = self.send_raw(operation, req).await?;
        resp.json::<T>().await.map_err(|e| Error::Vcs {
            operation: operation.to_string(),
            status: None,
            message: format!("unreadable response: {e}"),
        })
    }

    async fn send_raw(
        &self,
        operation: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let resp = req.send().await.map_err(|e| {
            Error::transient(Service::Vcs, format!("{operation} request failed: {e}"))
        })?;
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            return Ok(resp);
        }
        let rate_limited = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "0");
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(operation, status, rate_limited, &body))
    }
}

fn classify_status(operation: &str, status: u16, rate_limited: bool, body: &str) -> Error {
    let message = crate::error::excerpt(body, 300);
    if status == 404 {
        return Error::NotFound(operation.to_string());
    }
    let secondary_limit = status == 403 && body.to_ascii_lowercase().contains("rate limit");
    if status == 408 || status == 429 || status >= 500 || rate_limited || secondary_limit {
        return Error::transient(
            Service::Vcs,
            format!("{operation} failed with status {status}: {message}"),
        );
    }
    Error::Vcs {
        operation: operation.to_string(),
        status: Some(status),
        message,
    }
}

fn is_existing_ref(error: &Error) -> bool {
    matches!(
        error,
        Error::Vcs { status: Some(422), message, .. }
            if message.to_ascii_lowercase().contains("reference already exists")
    )
}

fn encode_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn encode_query(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

fn decode_content(operation: &str, encoded: &str) -> Result<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64.decode(compact).map_err(|e| Error::Vcs {
        operation: operation.to_string(),
        status: None,
        message: format!("invalid base64 content: {e}"),
    })?;
    String::from_utf8(bytes).map_err(|e| Error::Vcs {
        operation: operation.to_string(),
        status: None,
        message: format!("file is not UTF-8: {e}"),
    })
}

#[derive(Deserialize)]
struct IssueBody {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    #[serde(default)]
    labels: Vec<LabelBody>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct LabelBody {
    name: String,
}

#[derive(Deserialize)]
struct CommentBody {
    id: u64,
}

#[derive(Deserialize)]
struct PullRequestBody {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    html_url: String,
    head: RefBody,
    base: RefBody,
}

#[derive(Deserialize)]
struct RefBody {
    #[serde(rename = "ref")]
    name: String,
}

impl From<PullRequestBody> for PullRequest {
    fn from(pr: PullRequestBody) -> Self {
        Self {
            number: pr.number,
            title: pr.title,
            body: pr.body.unwrap_or_default(),
            html_url: pr.html_url,
            head: pr.head.name,
            base: pr.base.name,
        }
    }
}

#[derive(Deserialize)]
struct GitRefBody {
    object: GitObjectBody,
}

#[derive(Deserialize)]
struct GitObjectBody {
    sha: String,
}

#[derive(Deserialize)]
struct ContentBody {
    path: String,
    sha: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct PutContentBody {
    commit: GitObjectBody,
}

#[derive(Deserialize)]
struct TreeBody {
    tree: Vec<TreeEntryBody>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Deserialize)]
struct TreeEntryBody {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[async_trait]
impl Vcs for GitHubClient {
    async fn get_issue(&self, repo: &str, number: u64) -> Result<Issue> {
        let issue: IssueBody = self
            .send(
                "get issue",
                self.http.get(self.url(repo, &format!("issues/{number}"))),
            )
            .await?;
        Ok(Issue {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            state: issue.state,
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            is_pull_request: issue.pull_request.is_some(),
        })
    }

    async fn create_issue_comment(&self, repo: &str, number: u64, body: &str) -> Result<u64> {
        let comment: CommentBody = self
            .send(
                "create issue comment",
                self.http
                    .post(self.url(repo, &format!("issues/{number}/comments")))
                    .json(&serde_json::json!({ "body": body })),
            )
            .await?;
        tracing::debug!(repo, number, comment_id = comment.id, "Posted comment");
        Ok(comment.id)
    }

    async fn add_labels(&self, repo: &str, number: u64, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        self.send_raw(
            "add labels",
            self.http
                .post(self.url(repo, &format!("issues/{number}/labels")))
                .json(&serde_json::json!({ "labels": labels })),
        )
        .await?;
        Ok(())
    }

    async fn remove_label(&self, repo: &str, number: u64, label: &str) -> Result<()> {
        let url = self.url(
            repo,
            &format!("issues/{number}/labels/{}", encode_query(label)),
        );
        match self.send_raw("remove label", self.http.delete(url)).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => {
                tracing::debug!(repo, number, label, "Label was not present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_pull_request(&self, repo: &str, pr: &NewPullRequest) -> Result<PullRequest> {
        let created: PullRequestBody = self
            .send(
                "create pull request",
                self.http.post(self.url(repo, "pulls")).json(&serde_json::json!({
                    "title": pr.title,
                    "body": pr.body,
                    "head": pr.head,
                    "base": pr.base,
                })),
            )
            .await?;
        Ok(created.into())
    }

    async fn get_pull_request(&self, repo: &str, number: u64) -> Result<PullRequest> {
        let pr: PullRequestBody = self
            .send(
                "get pull request",
                self.http.get(self.url(repo, &format!("pulls/{number}"))),
            )
            .await?;
        Ok(pr.into())
    }

    async fn update_pull_request_body(
        &self,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<PullRequest> {
        let pr: PullRequestBody = self
            .send(
                "update pull request",
                self.http
                    .patch(self.url(repo, &format!("pulls/{number}")))
                    .json(&serde_json::json!({ "body": body })),
            )
            .await?;
        Ok(pr.into())
    }

    async fn create_pr_comment(&self, repo: &str, pr_number: u64, body: &str) -> Result<u64> {
        // Conversation comments on a PR live under the issues endpoint.
        self.create_issue_comment(repo, pr_number, body).await
    }

    async fn create_branch(&self, repo: &str, branch: &str, from: &str) -> Result<()> {
        let base: GitRefBody = self
            .send(
                "get base ref",
                self.http
                    .get(self.url(repo, &format!("git/ref/heads/{}", encode_path(from)))),
            )
            .await?;
        let created = self
            .send_raw(
                "create branch",
                self.http
                    .post(self.url(repo, "git/refs"))
                    .json(&serde_json::json!({
                        "ref": format!("refs/heads/{branch}"),
                        "sha": base.object.sha,
                    })),
            )
            .await;
        match created {
            Ok(_) => tracing::info!(repo, branch, from, "Created branch"),
            // Lost a race with another creator after the existence check.
            Err(e) if is_existing_ref(&e) => {
                tracing::info!(repo, branch, "Branch already exists");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn branch_exists(&self, repo: &str, branch: &str) -> Result<bool> {
        let url = self.url(repo, &format!("branches/{}", encode_query(branch)));
        match self.send_raw("get branch", self.http.get(url)).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_file_content(
        &self,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<Option<FileContent>> {
        let url = format!(
            "{}?ref={}",
            self.contents_url(repo, path),
            encode_query(branch)
        );
        match self
            .send::<ContentBody>("get file content", self.http.get(url))
            .await
        {
            Ok(body) => Ok(Some(FileContent {
                content: decode_content("get file content", &body.content)?,
                path: body.path,
                sha: body.sha,
            })),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_or_update_file(&self, repo: &str, file: &FileWrite) -> Result<String> {
        let existing = self
            .get_file_content(repo, &file.path, &file.branch)
            .await?;
        let mut payload = serde_json::json!({
            "message": file.message,
            "content": BASE64.encode(file.content.as_bytes()),
            "branch": file.branch,
        });
        if let Some(existing) = &existing {
            payload["sha"] = serde_json::Value::String(existing.sha.clone());
        }
        let put: PutContentBody = self
            .send(
                "write file",
                self.http
                    .put(self.contents_url(repo, &file.path))
                    .json(&payload),
            )
            .await?;
        tracing::debug!(
            repo,
            path = %file.path,
            branch = %file.branch,
            updated = existing.is_some(),
            "Committed file"
        );
        Ok(put.commit.sha)
    }

    async fn delete_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        branch: &str,
    ) -> Result<()> {
        let existing = self
            .get_file_content(repo, path, branch)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {path} on {branch}")))?;
        self.send_raw(
            "delete file",
            self.http
                .delete(self.contents_url(repo, path))
                .json(&serde_json::json!({
                    "message": message,
                    "sha": existing.sha,
                    "branch": branch,
                })),
        )
        .await?;
        Ok(())
    }

    async fn list_repository_structure(&self, repo: &str, branch: &str) -> Result<Vec<String>> {
        let tree: TreeBody = self
            .send(
                "list repository structure",
                self.http.get(self.url(
                    repo,
                    &format!("git/trees/{}?recursive=1", encode_query(branch)),
                )),
            )
            .await?;
        if tree.truncated {
            tracing::warn!(repo, branch, "Repository tree listing was truncated");
        }
        Ok(tree
            .tree
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| e.path)
            .collect())
    }
}
