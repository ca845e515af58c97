//! Code agent: generates an implementation for refined requirements and
//! materializes it as a branch, commits and a pull request.
//!
//! Materialization is not transactional. Files committed before a failure
//! stay on the branch; the attempt is recorded as `failed` with the paths
//! that made it, and a human cleans up.

use crate::agent::{AgentDeps, parse_json_block};
use crate::error::{Error, Result};
use crate::llm::Prompt;
use crate::models::{
    CodeGeneration, CodeGenerationResult, CodeGenerationStatus, FileOperation,
};
use crate::output::{self, CODE_AGENT};
use crate::retry::execute_with_retry;
use crate::vcs::{FileWrite, NewPullRequest, PullRequest};

const SYSTEM_PROMPT: &str = "You are a senior software engineer who writes clean, maintainable, \
production-ready code.

Understand the requirements, design a focused solution, implement it with proper error \
handling, and write tests that cover the happy path and the edge cases. Follow the \
conventions of the language and of the existing codebase. Provide complete file contents, \
never snippets, including every import.";

const OUTPUT_FORMAT: &str = r#"Respond with a single JSON object and nothing else:
{
  "files_to_create": [{"file_path": string, "content": string,
                       "operation": "create" | "modify" | "delete",
                       "language": string | null, "description": string}],
  "test_files": [{"file_path": string, "content": string, "test_framework": string,
                  "test_count": number, "coverage_targets": [string]}],
  "commit_message": string,          // conventional commits format
  "pr_title": string,
  "pr_description": string,          // summary and test plan
  "branch_name": string,             // e.g. feature/shopping-cart
  "dependencies": [string],
  "environment_variables": {"NAME": "purpose"},
  "migration_steps": [string],
  "breaking_changes": [string],
  "estimated_test_time_seconds": number | null
}"#;

/// Paths listed in the prompt as codebase context.
const MAX_CONTEXT_PATHS: usize = 200;

pub struct CodeAgent {
    deps: AgentDeps,
    base_branch: String,
}

impl CodeAgent {
    pub fn new(deps: AgentDeps, base_branch: impl Into<String>) -> Self {
        Self {
            deps,
            base_branch: base_branch.into(),
        }
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn build_prompt(
        &self,
        requirements: &str,
        acceptance_criteria: &[String],
        codebase: &[String],
    ) -> Prompt {
        let mut system = SYSTEM_PROMPT.to_string();
        let domain = self.deps.domain.code_context();
        if !domain.trim().is_empty() {
            system.push_str("\n\n## Codebase conventions\n");
            system.push_str(domain.trim());
        }

        let mut user = format!("Implement this requirement.\n\n## Requirements\n{requirements}\n");
        if !acceptance_criteria.is_empty() {
            user.push_str("\n## Acceptance Criteria\n");
            for (i, c) in acceptance_criteria.iter().enumerate() {
                user.push_str(&format!("{}. {c}\n", i + 1));
            }
        }
        user.push_str("\n## Tech Stack\n");
        for tech in self.deps.domain.tech_stack() {
            user.push_str(&format!("- {tech}\n"));
        }
        if !codebase.is_empty() {
            user.push_str("\n## Existing files\n");
            for path in codebase.iter().take(MAX_CONTEXT_PATHS) {
                user.push_str(&format!("- {path}\n"));
            }
            if codebase.len() > MAX_CONTEXT_PATHS {
                user.push_str(&format!(
                    "- ... and {} more\n",
                    codebase.len() - MAX_CONTEXT_PATHS
                ));
            }
        }
        user.push('\n');
        user.push_str(OUTPUT_FORMAT);
        Prompt::new(system, user)
    }

    /// One reasoning call, retried on transient failure.
    pub async fn generate(
        &self,
        repo: &str,
        requirements: &str,
        acceptance_criteria: &[String],
    ) -> Result<CodeGeneration> {
        let codebase = match execute_with_retry(&self.deps.vcs_retry, "list repository", || {
            self.deps
                .vcs
                .list_repository_structure(repo, &self.base_branch)
        })
        .await
        {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(repo, error = %e, "Generating without repository listing");
                Vec::new()
            }
        };
        let prompt = self.build_prompt(requirements, acceptance_criteria, &codebase);
        let generation = self
            .deps
            .reason("generate code", &prompt, parse_code_generation)
            .await?;
        tracing::info!(
            repo,
            branch = %generation.branch_name,
            files = generation.files_to_create.len(),
            tests = generation.test_files.len(),
            "Code generated"
        );
        Ok(generation)
    }

    /// Create the branch, commit every file, open the PR and link it to the
    /// issue. A failure in any step before the PR exists yields a `Failed`
    /// result, not an error; errors are reserved for the store.
    pub async fn materialize(
        &self,
        repo: &str,
        issue_number: u64,
        conversation_id: &str,
        generation: &CodeGeneration,
    ) -> Result<CodeGenerationResult> {
        let record = self
            .deps
            .store
            .create_code_generation(
                conversation_id,
                &generation.branch_name,
                &generation.files_to_create,
                &generation.test_files,
            )
            .await?;

        let mut committed = Vec::new();
        match self
            .open_pull_request(repo, issue_number, generation, &mut committed)
            .await
        {
            Ok(pr) => {
                self.finish(
                    conversation_id,
                    &record.id,
                    CodeGenerationStatus::PrCreated,
                    Some(pr.number),
                    None,
                )
                .await?;
                self.deps
                    .audit(
                        Some(conversation_id),
                        &CODE_AGENT,
                        "pr_created",
                        serde_json::json!({
                            "pr_number": pr.number,
                            "issue_number": issue_number,
                            "branch_name": generation.branch_name,
                            "files_count": generation.files_to_create.len(),
                            "tests_count": generation.test_files.len(),
                        }),
                    )
                    .await;
                self.link(repo, issue_number, conversation_id, pr.number)
                    .await;

                let pr_url = if pr.html_url.is_empty() {
                    format!("https://github.com/{repo}/pull/{}", pr.number)
                } else {
                    pr.html_url
                };
                tracing::info!(repo, issue_number, pr_number = pr.number, "Pull request created");
                Ok(CodeGenerationResult {
                    record_id: record.id,
                    branch: generation.branch_name.clone(),
                    status: CodeGenerationStatus::PrCreated,
                    pr_number: Some(pr.number),
                    pr_url: Some(pr_url),
                    error_message: None,
                    committed_paths: committed,
                })
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    repo,
                    issue_number,
                    branch = %generation.branch_name,
                    committed = committed.len(),
                    error = %message,
                    "Code generation failed before the pull request was opened"
                );
                self.finish(
                    conversation_id,
                    &record.id,
                    CodeGenerationStatus::Failed,
                    None,
                    Some(&message),
                )
                .await?;
                self.deps
                    .audit(
                        Some(conversation_id),
                        &CODE_AGENT,
                        "code_generation_failed",
                        serde_json::json!({
                            "issue_number": issue_number,
                            "branch_name": generation.branch_name,
                            "error": message,
                            "committed_paths": committed,
                        }),
                    )
                    .await;
                Ok(CodeGenerationResult {
                    record_id: record.id,
                    branch: generation.branch_name.clone(),
                    status: CodeGenerationStatus::Failed,
                    pr_number: None,
                    pr_url: None,
                    error_message: Some(message),
                    committed_paths: committed,
                })
            }
        }
    }

    /// Move the record to its terminal status. If that write fails the record
    /// stays `generated`, so the audit entry is the only durable trace of
    /// the outcome (and of the PR number, when one was opened).
    async fn finish(
        &self,
        conversation_id: &str,
        record_id: &str,
        status: CodeGenerationStatus,
        pr_number: Option<u64>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let finished = self
            .deps
            .store
            .finish_code_generation(record_id, status, pr_number, error_message)
            .await;
        if let Err(e) = &finished {
            tracing::error!(
                conversation_id,
                record_id,
                status = status.as_str(),
                pr_number = ?pr_number,
                error = %e,
                "Failed to record code generation outcome"
            );
            self.deps
                .audit(
                    Some(conversation_id),
                    &CODE_AGENT,
                    "code_generation_record_failed",
                    serde_json::json!({
                        "record_id": record_id,
                        "status": status.as_str(),
                        "pr_number": pr_number,
                        "error": e.to_string(),
                    }),
                )
                .await;
        }
        finished
    }

    /// Generate, materialize, and report the outcome on the issue.
    pub async fn handle_ready_for_dev(
        &self,
        repo: &str,
        issue_number: u64,
        conversation_id: &str,
        requirements: &str,
        acceptance_criteria: &[String],
    ) -> Result<CodeGenerationResult> {
        tracing::info!(repo, issue_number, "Starting development workflow");
        let generation = self
            .generate(repo, requirements, acceptance_criteria)
            .await?;
        self.deps
            .audit(
                Some(conversation_id),
                &CODE_AGENT,
                "code_generated",
                serde_json::json!({
                    "issue_number": issue_number,
                    "files_count": generation.files_to_create.len(),
                    "tests_count": generation.test_files.len(),
                    "branch_name": generation.branch_name,
                }),
            )
            .await;

        let result = self
            .materialize(repo, issue_number, conversation_id, &generation)
            .await?;

        let comment = match result.status {
            CodeGenerationStatus::PrCreated => output::pull_request_created(&generation, &result),
            _ => output::code_generation_failed(&result),
        };
        if let Err(e) = self
            .deps
            .vcs
            .create_issue_comment(repo, issue_number, &comment)
            .await
        {
            tracing::warn!(repo, issue_number, error = %e, "Failed to post outcome comment");
        }
        Ok(result)
    }

    async fn open_pull_request(
        &self,
        repo: &str,
        issue_number: u64,
        generation: &CodeGeneration,
        committed: &mut Vec<String>,
    ) -> Result<PullRequest> {
        let vcs = &self.deps.vcs;
        let policy = &self.deps.vcs_retry;
        let branch = generation.branch_name.as_str();
        let summary = generation
            .commit_message
            .lines()
            .next()
            .unwrap_or("Generated change")
            .trim();

        let exists = execute_with_retry(policy, "branch exists", || {
            vcs.branch_exists(repo, branch)
        })
        .await?;
        if !exists {
            vcs.create_branch(repo, branch, &self.base_branch).await?;
        }

        for file in &generation.files_to_create {
            let path = file.file_path.as_str();
            match file.operation {
                FileOperation::Delete => {
                    let message = format!("{summary}\n\nDelete {path}");
                    let deleted = execute_with_retry(policy, "delete file", || {
                        vcs.delete_file(repo, path, &message, branch)
                    })
                    .await;
                    match deleted {
                        Ok(()) | Err(Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                FileOperation::Create | FileOperation::Modify => {
                    let write = FileWrite {
                        path: path.to_string(),
                        content: file.content.clone(),
                        message: format!("{summary}\n\nWrite {path}"),
                        branch: branch.to_string(),
                    };
                    execute_with_retry(policy, "write file", || {
                        vcs.create_or_update_file(repo, &write)
                    })
                    .await?;
                }
            }
            tracing::debug!(repo, branch, path, "File committed");
            committed.push(path.to_string());
        }

        for test in &generation.test_files {
            let write = FileWrite {
                path: test.file_path.clone(),
                content: test.content.clone(),
                message: format!("{summary}\n\nAdd tests: {}", test.file_path),
                branch: branch.to_string(),
            };
            execute_with_retry(policy, "write file", || {
                vcs.create_or_update_file(repo, &write)
            })
            .await?;
            tracing::debug!(repo, branch, path = %test.file_path, "Test file committed");
            committed.push(test.file_path.clone());
        }

        vcs.create_pull_request(
            repo,
            &NewPullRequest {
                title: generation.pr_title.clone(),
                body: output::pull_request_body(generation, issue_number),
                head: branch.to_string(),
                base: self.base_branch.clone(),
            },
        )
        .await
    }

    /// Step (e). The PR already exists, so failure here is only logged.
    async fn link(&self, repo: &str, issue_number: u64, conversation_id: &str, pr_number: u64) {
        let linked = execute_with_retry(&self.deps.vcs_retry, "link issue", || {
            self.deps
                .vcs
                .link_issue_to_pr(repo, issue_number, pr_number)
        })
        .await;
        match linked {
            Ok(edited) => {
                self.deps
                    .audit(
                        Some(conversation_id),
                        &CODE_AGENT,
                        "pr_linked",
                        serde_json::json!({
                            "pr_number": pr_number,
                            "issue_number": issue_number,
                            "body_edited": edited,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(repo, issue_number, pr_number, error = %e, "Failed to link PR to issue");
            }
        }
    }
}

/// Parse and validate reasoning output against the `CodeGeneration` schema.
pub fn parse_code_generation(raw: &str) -> Result<CodeGeneration> {
    let generation: CodeGeneration = parse_json_block("CodeGeneration", raw)?;
    let invalid = |msg: String| Error::parse("CodeGeneration", msg, raw);

    if !is_valid_branch_name(&generation.branch_name) {
        return Err(invalid(format!(
            "invalid branch name {:?}",
            generation.branch_name
        )));
    }
    if generation.pr_title.trim().is_empty() {
        return Err(invalid("pr_title is empty".into()));
    }
    if generation.files_to_create.is_empty() && generation.test_files.is_empty() {
        return Err(invalid("no files were generated".into()));
    }
    let mut seen = std::collections::HashSet::new();
    let paths = generation
        .files_to_create
        .iter()
        .map(|f| f.file_path.as_str())
        .chain(generation.test_files.iter().map(|t| t.file_path.as_str()));
    for path in paths {
        if !is_valid_file_path(path) {
            return Err(invalid(format!("invalid file path {path:?}")));
        }
        if !seen.insert(path) {
            return Err(invalid(format!("file {path:?} appears more than once")));
        }
    }
    Ok(generation)
}

fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('/')
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && !name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c))
}

fn is_valid_file_path(path: &str) -> bool {
    !path.trim().is_empty()
        && !path.starts_with('/')
        && !path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
}
