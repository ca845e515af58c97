//! The per-issue lifecycle state machine.
//!
//! Every handler that mutates a conversation runs under the store lease for
//! that conversation and commits through a version-checked transition, so
//! concurrent deliveries for the same issue serialize instead of racing.

use std::sync::Arc;
use std::time::Duration;

use issuewright_agents::code::CodeAgent;
use issuewright_agents::error::{Error, Result};
use issuewright_agents::models::{
    Analysis, AnalysisOutcome, CodeGenerationStatus, Conversation, ConversationStatus,
    LABEL_READY_FOR_DEV, NewConversation, Transition,
};
use issuewright_agents::output::ORCHESTRATOR;
use issuewright_agents::requirements::RequirementsAgent;
use issuewright_agents::store::ConversationStore;
use issuewright_agents::AgentDeps;
use tokio::time::Instant;

use crate::events::{CommentEvent, IssueEvent, PullRequestEvent, WebhookEvent, referenced_issues};

const LEASE_POLL_START: Duration = Duration::from_millis(50);
const LEASE_POLL_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Clarification rounds allowed before handing off to a human.
    pub max_clarification_turns: u32,
    pub lease_ttl: Duration,
    /// How long to wait for another delivery to release a conversation.
    pub lease_wait: Duration,
    /// Comments from this login are treated as our own.
    pub bot_login: Option<String>,
    /// Repositories to act on; empty means all.
    pub repos: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_clarification_turns: 5,
            lease_ttl: Duration::from_secs(600),
            lease_wait: Duration::from_secs(30),
            bot_login: None,
            repos: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Ignored,
    /// Handled, but the work it asked for did not succeed. Not retried.
    Failed,
}

/// What a dispatched event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub message: String,
    pub conversation_status: Option<ConversationStatus>,
    pub pr_number: Option<u64>,
}

impl Outcome {
    fn success(message: impl Into<String>, status: ConversationStatus) -> Self {
        Self {
            status: OutcomeStatus::Success,
            message: message.into(),
            conversation_status: Some(status),
            pr_number: None,
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Ignored,
            message: message.into(),
            conversation_status: None,
            pr_number: None,
        }
    }
}

pub struct Orchestrator {
    deps: AgentDeps,
    requirements: RequirementsAgent,
    code: CodeAgent,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(deps: AgentDeps, base_branch: impl Into<String>, settings: OrchestratorSettings) -> Self {
        Self {
            requirements: RequirementsAgent::new(deps.clone()),
            code: CodeAgent::new(deps.clone(), base_branch),
            deps,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.deps.store
    }

    pub async fn dispatch(&self, event: &WebhookEvent, delivery_id: &str) -> Result<Outcome> {
        if let Some(repo) = event.repo().filter(|r| !self.repo_enabled(r)) {
            return Ok(Outcome::ignored(format!("Repository {repo} not enabled")));
        }
        match event {
            WebhookEvent::Ping => Ok(Outcome::ignored("pong")),
            WebhookEvent::Ignored { reason } => Ok(Outcome::ignored(reason.clone())),
            WebhookEvent::IssueOpened(issue) => self.on_issue_opened(issue, delivery_id).await,
            WebhookEvent::IssueLabeled { issue, label } => {
                self.on_issue_labeled(issue, label, delivery_id).await
            }
            WebhookEvent::CommentCreated(comment) => {
                self.on_comment_created(comment, delivery_id).await
            }
            WebhookEvent::PullRequestOpened(pr) => self.on_pull_request_opened(pr, delivery_id).await,
        }
    }

    fn repo_enabled(&self, repo: &str) -> bool {
        self.settings.repos.is_empty()
            || self.settings.repos.iter().any(|r| r.eq_ignore_ascii_case(repo))
    }

    fn is_own_comment(&self, comment: &CommentEvent) -> bool {
        comment.author_is_bot
            || self
                .settings
                .bot_login
                .as_deref()
                .is_some_and(|login| login.eq_ignore_ascii_case(&comment.author_login))
    }

    async fn on_issue_opened(&self, issue: &IssueEvent, delivery_id: &str) -> Result<Outcome> {
        let (conversation, created) = self
            .deps
            .store
            .create_conversation(&NewConversation {
                issue_id: issue.issue_id,
                issue_number: issue.issue_number,
                repo: issue.repo.clone(),
                title: issue.title.clone(),
                body: issue.body.clone(),
            })
            .await?;
        if created {
            tracing::info!(
                repo = %issue.repo,
                issue_number = issue.issue_number,
                conversation_id = %conversation.id,
                "Conversation created"
            );
        }

        let lease = self.lease(&conversation.id, delivery_id).await?;
        let outcome = self.analyze_new_issue(&conversation.id).await;
        lease.release().await;
        outcome
    }

    async fn analyze_new_issue(&self, conversation_id: &str) -> Result<Outcome> {
        let conversation = self.reload(conversation_id).await?;
        if conversation.status != ConversationStatus::Analyzing || conversation.analysis.is_some() {
            return Ok(Outcome::ignored("Conversation already analyzed"));
        }

        let analysis = self
            .requirements
            .refine(&conversation.title, &conversation.body, &[])
            .await?;
        self.deps
            .audit(
                Some(&conversation.id),
                &ORCHESTRATOR,
                "issue_analyzed",
                serde_json::json!({
                    "issue_number": conversation.issue_number,
                    "needs_clarification": analysis.needs_clarification,
                    "is_complete": analysis.is_complete,
                    "question_count": analysis.questions.len(),
                }),
            )
            .await;
        self.apply_analysis(&conversation, analysis).await
    }

    async fn on_comment_created(&self, comment: &CommentEvent, delivery_id: &str) -> Result<Outcome> {
        if comment.on_pull_request {
            return Ok(Outcome::ignored("Comment on pull request"));
        }
        if self.is_own_comment(comment) {
            return Ok(Outcome::ignored("Bot comment"));
        }
        if comment.body.trim().is_empty() {
            return Ok(Outcome::ignored("Empty comment"));
        }
        let Some(conversation) = self
            .deps
            .store
            .get_conversation(&comment.repo, comment.issue_number)
            .await?
        else {
            return Ok(Outcome::ignored("No active conversation"));
        };
        if !awaits_input(&conversation) {
            return Ok(Outcome::ignored(format!(
                "Conversation is {}, not awaiting answers",
                conversation.status
            )));
        }

        let lease = self.lease(&conversation.id, delivery_id).await?;
        let outcome = self.process_response(&conversation.id, comment).await;
        lease.release().await;
        outcome
    }

    async fn process_response(&self, conversation_id: &str, comment: &CommentEvent) -> Result<Outcome> {
        let mut conversation = self.reload(conversation_id).await?;
        if !awaits_input(&conversation) {
            return Ok(Outcome::ignored(format!(
                "Conversation is {}, not awaiting answers",
                conversation.status
            )));
        }
        if conversation.latest_turn().is_none() {
            // Stalled before any question was asked: the comment opens a
            // context-only turn so it reaches the next refinement.
            conversation = self
                .commit(
                    &conversation,
                    Transition::to(ConversationStatus::Analyzing).with_turn(Vec::new()),
                )
                .await?;
        }
        let Some(turn) = conversation.latest_turn() else {
            return Ok(Outcome::ignored("No open clarification turn"));
        };

        let recorded = self
            .deps
            .store
            .record_turn_response(&conversation.id, turn.number, comment.comment_id, &comment.body)
            .await?;
        if !recorded {
            tracing::debug!(
                conversation_id = %conversation.id,
                comment_id = comment.comment_id,
                "Response already recorded"
            );
        }
        let turn_number = turn.number;
        let conversation = self.reload(conversation_id).await?;

        let analysis = self
            .requirements
            .refine(&conversation.title, &conversation.body, &conversation.turns)
            .await?;
        self.deps
            .audit(
                Some(&conversation.id),
                &ORCHESTRATOR,
                "user_response_processed",
                serde_json::json!({
                    "issue_number": conversation.issue_number,
                    "turn": turn_number,
                    "comment_id": comment.comment_id,
                    "author": comment.author_login,
                    "needs_clarification": analysis.needs_clarification,
                    "is_complete": analysis.is_complete,
                }),
            )
            .await;
        self.apply_analysis(&conversation, analysis).await
    }

    /// Carry out the side effects an analysis calls for, then commit the
    /// matching transition.
    async fn apply_analysis(&self, conversation: &Conversation, analysis: Analysis) -> Result<Outcome> {
        let repo = conversation.repo.as_str();
        let issue_number = conversation.issue_number;

        match analysis.outcome() {
            AnalysisOutcome::NeedsClarification => {
                let turns = conversation.turns.len();
                if turns >= self.settings.max_clarification_turns as usize {
                    self.requirements
                        .request_manual_intervention(repo, issue_number, turns)
                        .await?;
                    let updated = self
                        .commit(
                            conversation,
                            Transition::to(ConversationStatus::NeedsManualIntervention)
                                .with_analysis(analysis),
                        )
                        .await?;
                    self.deps
                        .audit(
                            Some(&conversation.id),
                            &ORCHESTRATOR,
                            "manual_intervention_required",
                            serde_json::json!({
                                "issue_number": issue_number,
                                "turns": turns,
                                "max_turns": self.settings.max_clarification_turns,
                            }),
                        )
                        .await;
                    return Ok(Outcome::success(
                        "Clarification limit reached, manual intervention required",
                        updated.status,
                    ));
                }

                self.requirements
                    .ask_clarifying_questions(repo, issue_number, &conversation.id, &analysis.questions)
                    .await?;
                let questions = analysis.questions.clone();
                let count = questions.len();
                let updated = self
                    .commit(
                        conversation,
                        Transition::to(ConversationStatus::NeedsClarification)
                            .with_analysis(analysis)
                            .with_turn(questions),
                    )
                    .await?;
                Ok(Outcome::success(
                    format!("Asked {count} clarifying questions"),
                    updated.status,
                ))
            }
            AnalysisOutcome::Complete => {
                self.requirements
                    .mark_ready_for_development(
                        repo,
                        issue_number,
                        &conversation.id,
                        &conversation.body,
                        &analysis,
                    )
                    .await?;
                let updated = self
                    .commit(
                        conversation,
                        Transition::to(ConversationStatus::ReadyForDev).with_analysis(analysis),
                    )
                    .await?;
                Ok(Outcome::success(
                    "Requirements complete, issue ready for development",
                    updated.status,
                ))
            }
            AnalysisOutcome::StillAnalyzing => {
                let updated = self
                    .commit(
                        conversation,
                        Transition::to(ConversationStatus::Analyzing).with_analysis(analysis),
                    )
                    .await?;
                self.deps
                    .audit(
                        Some(&conversation.id),
                        &ORCHESTRATOR,
                        "analysis_pending",
                        serde_json::json!({ "issue_number": issue_number }),
                    )
                    .await;
                Ok(Outcome::success("Analysis pending", updated.status))
            }
        }
    }

    async fn on_issue_labeled(
        &self,
        issue: &IssueEvent,
        label: &str,
        delivery_id: &str,
    ) -> Result<Outcome> {
        if label != LABEL_READY_FOR_DEV {
            return Ok(Outcome::ignored("Label not a trigger"));
        }
        let Some(conversation) = self
            .deps
            .store
            .get_conversation(&issue.repo, issue.issue_number)
            .await?
        else {
            return Ok(Outcome::ignored("No active conversation"));
        };

        let lease = self.lease(&conversation.id, delivery_id).await?;
        let outcome = self.start_development(&conversation.id, issue).await;
        lease.release().await;
        outcome
    }

    async fn start_development(&self, conversation_id: &str, issue: &IssueEvent) -> Result<Outcome> {
        let mut conversation = self.reload(conversation_id).await?;
        match conversation.status {
            ConversationStatus::ReadyForDev => {}
            ConversationStatus::NeedsManualIntervention | ConversationStatus::Analyzing => {
                // A maintainer refined the issue by hand and applied the label.
                conversation = self
                    .commit(&conversation, Transition::to(ConversationStatus::ReadyForDev))
                    .await?;
            }
            other => {
                return Ok(Outcome::ignored(format!(
                    "Conversation is {other}, not ready for development"
                )));
            }
        }

        let latest = self
            .deps
            .store
            .latest_code_generation(&conversation.id)
            .await?;
        if let Some(latest) = latest.filter(|g| g.status == CodeGenerationStatus::PrCreated) {
            return Ok(Outcome::ignored(format!(
                "Pull request #{} already opened",
                latest.pr_number.unwrap_or_default()
            )));
        }

        let refined = conversation
            .analysis
            .as_ref()
            .and_then(|a| a.refined_description.as_deref())
            .filter(|d| !d.trim().is_empty());
        let requirements = match refined {
            Some(description) => description.to_string(),
            None if !issue.body.trim().is_empty() => issue.body.clone(),
            None => conversation.body.clone(),
        };
        let criteria = conversation
            .analysis
            .as_ref()
            .map(|a| a.acceptance_criteria.clone())
            .unwrap_or_default();

        let result = self
            .code
            .handle_ready_for_dev(
                &conversation.repo,
                conversation.issue_number,
                &conversation.id,
                &requirements,
                &criteria,
            )
            .await?;

        match result.status {
            CodeGenerationStatus::PrCreated => Ok(Outcome {
                pr_number: result.pr_number,
                ..Outcome::success("Pull request created", conversation.status)
            }),
            _ => Ok(Outcome {
                status: OutcomeStatus::Failed,
                message: format!(
                    "Code generation failed: {}",
                    result.error_message.as_deref().unwrap_or("unknown error")
                ),
                conversation_status: Some(conversation.status),
                pr_number: None,
            }),
        }
    }

    async fn on_pull_request_opened(&self, pr: &PullRequestEvent, delivery_id: &str) -> Result<Outcome> {
        let mut linked = Vec::new();
        for issue_number in referenced_issues(&pr.body) {
            let Some(conversation) = self.deps.store.get_conversation(&pr.repo, issue_number).await?
            else {
                continue;
            };
            if conversation.status == ConversationStatus::InDevelopment {
                continue;
            }

            let lease = self.lease(&conversation.id, delivery_id).await?;
            let result = self.mark_in_development(&conversation.id, pr).await;
            lease.release().await;
            if result? {
                linked.push(issue_number);
            }
        }

        if linked.is_empty() {
            return Ok(Outcome::ignored("No tracked issue referenced"));
        }
        let issues: Vec<String> = linked.iter().map(|n| format!("#{n}")).collect();
        Ok(Outcome {
            pr_number: Some(pr.pr_number),
            ..Outcome::success(
                format!("Pull request #{} linked to {}", pr.pr_number, issues.join(", ")),
                ConversationStatus::InDevelopment,
            )
        })
    }

    async fn mark_in_development(&self, conversation_id: &str, pr: &PullRequestEvent) -> Result<bool> {
        let conversation = self.reload(conversation_id).await?;
        if conversation.status == ConversationStatus::InDevelopment {
            return Ok(false);
        }
        self.commit(&conversation, Transition::to(ConversationStatus::InDevelopment))
            .await?;
        self.deps
            .audit(
                Some(&conversation.id),
                &ORCHESTRATOR,
                "pr_linked",
                serde_json::json!({
                    "issue_number": conversation.issue_number,
                    "pr_number": pr.pr_number,
                    "head": pr.head,
                    "previous_status": conversation.status.as_str(),
                }),
            )
            .await;
        Ok(true)
    }

    async fn reload(&self, conversation_id: &str) -> Result<Conversation> {
        self.deps
            .store
            .get_conversation_by_id(conversation_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))
    }

    async fn commit(&self, conversation: &Conversation, transition: Transition) -> Result<Conversation> {
        let to = transition.status;
        match self
            .deps
            .store
            .commit_transition(&conversation.id, conversation.version, &transition)
            .await
        {
            Ok(updated) => {
                tracing::info!(
                    conversation_id = %conversation.id,
                    issue = %conversation.key(),
                    from = %conversation.status,
                    to = %to,
                    version = updated.version,
                    "Transition committed"
                );
                Ok(updated)
            }
            Err(e) => {
                tracing::error!(
                    conversation_id = %conversation.id,
                    from = %conversation.status,
                    to = %to,
                    error = %e,
                    "Transition commit failed after side effects"
                );
                self.deps
                    .audit(
                        Some(&conversation.id),
                        &ORCHESTRATOR,
                        "transition_commit_failed",
                        serde_json::json!({
                            "issue_number": conversation.issue_number,
                            "from": conversation.status.as_str(),
                            "to": to.as_str(),
                            "expected_version": conversation.version,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Take the conversation lease, polling while another delivery holds it.
    async fn lease(&self, conversation_id: &str, delivery_id: &str) -> Result<Lease> {
        let owner = format!("{delivery_id}:{:08x}", rand::random::<u32>());
        let deadline = Instant::now() + self.settings.lease_wait;
        let mut delay = LEASE_POLL_START;
        loop {
            if self
                .deps
                .store
                .acquire_lease(conversation_id, &owner, self.settings.lease_ttl)
                .await?
            {
                tracing::debug!(conversation_id, owner = %owner, "Lease acquired");
                return Ok(Lease {
                    store: self.deps.store.clone(),
                    conversation_id: conversation_id.to_string(),
                    owner,
                    released: false,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(conversation_id, delivery_id, "Conversation still busy, giving up");
                return Err(Error::ConversationBusy(conversation_id.to_string()));
            }
            tracing::debug!(conversation_id, delivery_id, "Conversation busy, waiting");
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(LEASE_POLL_MAX);
        }
    }
}

/// Waiting on answers, or stalled in analysis after a result that neither
/// asked nor concluded. A reporter comment moves either one forward.
fn awaits_input(conversation: &Conversation) -> bool {
    match conversation.status {
        ConversationStatus::NeedsClarification => true,
        ConversationStatus::Analyzing => conversation.analysis.is_some(),
        _ => false,
    }
}

/// A held conversation lease. Released explicitly; if the handler is
/// cancelled first, the release is spawned on drop.
struct Lease {
    store: Arc<dyn ConversationStore>,
    conversation_id: String,
    owner: String,
    released: bool,
}

impl Lease {
    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self
            .store
            .release_lease(&self.conversation_id, &self.owner)
            .await
        {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                error = %e,
                "Failed to release lease; it will expire"
            );
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let conversation_id = std::mem::take(&mut self.conversation_id);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = store.release_lease(&conversation_id, &owner).await {
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Failed to release lease");
            }
        });
    }
}
