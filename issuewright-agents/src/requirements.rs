//! Requirements agent: turns an issue (and any answers so far) into an
//! [`Analysis`], and performs the issue-side effects that follow.

use crate::agent::{AgentDeps, parse_json_block};
use crate::error::{Error, Result};
use crate::llm::Prompt;
use crate::models::{
    Analysis, LABEL_NEEDS_CLARIFICATION, LABEL_NEEDS_MANUAL_INTERVENTION, LABEL_READY_FOR_DEV,
    Turn,
};
use crate::output::{self, REQUIREMENTS_AGENT};
use crate::retry::execute_with_retry;

const SYSTEM_PROMPT: &str = "You are an experienced product owner and business analyst.

Your job is to:
1. Analyze feature requests and issue descriptions.
2. Identify missing information or ambiguities.
3. Ask specific, focused clarifying questions when needed.
4. Refine clear requirements into an actionable specification with acceptance criteria.
5. Estimate complexity and effort.

Consider edge cases, error handling, and non-functional requirements (performance,
security, UX). Be concise but thorough.";

const OUTPUT_FORMAT: &str = r#"Respond with a single JSON object and nothing else:
{
  "needs_clarification": bool,
  "questions": [string],            // required when needs_clarification is true
  "refined_description": string | null,
  "is_complete": bool,              // true only when ready for development
  "acceptance_criteria": [string],
  "suggested_labels": [string],
  "technical_considerations": [string],
  "estimated_complexity": "low" | "medium" | "high",
  "dependencies": [string],
  "estimated_effort_hours": number | null
}"#;

pub struct RequirementsAgent {
    deps: AgentDeps,
}

impl RequirementsAgent {
    pub fn new(deps: AgentDeps) -> Self {
        Self { deps }
    }

    pub fn build_prompt(&self, title: &str, body: &str, prior_turns: &[Turn]) -> Prompt {
        let mut system = SYSTEM_PROMPT.to_string();
        let domain = self.deps.domain.requirements_context();
        if !domain.trim().is_empty() {
            system.push_str("\n\n## Domain context\n");
            system.push_str(domain.trim());
        }
        system.push_str("\n\n## Technology stack\n");
        system.push_str(&self.deps.domain.tech_stack().join(", "));

        let mut user = format!("## Issue\n**Title:** {title}\n\n**Description:**\n{body}\n");
        if !prior_turns.is_empty() {
            user.push_str("\n## Clarification so far\n");
            for turn in prior_turns {
                user.push_str(&format!("\n### Round {}\n", turn.number));
                if turn.questions.is_empty() {
                    user.push_str("No questions were asked; the reporter added context.\n");
                } else {
                    user.push_str("Questions:\n");
                    for (i, q) in turn.questions.iter().enumerate() {
                        user.push_str(&format!("{}. {q}\n", i + 1));
                    }
                }
                if turn.responses.is_empty() {
                    user.push_str("Answers: (none yet)\n");
                } else {
                    user.push_str("Answers:\n");
                    for response in &turn.responses {
                        user.push_str(&format!("> {}\n", response.replace('\n', "\n> ")));
                    }
                }
            }
            user.push_str(
                "\nDecide whether every question has been adequately answered and the \
                 requirement is now clear enough for development, or whether more \
                 clarification is still needed. Do not repeat questions that were answered.\n",
            );
        }
        user.push('\n');
        user.push_str(OUTPUT_FORMAT);
        Prompt::new(system, user)
    }

    /// One reasoning call, retried on transient failure. Malformed output is
    /// a `Parse` error carrying an excerpt of the raw response.
    pub async fn refine(&self, title: &str, body: &str, prior_turns: &[Turn]) -> Result<Analysis> {
        let prompt = self.build_prompt(title, body, prior_turns);
        let analysis = self
            .deps
            .reason("refine requirements", &prompt, parse_analysis)
            .await?;
        tracing::info!(
            needs_clarification = analysis.needs_clarification,
            is_complete = analysis.is_complete,
            questions = analysis.questions.len(),
            "Requirements analyzed"
        );
        Ok(analysis)
    }

    /// Post the numbered questions and apply the clarification label.
    pub async fn ask_clarifying_questions(
        &self,
        repo: &str,
        issue_number: u64,
        conversation_id: &str,
        questions: &[String],
    ) -> Result<()> {
        tracing::info!(
            repo,
            issue_number,
            question_count = questions.len(),
            "Asking clarifying questions"
        );
        self.deps
            .vcs
            .create_issue_comment(repo, issue_number, &output::clarifying_questions(questions))
            .await?;
        let labels = vec![LABEL_NEEDS_CLARIFICATION.to_string()];
        execute_with_retry(&self.deps.vcs_retry, "add labels", || {
            self.deps.vcs.add_labels(repo, issue_number, &labels)
        })
        .await?;
        self.deps
            .audit(
                Some(conversation_id),
                &REQUIREMENTS_AGENT,
                "questions_asked",
                serde_json::json!({ "issue_number": issue_number, "questions": questions }),
            )
            .await;
        Ok(())
    }

    /// Post the refined requirements and swap the labels over.
    pub async fn mark_ready_for_development(
        &self,
        repo: &str,
        issue_number: u64,
        conversation_id: &str,
        fallback_description: &str,
        analysis: &Analysis,
    ) -> Result<()> {
        tracing::info!(repo, issue_number, "Marking issue ready for development");
        let description = analysis
            .refined_description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(fallback_description);
        self.deps
            .vcs
            .create_issue_comment(
                repo,
                issue_number,
                &output::requirements_refined(description, &analysis.acceptance_criteria),
            )
            .await?;
        execute_with_retry(&self.deps.vcs_retry, "remove label", || {
            self.deps
                .vcs
                .remove_label(repo, issue_number, LABEL_NEEDS_CLARIFICATION)
        })
        .await?;
        let labels = ready_labels(&analysis.suggested_labels);
        execute_with_retry(&self.deps.vcs_retry, "add labels", || {
            self.deps.vcs.add_labels(repo, issue_number, &labels)
        })
        .await?;
        self.deps
            .audit(
                Some(conversation_id),
                &REQUIREMENTS_AGENT,
                "marked_ready_for_dev",
                serde_json::json!({
                    "issue_number": issue_number,
                    "refined_description": description,
                    "acceptance_criteria_count": analysis.acceptance_criteria.len(),
                    "labels": labels,
                }),
            )
            .await;
        Ok(())
    }

    /// Give up on the clarification loop and hand the issue to a human.
    pub async fn request_manual_intervention(
        &self,
        repo: &str,
        issue_number: u64,
        turns: usize,
    ) -> Result<()> {
        tracing::warn!(repo, issue_number, turns, "Clarification limit reached");
        self.deps
            .vcs
            .create_issue_comment(repo, issue_number, &output::manual_intervention(turns))
            .await?;
        execute_with_retry(&self.deps.vcs_retry, "remove label", || {
            self.deps
                .vcs
                .remove_label(repo, issue_number, LABEL_NEEDS_CLARIFICATION)
        })
        .await?;
        let labels = vec![LABEL_NEEDS_MANUAL_INTERVENTION.to_string()];
        execute_with_retry(&self.deps.vcs_retry, "add labels", || {
            self.deps.vcs.add_labels(repo, issue_number, &labels)
        })
        .await?;
        Ok(())
    }
}

/// Suggested labels plus `ready-for-dev`, each once, in order, never
/// including `needs-clarification`.
pub fn ready_labels(suggested: &[String]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::with_capacity(suggested.len() + 1);
    for label in suggested
        .iter()
        .map(|l| l.trim())
        .chain(std::iter::once(LABEL_READY_FOR_DEV))
    {
        if label.is_empty() || label == LABEL_NEEDS_CLARIFICATION {
            continue;
        }
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
    }
    labels
}

/// Parse and validate reasoning output against the `Analysis` schema.
pub fn parse_analysis(raw: &str) -> Result<Analysis> {
    let mut analysis: Analysis = parse_json_block("Analysis", raw)?;
    analysis.questions.retain(|q| !q.trim().is_empty());

    if analysis.needs_clarification && analysis.is_complete {
        return Err(Error::parse(
            "Analysis",
            "needs_clarification and is_complete are both true",
            raw,
        ));
    }
    if analysis.needs_clarification && analysis.questions.is_empty() {
        return Err(Error::parse(
            "Analysis",
            "needs_clarification is true but no questions were given",
            raw,
        ));
    }
    if analysis.estimated_effort_hours.is_some_and(|h| h < 0.0 || !h.is_finite()) {
        return Err(Error::parse(
            "Analysis",
            "estimated_effort_hours must be a non-negative number",
            raw,
        ));
    }
    Ok(analysis)
}
