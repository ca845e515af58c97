//! Markdown formatting for everything the agents post on issues and PRs.

use crate::models::{CodeGeneration, CodeGenerationResult};

/// An agent identity used in audit entries and comment signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentId {
    /// Stable identifier stored in the audit log, e.g. "requirements".
    pub role: &'static str,
    /// Name shown in the comment footer.
    pub display: &'static str,
}

pub const REQUIREMENTS_AGENT: AgentId = AgentId {
    role: "requirements",
    display: "Requirements Agent",
};

pub const CODE_AGENT: AgentId = AgentId {
    role: "code",
    display: "Code Agent",
};

pub const ORCHESTRATOR: AgentId = AgentId {
    role: "orchestrator",
    display: "Issue Orchestrator",
};

/// Append the agent signature footer.
pub fn sign(agent: &AgentId, body: &str) -> String {
    format!("{body}\n\n---\n*{} 🤖*", agent.display)
}

fn numbered(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {item}\n", i + 1))
        .collect()
}

fn bulleted(items: impl IntoIterator<Item = String>) -> String {
    items.into_iter().map(|item| format!("- {item}\n")).collect()
}

pub fn clarifying_questions(questions: &[String]) -> String {
    let mut body = String::from("## 🤔 Clarification Needed\n\n");
    body.push_str("To better understand this requirement, I have some questions:\n\n");
    body.push_str(&numbered(questions));
    body.push_str("\nPlease provide answers so I can refine the requirements for development.");
    sign(&REQUIREMENTS_AGENT, &body)
}

pub fn requirements_refined(refined_description: &str, acceptance_criteria: &[String]) -> String {
    let mut body = String::from("## ✅ Requirements Refined\n\n");
    body.push_str(&format!("**Refined Description:**\n{refined_description}\n\n"));
    if !acceptance_criteria.is_empty() {
        body.push_str("**Acceptance Criteria:**\n");
        body.push_str(&numbered(acceptance_criteria));
        body.push('\n');
    }
    body.push_str("This issue is now ready for development!");
    sign(&REQUIREMENTS_AGENT, &body)
}

pub fn manual_intervention(turns: usize) -> String {
    let body = format!(
        "## 🛑 Manual Intervention Needed\n\n\
         After {turns} rounds of clarification the requirements are still not clear enough \
         to proceed automatically. A maintainer needs to refine this issue by hand.\n\n\
         Once it is ready, add the `ready-for-dev` label to start development."
    );
    sign(&ORCHESTRATOR, &body)
}

/// PR body: the generated description followed by the issue reference.
pub fn pull_request_body(generation: &CodeGeneration, issue_number: u64) -> String {
    let mut body = generation.pr_description.trim_end().to_string();
    if !body.is_empty() {
        body.push_str("\n\n");
    }
    if !generation.breaking_changes.is_empty() {
        body.push_str("### Breaking changes\n");
        body.push_str(&bulleted(generation.breaking_changes.iter().cloned()));
        body.push('\n');
    }
    if !generation.migration_steps.is_empty() {
        body.push_str("### Migration steps\n");
        body.push_str(&numbered(&generation.migration_steps));
        body.push('\n');
    }
    body.push_str(&format!("Closes #{issue_number}"));
    body
}

pub fn pull_request_created(generation: &CodeGeneration, result: &CodeGenerationResult) -> String {
    let mut body = String::from("## 🚀 Pull Request Created\n\n");
    body.push_str("I've implemented this feature and created a pull request:\n\n");
    if let Some(url) = &result.pr_url {
        body.push_str(&format!("**PR:** {url}\n"));
    }
    body.push_str(&format!("**Branch:** `{}`\n\n", result.branch));
    body.push_str("**Changes:**\n");
    body.push_str(&format!(
        "- {} implementation files\n- {} test files\n\n",
        generation.files_to_create.len(),
        generation.test_files.len()
    ));
    if !generation.dependencies.is_empty() {
        body.push_str("**New dependencies:**\n");
        body.push_str(&bulleted(generation.dependencies.iter().cloned()));
        body.push('\n');
    }
    if !generation.environment_variables.is_empty() {
        body.push_str("**New environment variables:**\n");
        body.push_str(&bulleted(
            generation
                .environment_variables
                .iter()
                .map(|(name, purpose)| format!("`{name}`: {purpose}")),
        ));
        body.push('\n');
    }
    if !generation.migration_steps.is_empty() {
        body.push_str("**Migration steps:**\n");
        body.push_str(&numbered(&generation.migration_steps));
        body.push('\n');
    }
    if !generation.breaking_changes.is_empty() {
        body.push_str("**⚠️ Breaking changes:**\n");
        body.push_str(&bulleted(generation.breaking_changes.iter().cloned()));
        body.push('\n');
    }
    body.push_str(
        "The CI/CD pipeline will run automated tests. \
         Once tests pass, the PR will be ready for review.",
    );
    sign(&CODE_AGENT, &body)
}

pub fn code_generation_failed(result: &CodeGenerationResult) -> String {
    let mut body = String::from("## ❌ Code Generation Failed\n\n");
    body.push_str(&format!(
        "I could not finish opening a pull request for this issue.\n\n**Error:** {}\n\n",
        result.error_message.as_deref().unwrap_or("unknown error")
    ));
    if result.committed_paths.is_empty() {
        body.push_str("Nothing was committed.\n\n");
    } else {
        body.push_str(&format!(
            "These files were already committed to branch `{}` and were left in place:\n",
            result.branch
        ));
        body.push_str(&bulleted(
            result.committed_paths.iter().map(|p| format!("`{p}`")),
        ));
        body.push_str("\nPlease clean up the branch before retrying.\n\n");
    }
    body.push_str("Re-apply the `ready-for-dev` label to try again.");
    sign(&CODE_AGENT, &body)
}
