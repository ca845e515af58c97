//! Plumbing shared by the requirements and code agents.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::domain::DomainContextProvider;
use crate::error::{Error, Result};
use crate::llm::{Prompt, Reasoner};
use crate::models::NewAgentAction;
use crate::output::AgentId;
use crate::retry::{RetryPolicy, execute_with_retry};
use crate::store::ConversationStore;
use crate::vcs::Vcs;

/// Collaborators injected into every agent.
#[derive(Clone)]
pub struct AgentDeps {
    pub reasoner: Arc<dyn Reasoner>,
    pub vcs: Arc<dyn Vcs>,
    pub store: Arc<dyn ConversationStore>,
    pub domain: Arc<dyn DomainContextProvider>,
    /// Policy for reasoning calls.
    pub reasoning_retry: RetryPolicy,
    /// Policy for idempotent VCS calls. Non-idempotent calls run once.
    pub vcs_retry: RetryPolicy,
}

impl AgentDeps {
    /// Invoke the reasoner under the retry policy and parse the answer.
    /// Parse failures are returned as-is and never retried.
    pub(crate) async fn reason<T, P>(
        &self,
        operation: &str,
        prompt: &Prompt,
        parse: P,
    ) -> Result<T>
    where
        P: FnOnce(&str) -> Result<T>,
    {
        let raw = execute_with_retry(&self.reasoning_retry, operation, || {
            self.reasoner.invoke(prompt)
        })
        .await?;
        tracing::debug!(
            operation,
            backend = self.reasoner.name(),
            response_len = raw.len(),
            "Reasoning response received"
        );
        parse(&raw)
    }

    /// Append an audit entry. Failures are logged, not propagated: the
    /// audit trail must never undo a side effect that already happened.
    pub async fn audit(
        &self,
        conversation_id: Option<&str>,
        agent: &AgentId,
        action: &str,
        payload: serde_json::Value,
    ) {
        let entry = NewAgentAction {
            conversation_id: conversation_id.map(str::to_string),
            agent: agent.role.to_string(),
            action: action.to_string(),
            payload,
        };
        if let Err(e) = self.store.log_agent_action(&entry).await {
            tracing::warn!(
                conversation_id,
                action,
                error = %e,
                "Failed to write audit entry"
            );
        }
    }
}

/// Pull the JSON object out of a model response that may wrap it in prose
/// or a fenced code block, then deserialize it.
pub(crate) fn parse_json_block<T: DeserializeOwned>(schema: &'static str, raw: &str) -> Result<T> {
    let trimmed = raw.trim();
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Err(Error::parse(schema, "no JSON object in response", raw)),
    };
    serde_json::from_str(candidate).map_err(|e| Error::parse(schema, e.to_string(), raw))
}
