//! Data model: conversations, turns, analyses, code generations and the
//! audit trail.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label the requirements agent applies while waiting on answers.
pub const LABEL_NEEDS_CLARIFICATION: &str = "needs-clarification";
/// Label that marks an issue ready for code generation (and triggers it).
pub const LABEL_READY_FOR_DEV: &str = "ready-for-dev";
/// Label applied when the clarification loop gives up.
pub const LABEL_NEEDS_MANUAL_INTERVENTION: &str = "needs-manual-intervention";

/// Identifies a conversation: one per (repository, issue number).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssueKey {
    /// `owner/repo`
    pub repo: String,
    pub issue_number: u64,
}

impl IssueKey {
    pub fn new(repo: impl Into<String>, issue_number: u64) -> Self {
        Self {
            repo: repo.into(),
            issue_number,
        }
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repo, self.issue_number)
    }
}

/// Conversation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Analyzing,
    NeedsClarification,
    ReadyForDev,
    InDevelopment,
    NeedsManualIntervention,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Analyzing => "analyzing",
            ConversationStatus::NeedsClarification => "needs_clarification",
            ConversationStatus::ReadyForDev => "ready_for_dev",
            ConversationStatus::InDevelopment => "in_development",
            ConversationStatus::NeedsManualIntervention => "needs_manual_intervention",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyzing" => Ok(ConversationStatus::Analyzing),
            "needs_clarification" => Ok(ConversationStatus::NeedsClarification),
            "ready_for_dev" => Ok(ConversationStatus::ReadyForDev),
            "in_development" => Ok(ConversationStatus::InDevelopment),
            "needs_manual_intervention" => Ok(ConversationStatus::NeedsManualIntervention),
            other => Err(format!("unknown conversation status: {other}")),
        }
    }
}

/// One clarification round. The questions never change once recorded;
/// responses accumulate as comments arrive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Starts at 1, increases by one per round.
    pub number: u32,
    pub questions: Vec<String>,
    pub responses: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// Structured output of the requirements-refinement step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    #[serde(alias = "needsClarification")]
    pub needs_clarification: bool,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default, alias = "refinedDescription")]
    pub refined_description: Option<String>,
    #[serde(default, alias = "isComplete")]
    pub is_complete: bool,
    #[serde(default, alias = "acceptanceCriteria")]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, alias = "suggestedLabels")]
    pub suggested_labels: Vec<String>,
    #[serde(default, alias = "technicalConsiderations")]
    pub technical_considerations: Vec<String>,
    #[serde(default, alias = "estimatedComplexity")]
    pub estimated_complexity: Complexity,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "estimatedEffortHours")]
    pub estimated_effort_hours: Option<f64>,
}

/// What the orchestrator should do with an analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisOutcome {
    NeedsClarification,
    Complete,
    /// Neither complete nor asking anything: persist and wait.
    StillAnalyzing,
}

impl Analysis {
    pub fn outcome(&self) -> AnalysisOutcome {
        if self.needs_clarification {
            AnalysisOutcome::NeedsClarification
        } else if self.is_complete {
            AnalysisOutcome::Complete
        } else {
            AnalysisOutcome::StillAnalyzing
        }
    }
}

/// A conversation as loaded from the store.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub issue_id: i64,
    pub issue_number: u64,
    pub repo: String,
    pub title: String,
    pub body: String,
    pub status: ConversationStatus,
    pub analysis: Option<Analysis>,
    pub turns: Vec<Turn>,
    /// Bumped on every committed transition.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn key(&self) -> IssueKey {
        IssueKey::new(self.repo.clone(), self.issue_number)
    }

    pub fn latest_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }
}

/// Fields needed to create a conversation.
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub issue_id: i64,
    pub issue_number: u64,
    pub repo: String,
    pub title: String,
    pub body: String,
}

/// A state change committed atomically against an expected version.
#[derive(Debug, Clone)]
pub struct Transition {
    pub status: ConversationStatus,
    pub analysis: Option<Analysis>,
    /// Questions for a new turn appended in the same commit.
    pub new_turn: Option<Vec<String>>,
}

impl Transition {
    pub fn to(status: ConversationStatus) -> Self {
        Self {
            status,
            analysis: None,
            new_turn: None,
        }
    }

    pub fn with_analysis(mut self, analysis: Analysis) -> Self {
        self.analysis = Some(analysis);
        self
    }

    pub fn with_turn(mut self, questions: Vec<String>) -> Self {
        self.new_turn = Some(questions);
        self
    }
}

/// Write-once audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct AgentAction {
    pub id: i64,
    pub conversation_id: Option<String>,
    pub agent: String,
    pub action: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAgentAction {
    pub conversation_id: Option<String>,
    pub agent: String,
    pub action: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    #[default]
    Create,
    Modify,
    Delete,
}

/// An implementation file produced by the code agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    #[serde(alias = "path", alias = "filePath")]
    pub file_path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub operation: FileOperation,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// A test file produced by the code agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFile {
    #[serde(alias = "path", alias = "filePath")]
    pub file_path: String,
    pub content: String,
    #[serde(default, alias = "testFramework")]
    pub test_framework: String,
    #[serde(default, alias = "testCount")]
    pub test_count: u32,
    #[serde(default, alias = "coverageTargets")]
    pub coverage_targets: Vec<String>,
}

/// Structured output of the code-generation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeGeneration {
    #[serde(default, alias = "filesToCreate", alias = "implementation_files")]
    pub files_to_create: Vec<FileChange>,
    #[serde(default, alias = "testFiles")]
    pub test_files: Vec<TestFile>,
    #[serde(alias = "commitMessage")]
    pub commit_message: String,
    #[serde(alias = "prTitle")]
    pub pr_title: String,
    #[serde(default, alias = "prDescription")]
    pub pr_description: String,
    #[serde(alias = "branchName")]
    pub branch_name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "environmentVariables")]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default, alias = "migrationSteps")]
    pub migration_steps: Vec<String>,
    #[serde(default, alias = "breakingChanges")]
    pub breaking_changes: Vec<String>,
    #[serde(default, alias = "estimatedTestTimeSeconds")]
    pub estimated_test_time_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeGenerationStatus {
    Generated,
    PrCreated,
    Failed,
}

impl CodeGenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeGenerationStatus::Generated => "generated",
            CodeGenerationStatus::PrCreated => "pr_created",
            CodeGenerationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CodeGenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeGenerationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generated" => Ok(CodeGenerationStatus::Generated),
            "pr_created" => Ok(CodeGenerationStatus::PrCreated),
            "failed" => Ok(CodeGenerationStatus::Failed),
            other => Err(format!("unknown code generation status: {other}")),
        }
    }
}

/// One code-generation attempt for a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct CodeGenerationRecord {
    pub id: String,
    pub conversation_id: String,
    pub branch: String,
    pub pr_number: Option<u64>,
    pub files: Vec<FileChange>,
    pub tests: Vec<TestFile>,
    pub status: CodeGenerationStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of materializing a code generation into the repository.
#[derive(Debug, Clone, Serialize)]
pub struct CodeGenerationResult {
    pub record_id: String,
    pub branch: String,
    pub status: CodeGenerationStatus,
    pub pr_number: Option<u64>,
    pub pr_url: Option<String>,
    pub error_message: Option<String>,
    /// Paths committed before the attempt ended, successful or not.
    pub committed_paths: Vec<String>,
}
