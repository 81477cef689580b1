use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::Context;

// ── Workflow ─────────────────────────────────────────────────────────

/// Workflow status: the ordered stages plus the backlog/completed bookends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Backlog,
    Scoping,
    Researching,
    Planning,
    InProgress,
    Review,
    Completed,
}

/// Fixed stage ordering. The engine does not validate transitions against
/// this order (callers choose the next stage); consumers use it to render
/// progress and to treat `skipped_stages` as already-satisfied gates.
pub const STAGE_ORDER: [WorkflowStatus; 7] = [
    WorkflowStatus::Backlog,
    WorkflowStatus::Scoping,
    WorkflowStatus::Researching,
    WorkflowStatus::Planning,
    WorkflowStatus::InProgress,
    WorkflowStatus::Review,
    WorkflowStatus::Completed,
];

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Scoping => "scoping",
            Self::Researching => "researching",
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "scoping" => Ok(Self::Scoping),
            "researching" => Ok(Self::Researching),
            "planning" => Ok(Self::Planning),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid workflow status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Type of reviewable artifact a stage produces. While a workflow is
/// `awaiting_approval`, `pending_artifact_type` names which artifact is
/// waiting on the human.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Scope,
    Research,
    Plan,
    Review,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scope => "scope",
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Review => "review",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scope" => Ok(Self::Scope),
            "research" => Ok(Self::Research),
            "plan" => Ok(Self::Plan),
            "review" => Ok(Self::Review),
            _ => Err(format!("Invalid artifact type: {}", s)),
        }
    }
}

/// A single tracked coding task progressing through ordered stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: WorkflowStatus,
    pub priority: Priority,
    /// Weak reference to the active session; replaced on stage transition.
    pub current_session_id: Option<String>,
    pub awaiting_approval: bool,
    pub pending_artifact_type: Option<ArtifactType>,
    pub base_branch: Option<String>,
    /// Stages elided for a quick-path workflow, in stage order.
    pub skipped_stages: Vec<WorkflowStatus>,
    pub archived: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ── Pulse ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PulseStatus {
    Proposed,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl PulseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Terminal states absorb: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for PulseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PulseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid pulse status: {}", s)),
        }
    }
}

/// One isolated, checkpointed unit of agent-driven code execution.
/// Runs in its own worktree/branch; progress is captured by commit SHA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    pub id: String,
    pub workflow_id: String,
    /// Back-reference to the plan-time pulse definition, when materialized
    /// from an approved plan.
    pub planned_pulse_id: Option<String>,
    pub description: String,
    pub status: PulseStatus,
    pub pulse_branch: Option<String>,
    pub worktree_path: Option<String>,
    /// Set only after start: the commit capturing this pulse's progress.
    /// On failure/stop with a recovery SHA, marks resumable partial work.
    pub checkpoint_commit_sha: Option<String>,
    pub has_unresolved_issues: bool,
    pub is_recovery_checkpoint: bool,
    pub rejection_count: i64,
    pub failure_reason: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub created_at: String,
}

/// Plan-time pulse definition — the items of an approved Plan artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedPulse {
    pub id: String,
    pub description: String,
}

// ── Preflight ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PreflightStatus {
    Running,
    Completed,
    Failed,
}

impl PreflightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PreflightStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PreflightStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid preflight status: {}", s)),
        }
    }
}

/// Pre-execution environment discovery for a workflow. Exactly one row per
/// workflow; creation is upsert-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightSetup {
    pub id: String,
    pub workflow_id: String,
    pub status: PreflightStatus,
    pub progress_message: Option<String>,
    /// Verification commands discovered during setup (lint/build/test).
    pub verification_commands: Vec<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A pre-existing issue snapshotted before execution starts. Later issues
/// matching a baseline are "known", not newly introduced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightBaseline {
    pub id: String,
    pub workflow_id: String,
    pub issue_type: String,
    /// Where the issue came from: "lint", "build", "test", …
    pub source: String,
    /// Substring matched against candidate issue messages.
    pub pattern: String,
    pub file_path: Option<String>,
    pub created_at: String,
}

/// Snapshot of a verification command's pre-existing output, so later runs
/// of the same command can be diffed against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightCommandBaseline {
    pub id: String,
    pub workflow_id: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub created_at: String,
}

// ── Session & turns ──────────────────────────────────────────────────

/// Roles a session's agent can assume. Coordinator sessions delegate work
/// to subagent sessions via subtasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Scoper,
    Researcher,
    Planner,
    Executor,
    Reviewer,
    Coordinator,
    Subagent,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scoper => "scoper",
            Self::Researcher => "researcher",
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Reviewer => "reviewer",
            Self::Coordinator => "coordinator",
            Self::Subagent => "subagent",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scoper" => Ok(Self::Scoper),
            "researcher" => Ok(Self::Researcher),
            "planner" => Ok(Self::Planner),
            "executor" => Ok(Self::Executor),
            "reviewer" => Ok(Self::Reviewer),
            "coordinator" => Ok(Self::Coordinator),
            "subagent" => Ok(Self::Subagent),
            _ => Err(format!("Invalid agent role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }
}

/// A scoped conversational context containing ordered turns. Sessions form
/// a one-level coordinator → subagent tree via `parent_session_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub context: Context,
    pub agent_role: AgentRole,
    pub status: SessionStatus,
    pub parent_session_id: Option<String>,
    /// Links an execution session to the pulse it drives.
    pub pulse_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Streaming,
    Completed,
    Error,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for TurnStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streaming" => Ok(Self::Streaming),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid turn status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for TurnRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Invalid turn role: {}", s)),
        }
    }
}

/// One agent or user turn within a session, ordered by `turn_index`.
/// Token/cost metadata is attached on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub session_id: String,
    pub turn_index: i64,
    pub role: TurnRole,
    pub status: TurnStatus,
    pub token_count: Option<i64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub model_id: Option<String>,
    pub created_at: String,
}

/// Token metadata recorded when a streaming turn completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnUsage {
    pub token_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub id: String,
    pub turn_id: String,
    pub message_index: i64,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl FromStr for ToolStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid tool status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnTool {
    pub id: String,
    pub turn_id: String,
    pub tool_index: i64,
    pub tool_name: String,
    pub input: Option<serde_json::Value>,
    pub output: Option<String>,
    pub status: ToolStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnThought {
    pub id: String,
    pub turn_id: String,
    pub thought_index: i64,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Pending,
    Answered,
    Skipped,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Answered => "answered",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for QuestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "answered" => Ok(Self::Answered),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid question status: {}", s)),
        }
    }
}

/// An inline question the agent asked the user during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub turn_id: String,
    pub question_index: i64,
    pub text: String,
    pub status: QuestionStatus,
    pub answer: Option<String>,
    pub created_at: String,
}

/// A turn with all of its child collections materialized, each in ascending
/// index order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnHistory {
    pub turn: Turn,
    pub messages: Vec<TurnMessage>,
    pub tools: Vec<TurnTool>,
    pub thoughts: Vec<TurnThought>,
    pub questions: Vec<Question>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNote {
    pub id: String,
    pub session_id: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTodo {
    pub id: String,
    pub session_id: String,
    pub todo_index: i64,
    pub content: String,
    pub done: bool,
}

// ── Subtasks ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubtaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid subtask status: {}", s)),
        }
    }
}

/// Delegated work issued by a coordinator session to a subagent session.
/// Subtask sessions do not themselves spawn subtasks (one level only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub parent_session_id: String,
    pub workflow_id: String,
    pub task_definition: String,
    pub findings: Option<String>,
    pub status: SubtaskStatus,
    pub created_at: String,
    pub updated_at: String,
}

// ── Artifacts & review ───────────────────────────────────────────────

/// A stage artifact (scope/research/plan) with schema-validated JSON content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageArtifact {
    pub id: String,
    pub workflow_id: String,
    pub artifact_type: ArtifactType,
    pub content: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    RequestChanges,
    Reject,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::RequestChanges => "request_changes",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for Recommendation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "request_changes" => Ok(Self::RequestChanges),
            "reject" => Ok(Self::Reject),
            _ => Err(format!("Invalid recommendation: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    Line,
    File,
    Review,
}

impl CommentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::File => "file",
            Self::Review => "review",
        }
    }
}

impl FromStr for CommentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "line" => Ok(Self::Line),
            "file" => Ok(Self::File),
            "review" => Ok(Self::Review),
            _ => Err(format!("Invalid comment kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// One review round. Recommendation and summary stay null until the round
/// is completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCard {
    pub id: String,
    pub workflow_id: String,
    pub round_number: i64,
    pub recommendation: Option<Recommendation>,
    pub summary: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

/// A finding attached to a review card. Severity and category are nullable:
/// user-authored comments may omit them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub id: String,
    pub card_id: String,
    pub kind: CommentKind,
    pub file_path: Option<String>,
    pub line: Option<i64>,
    pub content: String,
    pub severity: Option<Severity>,
    pub category: Option<String>,
    pub resolved: bool,
    pub created_at: String,
}

/// Fields for a new review comment; the store assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReviewComment {
    pub kind: CommentKind,
    pub file_path: Option<String>,
    pub line: Option<i64>,
    pub content: String,
    pub severity: Option<Severity>,
    pub category: Option<String>,
}

// ── Cost ledger ──────────────────────────────────────────────────────

/// One append-only ledger entry for token usage attributable to a turn.
/// Never updated after insert, except by the explicit repair pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: String,
    pub context: Context,
    pub turn_id: String,
    pub session_id: String,
    pub model_id: String,
    pub agent_role: AgentRole,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
    pub created_at: String,
}

/// Fields for a new cost record; the store assigns id and timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCostRecord {
    pub context: Context,
    pub turn_id: String,
    pub session_id: String,
    pub model_id: String,
    pub agent_role: AgentRole,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost_usd: f64,
}

/// Corrected per-model pricing used by the cost repair pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRate {
    pub model_id: String,
    pub prompt_cost_per_million: f64,
    pub completion_cost_per_million: f64,
}

impl ModelRate {
    /// Recompute a record's cost from stored token counts.
    pub fn cost_for(&self, prompt_tokens: i64, completion_tokens: i64) -> f64 {
        (prompt_tokens as f64 * self.prompt_cost_per_million
            + completion_tokens as f64 * self.completion_cost_per_million)
            / 1_000_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_status_roundtrip() {
        for s in &[
            "backlog",
            "scoping",
            "researching",
            "planning",
            "in_progress",
            "review",
            "completed",
        ] {
            let parsed: WorkflowStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_stage_order_matches_status_roundtrip() {
        assert_eq!(STAGE_ORDER.len(), 7);
        assert_eq!(STAGE_ORDER[0], WorkflowStatus::Backlog);
        assert_eq!(STAGE_ORDER[6], WorkflowStatus::Completed);
    }

    #[test]
    fn test_pulse_status_roundtrip() {
        for s in &["proposed", "running", "succeeded", "failed", "stopped"] {
            let parsed: PulseStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<PulseStatus>().is_err());
    }

    #[test]
    fn test_pulse_status_terminality() {
        assert!(!PulseStatus::Proposed.is_terminal());
        assert!(!PulseStatus::Running.is_terminal());
        assert!(PulseStatus::Succeeded.is_terminal());
        assert!(PulseStatus::Failed.is_terminal());
        assert!(PulseStatus::Stopped.is_terminal());
    }

    #[test]
    fn test_agent_role_roundtrip() {
        for s in &[
            "scoper",
            "researcher",
            "planner",
            "executor",
            "reviewer",
            "coordinator",
            "subagent",
        ] {
            let parsed: AgentRole = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_turn_and_tool_status_roundtrip() {
        for s in &["streaming", "completed", "error"] {
            let parsed: TurnStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        for s in &["running", "completed", "error"] {
            let parsed: ToolStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
    }

    #[test]
    fn test_question_status_roundtrip() {
        for s in &["pending", "answered", "skipped"] {
            let parsed: QuestionStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<QuestionStatus>().is_err());
    }

    #[test]
    fn test_subtask_status_roundtrip() {
        for s in &["pending", "running", "completed", "failed"] {
            let parsed: SubtaskStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<SubtaskStatus>().is_err());
    }

    #[test]
    fn test_review_enums_roundtrip() {
        for s in &["approve", "request_changes", "reject"] {
            let parsed: Recommendation = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        for s in &["line", "file", "review"] {
            let parsed: CommentKind = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        for s in &["low", "medium", "high"] {
            let parsed: Severity = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&WorkflowStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&Recommendation::RequestChanges).unwrap(),
            "\"request_changes\""
        );
        assert_eq!(
            serde_json::to_string(&PulseStatus::Proposed).unwrap(),
            "\"proposed\""
        );
        assert_eq!(
            serde_json::from_str::<ArtifactType>("\"plan\"").unwrap(),
            ArtifactType::Plan
        );
    }

    #[test]
    fn test_model_rate_cost_for() {
        let rate = ModelRate {
            model_id: "gpt-test".into(),
            prompt_cost_per_million: 3.0,
            completion_cost_per_million: 15.0,
        };
        // 1M prompt + 1M completion = 3 + 15 dollars
        let cost = rate.cost_for(1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
        assert_eq!(rate.cost_for(0, 0), 0.0);
    }
}
