//! Core data model for the orchestration engine.
//!
//! Status enums carry exact snake_case wire strings; downstream consumers
//! match on them, so the string forms here are a compatibility contract.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle status of a single slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SliceStatus {
    #[default]
    Pending,
    Selected,
    Building,
    Testing,
    SelfHealing,
    Complete,
    Failed,
}

impl SliceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Selected => "selected",
            Self::Building => "building",
            Self::Testing => "testing",
            Self::SelfHealing => "self_healing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// An active slice has a live build attempt; at most one per project.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Building | Self::Testing | Self::SelfHealing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Eligible for the buildable set once dependencies are complete.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::Selected)
    }
}

impl std::fmt::Display for SliceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SliceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "selected" => Ok(Self::Selected),
            "building" => Ok(Self::Building),
            "testing" => Ok(Self::Testing),
            "self_healing" => Ok(Self::SelfHealing),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid slice status: {}", s)),
        }
    }
}

/// Lifecycle status of a project's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Pending,
    Processing,
    Ready,
    Building,
    Complete,
    Failed,
    Paused,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Building => "building",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    /// Paused counts as terminal for a run; resuming starts a new run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Paused)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "ready" => Ok(Self::Ready),
            "building" => Ok(Self::Building),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

/// Canonical vocabulary for normalized agent events.
///
/// The normalizer maps every raw agent signal into exactly one of these
/// kinds (or drops it). Wire strings must be preserved exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Thought,
    ToolCall,
    Observation,
    CodeWrite,
    TestRun,
    TestResult,
    SelfHeal,
    ConfidenceUpdate,
    BrowserAction,
    Screenshot,
    AppStart,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thought => "thought",
            Self::ToolCall => "tool_call",
            Self::Observation => "observation",
            Self::CodeWrite => "code_write",
            Self::TestRun => "test_run",
            Self::TestResult => "test_result",
            Self::SelfHeal => "self_heal",
            Self::ConfidenceUpdate => "confidence_update",
            Self::BrowserAction => "browser_action",
            Self::Screenshot => "screenshot",
            Self::AppStart => "app_start",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thought" => Ok(Self::Thought),
            "tool_call" => Ok(Self::ToolCall),
            "observation" => Ok(Self::Observation),
            "code_write" => Ok(Self::CodeWrite),
            "test_run" => Ok(Self::TestRun),
            "test_result" => Ok(Self::TestResult),
            "self_heal" => Ok(Self::SelfHeal),
            "confidence_update" => Ok(Self::ConfidenceUpdate),
            "browser_action" => Ok(Self::BrowserAction),
            "screenshot" => Ok(Self::Screenshot),
            "app_start" => Ok(Self::AppStart),
            _ => Err(format!("Invalid event kind: {}", s)),
        }
    }
}

/// Per-phase status column for the parallel analysis orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisPhaseStatus {
    Processing,
    Complete,
    Failed,
}

impl AnalysisPhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AnalysisPhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisPhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid analysis phase status: {}", s)),
        }
    }
}

/// An independently buildable unit of work within the dependency DAG.
///
/// Created at plan time. The scheduler mutates status and ordering, the
/// build supervisor mutates confidence and retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub status: SliceStatus,
    /// Ids of slices that must be complete before this one may build.
    pub dependencies: BTreeSet<String>,
    pub retry_count: u32,
    /// Accepted range [0, 1]; clamped after every delta.
    pub confidence_score: f64,
    /// Build order; lower runs first.
    pub priority: i32,
    /// Behavioral/code contract from the structured-generation service,
    /// consumed verbatim as build input.
    pub contract: Value,
}

impl Slice {
    pub fn new(project_id: &str, name: &str, priority: i32, contract: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            status: SliceStatus::Pending,
            dependencies: BTreeSet::new(),
            retry_count: 0,
            confidence_score: 0.0,
            priority,
            contract,
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = String>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }
}

/// A project owning one pipeline run and its slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    /// Build-slot claim: the one slice with a live build attempt, if any.
    pub current_slice_id: Option<String>,
    pub pipeline_step: Option<String>,
    /// Raw checkpoint blob; kept untyped so a malformed value can be
    /// detected on load and treated as absent.
    pub checkpoint: Option<Value>,
    pub error_context: Option<ErrorContext>,
    /// Per-analysis-phase status, keyed by phase name.
    #[serde(default)]
    pub phase_status: BTreeMap<String, AnalysisPhaseStatus>,
}

impl Project {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: ProjectStatus::Pending,
            current_slice_id: None,
            pipeline_step: None,
            checkpoint: None,
            error_context: None,
            phase_status: BTreeMap::new(),
        }
    }
}

/// Append-only record of a normalized agent event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: String,
    pub slice_id: String,
    pub kind: EventKind,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub confidence_delta: f64,
    pub timestamp: DateTime<Utc>,
}

/// Structured error record surfaced to operators and consumed by the
/// scheduler when a pipeline run fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub step: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

impl ErrorContext {
    pub fn new(step: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            step: step.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            retryable,
        }
    }
}

/// Durable record of pipeline progress enabling resume after failure
/// or pause. The derived "current step" is the tail of the list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    pub completed_steps: Vec<String>,
    /// Arbitrary per-step result blobs, keyed by step name.
    #[serde(default)]
    pub results: BTreeMap<String, Value>,
    pub last_updated: DateTime<Utc>,
}

impl PipelineCheckpoint {
    pub fn new() -> Self {
        Self {
            completed_steps: Vec::new(),
            results: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn current_step(&self) -> Option<&str> {
        self.completed_steps.last().map(String::as_str)
    }

    pub fn has_step(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Record a completed step. Re-recording an identical step is a no-op
    /// on the step list, so resumability is never corrupted by replays.
    pub fn record_step(&mut self, step: &str, result: Option<Value>) {
        if !self.has_step(step) {
            self.completed_steps.push(step.to_string());
        }
        if let Some(result) = result {
            self.results.insert(step.to_string(), result);
        }
        self.last_updated = Utc::now();
    }
}
