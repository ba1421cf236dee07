//! Typed error hierarchy for the orchestration engine.
//!
//! Two top-level enums cover the two failure surfaces:
//! - `AgentError` — the external agent conversation service
//! - `PipelineError` — scheduling, planning, and checkpoint failures
//!
//! Retryability is a property of the error, not the call site: the
//! scheduler's dispatch path asks `is_retryable` when it writes the
//! operator-facing `ErrorContext`.

use thiserror::Error;

/// Errors from the agent conversation service and its event stream.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Transient service failure; the self-heal counter is the outer retry.
    #[error("Agent service error: {0}")]
    Service(String),

    /// Service unreachable or misconfigured. Fatal, never retried.
    #[error("Agent service unreachable: {0}")]
    Unreachable(String),

    #[error("Failed to create conversation: {0}")]
    SessionCreation(String),

    #[error("Event stream error: {0}")]
    Stream(String),
}

impl AgentError {
    /// Whether the failure is worth a self-heal attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unreachable(_))
    }
}

/// Errors from the scheduler, planner, and checkpoint subsystems.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Slice {id} not found")]
    SliceNotFound { id: String },

    #[error("Invalid slice plan: {reason}")]
    PlanValidation { reason: String },

    /// No buildable slice while some remain incomplete. The scheduler
    /// idles on this rather than failing the project.
    #[error("Dependency deadlock: {remaining} slices blocked by incomplete dependencies")]
    DependencyDeadlock { remaining: usize },

    #[error("Malformed checkpoint for project {project_id}")]
    MalformedCheckpoint { project_id: String },

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
