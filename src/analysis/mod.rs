//! Parallel analysis orchestrator.
//!
//! Runs up to two analysis phases concurrently on separate tasks, tracking
//! per-phase status on the project as each settles. Phases are isolated: a
//! failure or panic in one never interrupts the other, and the merged
//! report always reflects both outcomes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::AnalysisPhaseStatus;
use crate::store::Datastore;

/// A named unit of analysis work.
pub struct AnalysisPhase {
    pub name: String,
    pub task: BoxFuture<'static, Result<Value>>,
}

impl AnalysisPhase {
    pub fn new<F>(name: &str, task: F) -> Self
    where
        F: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            task: Box::pin(task),
        }
    }
}

/// How one phase ended.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub name: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Merged result of a dual-phase run.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub phase_a: Option<PhaseOutcome>,
    pub phase_b: Option<PhaseOutcome>,
}

impl AnalysisReport {
    pub fn all_succeeded(&self) -> bool {
        let ok = |o: &Option<PhaseOutcome>| o.as_ref().map(|p| p.success).unwrap_or(true);
        ok(&self.phase_a) && ok(&self.phase_b)
    }

    pub fn outcome(&self, name: &str) -> Option<&PhaseOutcome> {
        [self.phase_a.as_ref(), self.phase_b.as_ref()]
            .into_iter()
            .flatten()
            .find(|o| o.name == name)
    }

    /// Failure summaries of unsuccessful phases.
    pub fn failures(&self) -> Vec<String> {
        [self.phase_a.as_ref(), self.phase_b.as_ref()]
            .into_iter()
            .flatten()
            .filter(|o| !o.success)
            .map(|o| {
                format!(
                    "{}: {}",
                    o.name,
                    o.error.as_deref().unwrap_or("unknown failure")
                )
            })
            .collect()
    }
}

pub struct PhaseOrchestrator {
    store: Arc<dyn Datastore>,
}

impl PhaseOrchestrator {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    /// Run both phases concurrently and merge after both settle.
    pub async fn run(
        &self,
        project_id: &str,
        phase_a: Option<AnalysisPhase>,
        phase_b: Option<AnalysisPhase>,
    ) -> Result<AnalysisReport> {
        let a = self.launch(project_id, phase_a).await;
        let b = self.launch(project_id, phase_b).await;

        let (a, b) = tokio::join!(settle(a), settle(b));
        let report = AnalysisReport {
            phase_a: a,
            phase_b: b,
        };

        for outcome in [report.phase_a.as_ref(), report.phase_b.as_ref()]
            .into_iter()
            .flatten()
        {
            let status = if outcome.success {
                AnalysisPhaseStatus::Complete
            } else {
                AnalysisPhaseStatus::Failed
            };
            if let Err(e) = self
                .store
                .update_phase_status(project_id, &outcome.name, status)
                .await
            {
                warn!(project_id, phase = %outcome.name, error = %e, "Failed to record phase status");
            }
        }

        info!(
            project_id,
            success = report.all_succeeded(),
            "Analysis phases settled"
        );
        Ok(report)
    }

    async fn launch(
        &self,
        project_id: &str,
        phase: Option<AnalysisPhase>,
    ) -> Option<(String, JoinHandle<Result<Value>>)> {
        let phase = phase?;
        if let Err(e) = self
            .store
            .update_phase_status(project_id, &phase.name, AnalysisPhaseStatus::Processing)
            .await
        {
            warn!(project_id, phase = %phase.name, error = %e, "Failed to mark phase processing");
        }
        let name = phase.name;
        Some((name, tokio::spawn(phase.task)))
    }
}

async fn settle(
    launched: Option<(String, JoinHandle<Result<Value>>)>,
) -> Option<PhaseOutcome> {
    let (name, handle) = launched?;
    let started = Instant::now();
    let outcome = match handle.await {
        Ok(Ok(data)) => PhaseOutcome {
            name,
            success: true,
            data: Some(data),
            error: None,
            duration: started.elapsed(),
        },
        Ok(Err(e)) => PhaseOutcome {
            name,
            success: false,
            data: None,
            error: Some(e.to_string()),
            duration: started.elapsed(),
        },
        // a panicked phase is just a failed phase
        Err(join_err) => PhaseOutcome {
            name,
            success: false,
            data: None,
            error: Some(format!("phase task aborted: {}", join_err)),
            duration: started.elapsed(),
        },
    };
    Some(outcome)
}
