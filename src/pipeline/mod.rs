//! Pipeline coordinator.
//!
//! Owns one project's run through the ordered steps: analysis (dual-phase,
//! parallel), planning (slice DAG materialization), building (scheduler
//! driven). Every completed step is checkpointed so an interrupted run
//! resumes at the first missing step instead of starting over.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::agent::{AgentService, ConversationRegistry};
use crate::analysis::{AnalysisPhase, PhaseOrchestrator};
use crate::checkpoint::CheckpointManager;
use crate::config::EngineConfig;
use crate::errors::PipelineError;
use crate::models::{
    ErrorContext, PipelineCheckpoint, Project, ProjectStatus, Slice,
};
use crate::scheduler::SliceScheduler;
use crate::store::Datastore;
use crate::supervisor::BuildSupervisor;

pub const STEP_ANALYSIS: &str = "analysis";
pub const STEP_PLANNING: &str = "planning";
pub const STEP_BUILDING: &str = "building";

pub const PHASE_REQUIREMENTS: &str = "requirements";
pub const PHASE_ARCHITECTURE: &str = "architecture";

/// One planned slice, before materialization. Dependencies refer to other
/// specs by name; ids are assigned when slices are created.
#[derive(Debug, Clone)]
pub struct SliceSpec {
    pub name: String,
    pub dependencies: Vec<String>,
    pub contract: Value,
}

impl SliceSpec {
    pub fn new(name: &str, dependencies: Vec<&str>, contract: Value) -> Self {
        Self {
            name: name.to_string(),
            dependencies: dependencies.into_iter().map(String::from).collect(),
            contract,
        }
    }
}

/// Structured-generation seam: analysis phases and slice planning.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn analyze_requirements(&self, project: &Project) -> Result<Value>;
    async fn analyze_architecture(&self, project: &Project) -> Result<Value>;
    async fn plan_slices(&self, project: &Project, analysis: &Value) -> Result<Vec<SliceSpec>>;
}

/// Planner returning canned results, for tests and rehearsals.
pub struct ScriptedPlanner {
    plan: Vec<SliceSpec>,
    fail_requirements: bool,
}

impl ScriptedPlanner {
    pub fn new(plan: Vec<SliceSpec>) -> Arc<Self> {
        Arc::new(Self {
            plan,
            fail_requirements: false,
        })
    }

    pub fn with_failing_requirements(plan: Vec<SliceSpec>) -> Arc<Self> {
        Arc::new(Self {
            plan,
            fail_requirements: true,
        })
    }

    /// A small three-slice plan with one dependency edge.
    pub fn demo_plan() -> Vec<SliceSpec> {
        vec![
            SliceSpec::new("data-model", vec![], json!({"goal": "schema and types"})),
            SliceSpec::new(
                "api",
                vec!["data-model"],
                json!({"goal": "request handlers"}),
            ),
            SliceSpec::new("ui-shell", vec!["api"], json!({"goal": "page layout"})),
        ]
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn analyze_requirements(&self, project: &Project) -> Result<Value> {
        if self.fail_requirements {
            return Err(anyhow!("requirements analysis refused"));
        }
        Ok(json!({"project": project.name, "features": self.plan.len()}))
    }

    async fn analyze_architecture(&self, project: &Project) -> Result<Value> {
        Ok(json!({"project": project.name, "style": "layered"}))
    }

    async fn plan_slices(&self, _project: &Project, _analysis: &Value) -> Result<Vec<SliceSpec>> {
        Ok(self.plan.clone())
    }
}

/// Reject plans the scheduler could never finish: duplicate names, edges
/// to unknown slices, and dependency cycles (Kahn's algorithm).
pub fn validate_plan(specs: &[SliceSpec]) -> Result<(), PipelineError> {
    let mut names = std::collections::HashSet::new();
    for spec in specs {
        if !names.insert(spec.name.as_str()) {
            return Err(PipelineError::PlanValidation {
                reason: format!("duplicate slice name '{}'", spec.name),
            });
        }
    }

    for spec in specs {
        for dep in &spec.dependencies {
            if !names.contains(dep.as_str()) {
                return Err(PipelineError::PlanValidation {
                    reason: format!(
                        "slice '{}' depends on unknown slice '{}'",
                        spec.name, dep
                    ),
                });
            }
            if dep == &spec.name {
                return Err(PipelineError::PlanValidation {
                    reason: format!("slice '{}' depends on itself", spec.name),
                });
            }
        }
    }

    // dedupe edges so a dependency listed twice still counts once
    let mut in_degree: std::collections::HashMap<&str, usize> = specs
        .iter()
        .map(|s| {
            let unique: std::collections::HashSet<&str> =
                s.dependencies.iter().map(String::as_str).collect();
            (s.name.as_str(), unique.len())
        })
        .collect();
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0;
    while let Some(name) = queue.pop() {
        visited += 1;
        for spec in specs {
            if spec.dependencies.iter().any(|d| d == name) {
                if let Some(degree) = in_degree.get_mut(spec.name.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(spec.name.as_str());
                    }
                }
            }
        }
    }
    if visited != specs.len() {
        return Err(PipelineError::PlanValidation {
            reason: "dependency cycle detected".to_string(),
        });
    }
    Ok(())
}

pub struct PipelineCoordinator {
    store: Arc<dyn Datastore>,
    planner: Arc<dyn Planner>,
    registry: Arc<ConversationRegistry>,
    scheduler: Arc<SliceScheduler>,
    checkpoints: CheckpointManager,
    analysis: PhaseOrchestrator,
}

impl PipelineCoordinator {
    pub fn new(
        store: Arc<dyn Datastore>,
        agent: Arc<dyn AgentService>,
        planner: Arc<dyn Planner>,
        config: EngineConfig,
    ) -> Self {
        let registry = ConversationRegistry::new(agent.clone());
        let supervisor = Arc::new(BuildSupervisor::new(
            agent,
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        let scheduler = SliceScheduler::new(store.clone(), supervisor, config);
        Self {
            checkpoints: CheckpointManager::new(store.clone()),
            analysis: PhaseOrchestrator::new(store.clone()),
            store,
            planner,
            registry,
            scheduler,
        }
    }

    /// Start a fresh run, discarding any prior progress. Slices from an
    /// earlier run are dropped too; a stale failed slice would otherwise
    /// re-fail the project before the new plan gets a chance.
    pub async fn start(&self, project_id: &str) -> Result<ProjectStatus> {
        self.checkpoints.clear(project_id).await?;
        self.store.delete_slices(project_id).await?;
        info!(project_id, "Starting pipeline run");
        self.run_from(project_id, PipelineCheckpoint::new()).await
    }

    /// Resume an interrupted run from its checkpoint.
    pub async fn resume(&self, project_id: &str) -> Result<ProjectStatus> {
        let project = self.store.get_project(project_id).await?;
        if !CheckpointManager::can_resume(&project) {
            return Err(anyhow!(
                "project {} is not resumable (status {}, no recorded progress)",
                project_id,
                project.status
            ));
        }
        let checkpoint = self
            .checkpoints
            .load(project_id)
            .await?
            .unwrap_or_default();
        self.checkpoints.clear_error_context(project_id).await?;
        // leave the terminal status behind so the scheduler will dispatch
        self.store
            .update_project_status(project_id, ProjectStatus::Processing)
            .await?;
        info!(
            project_id,
            resumed_from = ?checkpoint.current_step(),
            "Resuming pipeline run"
        );
        self.run_from(project_id, checkpoint).await
    }

    async fn run_from(
        &self,
        project_id: &str,
        mut checkpoint: PipelineCheckpoint,
    ) -> Result<ProjectStatus> {
        if !checkpoint.has_step(STEP_ANALYSIS) {
            if let Some(status) = self.run_analysis(project_id, &mut checkpoint).await? {
                return Ok(status);
            }
        }

        if !checkpoint.has_step(STEP_PLANNING) {
            if let Some(status) = self.run_planning(project_id, &mut checkpoint).await? {
                return Ok(status);
            }
        }

        if !checkpoint.has_step(STEP_BUILDING) {
            return self.run_building(project_id, &mut checkpoint).await;
        }

        Ok(self.store.get_project(project_id).await?.status)
    }

    /// Dual-phase analysis. Returns the terminal status on failure.
    async fn run_analysis(
        &self,
        project_id: &str,
        checkpoint: &mut PipelineCheckpoint,
    ) -> Result<Option<ProjectStatus>> {
        self.store
            .update_project_status(project_id, ProjectStatus::Processing)
            .await?;
        let project = self.store.get_project(project_id).await?;

        let requirements = {
            let planner = Arc::clone(&self.planner);
            let project = project.clone();
            AnalysisPhase::new(PHASE_REQUIREMENTS, async move {
                planner.analyze_requirements(&project).await
            })
        };
        let architecture = {
            let planner = Arc::clone(&self.planner);
            let project = project.clone();
            AnalysisPhase::new(PHASE_ARCHITECTURE, async move {
                planner.analyze_architecture(&project).await
            })
        };

        let report = self
            .analysis
            .run(project_id, Some(requirements), Some(architecture))
            .await?;

        if !report.all_succeeded() {
            let message = report.failures().join("; ");
            return Ok(Some(
                self.fail_project(project_id, STEP_ANALYSIS, &message, true)
                    .await?,
            ));
        }

        let merged = json!({
            PHASE_REQUIREMENTS: report
                .outcome(PHASE_REQUIREMENTS)
                .and_then(|o| o.data.clone()),
            PHASE_ARCHITECTURE: report
                .outcome(PHASE_ARCHITECTURE)
                .and_then(|o| o.data.clone()),
        });
        checkpoint.record_step(STEP_ANALYSIS, Some(merged));
        self.checkpoints.save(project_id, checkpoint).await?;
        Ok(None)
    }

    /// Plan and materialize the slice DAG. Returns the terminal status on
    /// a rejected plan.
    async fn run_planning(
        &self,
        project_id: &str,
        checkpoint: &mut PipelineCheckpoint,
    ) -> Result<Option<ProjectStatus>> {
        self.store
            .update_project_status(project_id, ProjectStatus::Processing)
            .await?;
        let project = self.store.get_project(project_id).await?;
        let analysis = checkpoint
            .results
            .get(STEP_ANALYSIS)
            .cloned()
            .unwrap_or(Value::Null);

        let specs = self.planner.plan_slices(&project, &analysis).await?;
        if let Err(e) = validate_plan(&specs) {
            error!(project_id, error = %e, "Slice plan rejected");
            return Ok(Some(
                self.fail_project(project_id, STEP_PLANNING, &e.to_string(), false)
                    .await?,
            ));
        }

        // two passes: assign ids first, then wire dependency edges by name
        let mut slices: Vec<Slice> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                Slice::new(project_id, &spec.name, i as i32, spec.contract.clone())
            })
            .collect();
        let ids: std::collections::HashMap<String, String> = slices
            .iter()
            .map(|s| (s.name.clone(), s.id.clone()))
            .collect();
        for (slice, spec) in slices.iter_mut().zip(&specs) {
            slice.dependencies = spec
                .dependencies
                .iter()
                .map(|name| ids[name].clone())
                .collect();
        }

        let slice_ids: Vec<&str> = slices.iter().map(|s| s.id.as_str()).collect();
        let planned = json!({"slice_ids": slice_ids});
        for slice in slices {
            self.store.upsert_slice(slice).await?;
        }
        self.store
            .update_project_status(project_id, ProjectStatus::Ready)
            .await?;

        info!(project_id, slices = specs.len(), "Slice plan materialized");
        checkpoint.record_step(STEP_PLANNING, Some(planned));
        self.checkpoints.save(project_id, checkpoint).await?;
        Ok(None)
    }

    /// Drive the scheduler until the project settles.
    async fn run_building(
        &self,
        project_id: &str,
        checkpoint: &mut PipelineCheckpoint,
    ) -> Result<ProjectStatus> {
        self.scheduler.trigger_next(project_id).await?;
        let status = self.scheduler.wait_for_terminal(project_id).await?;

        if status == ProjectStatus::Complete {
            checkpoint.record_step(STEP_BUILDING, None);
            self.checkpoints.save(project_id, checkpoint).await?;
        } else {
            warn!(project_id, %status, "Build step ended without completion");
        }
        Ok(status)
    }

    /// Pause the run: stop live conversations, mark the project, wake any
    /// terminal waiters so they observe the pause.
    pub async fn pause(&self, project_id: &str) -> Result<()> {
        info!(project_id, "Pausing pipeline run");
        self.registry.shutdown().await;
        self.store
            .update_project_status(project_id, ProjectStatus::Paused)
            .await?;
        self.scheduler.notify_waiters();
        Ok(())
    }

    /// Stop all live conversations. Called on process exit.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    async fn fail_project(
        &self,
        project_id: &str,
        step: &str,
        message: &str,
        retryable: bool,
    ) -> Result<ProjectStatus> {
        self.checkpoints
            .set_error_context(project_id, ErrorContext::new(step, message, retryable))
            .await?;
        self.store
            .update_project_status(project_id, ProjectStatus::Failed)
            .await?;
        Ok(ProjectStatus::Failed)
    }
}
