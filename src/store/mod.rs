//! Persistence seam for projects, slices, and the event log.
//!
//! `Datastore` is deliberately narrow: callers update one field at a time
//! through named methods instead of writing whole rows, which keeps the
//! concurrent paths (scheduler, supervisor, analysis) from clobbering each
//! other's columns. `MemoryStore` is the in-process implementation; a
//! database-backed one would slot in behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::PipelineError;
use crate::models::{
    AgentEvent, AnalysisPhaseStatus, ErrorContext, Project, ProjectStatus, Slice, SliceStatus,
};

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn upsert_project(&self, project: Project) -> Result<()>;
    async fn get_project(&self, id: &str) -> Result<Project>;
    async fn delete_project(&self, id: &str) -> Result<()>;

    async fn update_project_status(&self, id: &str, status: ProjectStatus) -> Result<()>;
    async fn update_pipeline_step(&self, id: &str, step: Option<String>) -> Result<()>;
    async fn update_checkpoint(&self, id: &str, checkpoint: Option<Value>) -> Result<()>;
    async fn update_error_context(&self, id: &str, ctx: Option<ErrorContext>) -> Result<()>;
    async fn update_phase_status(
        &self,
        id: &str,
        phase: &str,
        status: AnalysisPhaseStatus,
    ) -> Result<()>;

    /// Clear checkpoint, pipeline step, and error context in one write.
    async fn clear_pipeline_state(&self, id: &str) -> Result<()>;

    /// Compare-and-set the project's build slot. Returns true if the slot
    /// was empty and is now claimed for `slice_id`; false whenever it is
    /// held, including by `slice_id` itself. Re-dispatch paths must
    /// release before re-claiming.
    async fn try_claim_build_slot(&self, project_id: &str, slice_id: &str) -> Result<bool>;

    /// Release the build slot if held by `slice_id`; no-op otherwise.
    async fn release_build_slot(&self, project_id: &str, slice_id: &str) -> Result<()>;

    /// Remove every slice for the project along with its events, and
    /// release the build slot. Used when a project is re-planned from
    /// scratch.
    async fn delete_slices(&self, project_id: &str) -> Result<()>;

    async fn upsert_slice(&self, slice: Slice) -> Result<()>;
    async fn get_slice(&self, id: &str) -> Result<Slice>;
    /// All slices for a project, ordered by priority then name.
    async fn list_slices(&self, project_id: &str) -> Result<Vec<Slice>>;

    async fn update_slice_status(&self, id: &str, status: SliceStatus) -> Result<()>;
    async fn update_slice_retry(&self, id: &str, retry_count: u32) -> Result<()>;
    /// Persist a confidence score, clamped to [0, 1].
    async fn update_slice_confidence(&self, id: &str, confidence: f64) -> Result<()>;

    async fn append_event(&self, event: AgentEvent) -> Result<()>;
    async fn list_events(&self, slice_id: &str) -> Result<Vec<AgentEvent>>;
}

#[derive(Default)]
struct Inner {
    projects: HashMap<String, Project>,
    slices: HashMap<String, Slice>,
    events: Vec<AgentEvent>,
}

/// In-memory store behind a single RwLock. Write methods take the lock
/// once, so each trait call is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Inner {
    fn project_mut(&mut self, id: &str) -> Result<&mut Project> {
        self.projects
            .get_mut(id)
            .ok_or_else(|| PipelineError::ProjectNotFound { id: id.to_string() }.into())
    }

    fn slice_mut(&mut self, id: &str) -> Result<&mut Slice> {
        self.slices
            .get_mut(id)
            .ok_or_else(|| PipelineError::SliceNotFound { id: id.to_string() }.into())
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn upsert_project(&self, project: Project) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.projects.insert(project.id.clone(), project);
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Project> {
        let inner = self.inner.read().await;
        inner
            .projects
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::ProjectNotFound { id: id.to_string() }.into())
    }

    async fn delete_project(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.projects.remove(id);
        let removed: Vec<String> = inner
            .slices
            .values()
            .filter(|s| s.project_id == id)
            .map(|s| s.id.clone())
            .collect();
        for slice_id in &removed {
            inner.slices.remove(slice_id);
        }
        inner.events.retain(|e| !removed.contains(&e.slice_id));
        Ok(())
    }

    async fn update_project_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.project_mut(id)?.status = status;
        Ok(())
    }

    async fn update_pipeline_step(&self, id: &str, step: Option<String>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.project_mut(id)?.pipeline_step = step;
        Ok(())
    }

    async fn update_checkpoint(&self, id: &str, checkpoint: Option<Value>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.project_mut(id)?.checkpoint = checkpoint;
        Ok(())
    }

    async fn update_error_context(&self, id: &str, ctx: Option<ErrorContext>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.project_mut(id)?.error_context = ctx;
        Ok(())
    }

    async fn update_phase_status(
        &self,
        id: &str,
        phase: &str,
        status: AnalysisPhaseStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner
            .project_mut(id)?
            .phase_status
            .insert(phase.to_string(), status);
        Ok(())
    }

    async fn clear_pipeline_state(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let project = inner.project_mut(id)?;
        project.checkpoint = None;
        project.pipeline_step = None;
        project.error_context = None;
        Ok(())
    }

    async fn try_claim_build_slot(&self, project_id: &str, slice_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let project = inner.project_mut(project_id)?;
        if project.current_slice_id.is_some() {
            return Ok(false);
        }
        project.current_slice_id = Some(slice_id.to_string());
        Ok(true)
    }

    async fn release_build_slot(&self, project_id: &str, slice_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let project = inner.project_mut(project_id)?;
        if project.current_slice_id.as_deref() == Some(slice_id) {
            project.current_slice_id = None;
        }
        Ok(())
    }

    async fn delete_slices(&self, project_id: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let removed: Vec<String> = inner
            .slices
            .values()
            .filter(|s| s.project_id == project_id)
            .map(|s| s.id.clone())
            .collect();
        for slice_id in &removed {
            inner.slices.remove(slice_id);
        }
        inner.events.retain(|e| !removed.contains(&e.slice_id));
        if let Ok(project) = inner.project_mut(project_id) {
            project.current_slice_id = None;
        }
        Ok(())
    }

    async fn upsert_slice(&self, slice: Slice) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.slices.insert(slice.id.clone(), slice);
        Ok(())
    }

    async fn get_slice(&self, id: &str) -> Result<Slice> {
        let inner = self.inner.read().await;
        inner
            .slices
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::SliceNotFound { id: id.to_string() }.into())
    }

    async fn list_slices(&self, project_id: &str) -> Result<Vec<Slice>> {
        let inner = self.inner.read().await;
        let mut slices: Vec<Slice> = inner
            .slices
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect();
        slices.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(slices)
    }

    async fn update_slice_status(&self, id: &str, status: SliceStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.slice_mut(id)?.status = status;
        Ok(())
    }

    async fn update_slice_retry(&self, id: &str, retry_count: u32) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.slice_mut(id)?.retry_count = retry_count;
        Ok(())
    }

    async fn update_slice_confidence(&self, id: &str, confidence: f64) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.slice_mut(id)?.confidence_score = confidence.clamp(0.0, 1.0);
        Ok(())
    }

    async fn append_event(&self, event: AgentEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.events.push(event);
        Ok(())
    }

    async fn list_events(&self, slice_id: &str) -> Result<Vec<AgentEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.slice_id == slice_id)
            .cloned()
            .collect())
    }
}
