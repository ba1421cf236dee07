//! Durable pipeline checkpoints.
//!
//! Progress is written after every completed step so a crashed or paused
//! run can resume from where it left off. Loading is fail-safe: a missing
//! or malformed checkpoint reads as "no progress" rather than an error,
//! and the run restarts from the first step.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::models::{ErrorContext, PipelineCheckpoint, Project, ProjectStatus};
use crate::store::Datastore;

pub struct CheckpointManager {
    store: Arc<dyn Datastore>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn Datastore>) -> Self {
        Self { store }
    }

    /// Persist the checkpoint and mirror its current step onto the project.
    pub async fn save(&self, project_id: &str, checkpoint: &PipelineCheckpoint) -> Result<()> {
        let blob = serde_json::to_value(checkpoint)?;
        self.store
            .update_checkpoint(project_id, Some(blob))
            .await?;
        self.store
            .update_pipeline_step(project_id, checkpoint.current_step().map(String::from))
            .await?;
        debug!(
            project_id,
            steps = checkpoint.completed_steps.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Load the checkpoint, treating absence and corruption alike.
    pub async fn load(&self, project_id: &str) -> Result<Option<PipelineCheckpoint>> {
        let project = self.store.get_project(project_id).await?;
        let Some(blob) = project.checkpoint else {
            return Ok(None);
        };
        match serde_json::from_value::<PipelineCheckpoint>(blob) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(project_id, error = %e, "Malformed checkpoint, treating as absent");
                Ok(None)
            }
        }
    }

    /// Resume is offered only for interrupted runs with recorded progress.
    pub fn can_resume(project: &Project) -> bool {
        let has_progress = project
            .checkpoint
            .as_ref()
            .and_then(|blob| serde_json::from_value::<PipelineCheckpoint>(blob.clone()).ok())
            .map(|cp| !cp.completed_steps.is_empty())
            .unwrap_or(false);
        has_progress
            && matches!(project.status, ProjectStatus::Failed | ProjectStatus::Paused)
    }

    /// Drop checkpoint, step, and error context in one store call so a
    /// crash between fields cannot leave them disagreeing.
    pub async fn clear(&self, project_id: &str) -> Result<()> {
        self.store.clear_pipeline_state(project_id).await
    }

    pub async fn set_error_context(&self, project_id: &str, ctx: ErrorContext) -> Result<()> {
        self.store
            .update_error_context(project_id, Some(ctx))
            .await
    }

    pub async fn clear_error_context(&self, project_id: &str) -> Result<()> {
        self.store.update_error_context(project_id, None).await
    }
}
