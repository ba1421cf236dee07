//! Dependency-aware slice scheduler.
//!
//! One build at a time per project, enforced by a compare-and-set claim on
//! the project's build slot. `trigger_next` is safe to call from anywhere
//! at any time: concurrent triggers race on the claim and the losers fall
//! out as no-ops, so a build can never be double-dispatched.
//!
//! Retry policy: a retryable failure moves the slice to self-healing,
//! bumps its counter, and dispatches a fresh conversation for the next
//! attempt. In-session recovery never reaches this path; it shows up as
//! `self_heal` events on a live stream and the agent handles it alone.
//! `on_failed` only fires once the session itself is gone, which is why
//! the retry here opens a new conversation instead of waiting on the old
//! one. Exhausting the budget (or a non-retryable failure) fails the
//! slice and the project.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::errors::{AgentError, PipelineError};
use crate::models::{ErrorContext, ProjectStatus, Slice, SliceStatus};
use crate::store::Datastore;
use crate::supervisor::BuildSupervisor;

/// Outcome of a failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Slice moved to self-healing; a fresh attempt was dispatched.
    SelfHeal { retry_count: u32 },
    /// Retry budget exhausted or failure non-retryable.
    TerminalFailure,
}

pub struct SliceScheduler {
    store: Arc<dyn Datastore>,
    supervisor: Arc<BuildSupervisor>,
    config: EngineConfig,
    done: Notify,
}

impl SliceScheduler {
    pub fn new(
        store: Arc<dyn Datastore>,
        supervisor: Arc<BuildSupervisor>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            supervisor,
            config,
            done: Notify::new(),
        })
    }

    /// Evaluate the project and dispatch the next buildable slice, if any.
    ///
    /// Terminal projects, projects with an active build, and lost claim
    /// races all return Ok without side effects.
    pub async fn trigger_next(self: &Arc<Self>, project_id: &str) -> Result<()> {
        let project = self.store.get_project(project_id).await?;
        if project.status.is_terminal() {
            return Ok(());
        }

        let slices = self.store.list_slices(project_id).await?;

        if slices.iter().all(|s| s.status == SliceStatus::Complete) {
            info!(project_id, "All slices complete");
            self.store
                .update_project_status(project_id, ProjectStatus::Complete)
                .await?;
            self.done.notify_waiters();
            return Ok(());
        }

        if slices.iter().any(|s| s.status.is_active()) {
            debug!(project_id, "Build already in flight");
            return Ok(());
        }

        if let Some(failed) = slices.iter().find(|s| s.status == SliceStatus::Failed) {
            warn!(project_id, slice_id = %failed.id, "Failed slice blocks the project");
            if project.error_context.is_none() {
                let ctx = ErrorContext::new(
                    "building",
                    format!("Slice '{}' failed terminally", failed.name),
                    false,
                );
                self.store
                    .update_error_context(project_id, Some(ctx))
                    .await?;
            }
            self.store
                .update_project_status(project_id, ProjectStatus::Failed)
                .await?;
            self.done.notify_waiters();
            return Ok(());
        }

        let complete: Vec<&str> = slices
            .iter()
            .filter(|s| s.status == SliceStatus::Complete)
            .map(|s| s.id.as_str())
            .collect();

        // list_slices is already ordered by priority, so first match wins
        let next = slices.iter().find(|s| {
            s.status.is_schedulable()
                && s.dependencies.iter().all(|d| complete.contains(&d.as_str()))
        });

        let Some(next) = next else {
            let remaining = slices
                .iter()
                .filter(|s| s.status != SliceStatus::Complete)
                .count();
            if remaining > 0 {
                // Plan validation rejects cycles, so this is dependency
                // starvation. Idle and wait rather than failing the run.
                warn!(
                    project_id,
                    "{}",
                    PipelineError::DependencyDeadlock { remaining }
                );
            }
            return Ok(());
        };

        if !self.store.try_claim_build_slot(project_id, &next.id).await? {
            debug!(project_id, slice_id = %next.id, "Lost build slot race");
            return Ok(());
        }

        self.store
            .update_slice_status(&next.id, SliceStatus::Selected)
            .await?;
        if project.status != ProjectStatus::Building {
            self.store
                .update_project_status(project_id, ProjectStatus::Building)
                .await?;
        }

        info!(project_id, slice_id = %next.id, name = %next.name, "Dispatching slice build");
        self.dispatch(next.clone());
        Ok(())
    }

    /// Spawn the build attempt. Failures are routed through `on_failed`;
    /// nothing escapes the task.
    fn dispatch(self: &Arc<Self>, slice: Slice) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_build(slice).await;
        });
    }

    async fn run_build(self: &Arc<Self>, slice: Slice) {
        match self.supervisor.run(&slice).await {
            Ok(report) => {
                debug!(slice_id = %slice.id, confidence = report.confidence, "Build succeeded");
                if let Err(e) = self.on_complete(&slice.project_id, &slice.id).await {
                    error!(slice_id = %slice.id, error = %e, "Failed to record build completion");
                }
            }
            Err(e) => {
                let retryable = e
                    .downcast_ref::<AgentError>()
                    .map(AgentError::is_retryable)
                    .unwrap_or(true);
                let ctx = ErrorContext::new("building", e.to_string(), retryable);
                if let Err(e2) = self.on_failed(&slice.project_id, &slice.id, ctx).await {
                    error!(slice_id = %slice.id, error = %e2, "Failed to record build failure");
                }
            }
        }
    }

    /// Mark the slice complete, free the slot, and schedule the next one.
    pub async fn on_complete(self: &Arc<Self>, project_id: &str, slice_id: &str) -> Result<()> {
        self.store
            .update_slice_status(slice_id, SliceStatus::Complete)
            .await?;
        self.store.release_build_slot(project_id, slice_id).await?;
        self.trigger_next(project_id).await
    }

    /// Record a failed attempt and decide between self-heal and terminal
    /// failure. Idempotent for already-failed slices.
    pub async fn on_failed(
        self: &Arc<Self>,
        project_id: &str,
        slice_id: &str,
        ctx: ErrorContext,
    ) -> Result<RetryDecision> {
        self.store.release_build_slot(project_id, slice_id).await?;

        let slice = self.store.get_slice(slice_id).await?;
        if slice.status == SliceStatus::Failed {
            return Ok(RetryDecision::TerminalFailure);
        }

        if ctx.retryable && slice.retry_count < self.config.max_retries {
            let retry_count = slice.retry_count + 1;
            info!(
                slice_id,
                retry_count,
                max = self.config.max_retries,
                "Slice entering self-heal"
            );
            self.store.update_slice_retry(slice_id, retry_count).await?;
            self.store
                .update_slice_status(slice_id, SliceStatus::SelfHealing)
                .await?;
            // the session is gone, so healing needs a fresh conversation
            if self.store.try_claim_build_slot(project_id, slice_id).await? {
                let mut retry_slice = slice;
                retry_slice.retry_count = retry_count;
                self.dispatch(retry_slice);
            }
            return Ok(RetryDecision::SelfHeal { retry_count });
        }

        warn!(slice_id, retries = slice.retry_count, "Slice failed terminally");
        self.store
            .update_slice_status(slice_id, SliceStatus::Failed)
            .await?;
        self.store
            .update_error_context(project_id, Some(ctx))
            .await?;
        self.trigger_next(project_id).await?;
        Ok(RetryDecision::TerminalFailure)
    }

    /// Block until the project reaches a terminal status and return it.
    pub async fn wait_for_terminal(&self, project_id: &str) -> Result<ProjectStatus> {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let project = self.store.get_project(project_id).await?;
            if project.status.is_terminal() {
                return Ok(project.status);
            }
            notified.await;
        }
    }

    /// Wake anyone blocked in `wait_for_terminal` to re-read the store.
    pub fn notify_waiters(&self) {
        self.done.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ConversationRegistry, Script, ScriptedAgent};
    use crate::models::Project;
    use crate::store::MemoryStore;
    use serde_json::Value;
    use std::time::Duration;

    fn harness(
        store: Arc<MemoryStore>,
        agent: Arc<ScriptedAgent>,
        config: EngineConfig,
    ) -> Arc<SliceScheduler> {
        let registry = ConversationRegistry::new(agent.clone());
        let supervisor = Arc::new(BuildSupervisor::new(
            agent,
            store.clone(),
            registry,
            config.clone(),
        ));
        SliceScheduler::new(store, supervisor, config)
    }

    fn fast_config() -> EngineConfig {
        EngineConfig::default().with_event_pacing(Duration::ZERO)
    }

    async fn seeded_project(store: &Arc<MemoryStore>) -> String {
        let mut project = Project::new("demo");
        project.status = ProjectStatus::Ready;
        let id = project.id.clone();
        store.upsert_project(project).await.unwrap();
        id
    }

    async fn add_slice(
        store: &Arc<MemoryStore>,
        project_id: &str,
        name: &str,
        priority: i32,
        deps: Vec<String>,
    ) -> String {
        let slice =
            Slice::new(project_id, name, priority, Value::Null).with_dependencies(deps);
        let id = slice.id.clone();
        store.upsert_slice(slice).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_empty_project_completes_immediately() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let scheduler = harness(store.clone(), ScriptedAgent::happy(1), fast_config());

        scheduler.trigger_next(&pid).await.unwrap();
        assert_eq!(
            store.get_project(&pid).await.unwrap().status,
            ProjectStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_selects_lowest_priority_with_satisfied_deps() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let a = add_slice(&store, &pid, "a", 1, vec![]).await;
        let b = add_slice(&store, &pid, "b", 2, vec![a.clone()]).await;
        // hanging agent so the claim is observable before any completion
        let scheduler = harness(
            store.clone(),
            ScriptedAgent::new(vec![Script::hanging()]),
            fast_config().with_monitor_timeout(Duration::from_secs(60)),
        );

        scheduler.trigger_next(&pid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let project = store.get_project(&pid).await.unwrap();
        assert_eq!(project.current_slice_id.as_deref(), Some(a.as_str()));
        assert_eq!(project.status, ProjectStatus::Building);
        assert_ne!(
            store.get_slice(&b).await.unwrap().status,
            SliceStatus::Building
        );
    }

    #[tokio::test]
    async fn test_double_trigger_single_dispatch() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        add_slice(&store, &pid, "a", 1, vec![]).await;
        let agent = ScriptedAgent::new(vec![Script::hanging()]);
        let scheduler = harness(
            store.clone(),
            agent.clone(),
            fast_config().with_monitor_timeout(Duration::from_secs(60)),
        );

        scheduler.trigger_next(&pid).await.unwrap();
        scheduler.trigger_next(&pid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.trigger_next(&pid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(agent.created_conversations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_noop_while_slot_held_by_selected_slice() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let sid = add_slice(&store, &pid, "a", 1, vec![]).await;
        // the window between winning the claim and the spawned build
        // moving the slice to building
        assert!(store.try_claim_build_slot(&pid, &sid).await.unwrap());
        store
            .update_slice_status(&sid, SliceStatus::Selected)
            .await
            .unwrap();

        let agent = ScriptedAgent::happy(1);
        let scheduler = harness(store.clone(), agent.clone(), fast_config());
        scheduler.trigger_next(&pid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(agent.created_conversations().await.is_empty());
        assert_eq!(
            store.get_project(&pid).await.unwrap().current_slice_id.as_deref(),
            Some(sid.as_str())
        );
    }

    #[tokio::test]
    async fn test_slice_with_incomplete_dep_not_dispatched() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let a = add_slice(&store, &pid, "a", 1, vec![]).await;
        let b = add_slice(&store, &pid, "b", 0, vec![a.clone()]).await;
        let agent = ScriptedAgent::new(vec![Script::hanging()]);
        let scheduler = harness(
            store.clone(),
            agent,
            fast_config().with_monitor_timeout(Duration::from_secs(60)),
        );

        // b has higher priority but depends on a, so a is chosen
        scheduler.trigger_next(&pid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let project = store.get_project(&pid).await.unwrap();
        assert_eq!(project.current_slice_id.as_deref(), Some(a.as_str()));
        assert_eq!(
            store.get_slice(&b).await.unwrap().status,
            SliceStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_full_run_to_completion() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let a = add_slice(&store, &pid, "a", 1, vec![]).await;
        let b = add_slice(&store, &pid, "b", 2, vec![a.clone()]).await;
        let scheduler = harness(store.clone(), ScriptedAgent::happy(2), fast_config());

        scheduler.trigger_next(&pid).await.unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.wait_for_terminal(&pid),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(status, ProjectStatus::Complete);
        assert_eq!(
            store.get_slice(&a).await.unwrap().status,
            SliceStatus::Complete
        );
        assert_eq!(
            store.get_slice(&b).await.unwrap().status,
            SliceStatus::Complete
        );
        assert!(store.get_project(&pid).await.unwrap().current_slice_id.is_none());
    }

    #[tokio::test]
    async fn test_retryable_failure_enters_self_heal_and_redispatches() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let sid = add_slice(&store, &pid, "a", 1, vec![]).await;
        // hanging agent parks the redispatched attempt so it is observable
        let agent = ScriptedAgent::new(vec![Script::hanging()]);
        let scheduler = harness(
            store.clone(),
            agent.clone(),
            fast_config().with_monitor_timeout(Duration::from_secs(60)),
        );

        let decision = scheduler
            .on_failed(&pid, &sid, ErrorContext::new("building", "blip", true))
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::SelfHeal { retry_count: 1 });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let slice = store.get_slice(&sid).await.unwrap();
        assert_eq!(slice.retry_count, 1);
        assert!(slice.status.is_active());
        // a fresh conversation was opened for the retry
        assert_eq!(agent.created_conversations().await.len(), 1);
        assert_ne!(
            store.get_project(&pid).await.unwrap().status,
            ProjectStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_retry_budget_boundary() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let sid = add_slice(&store, &pid, "a", 1, vec![]).await;
        store.update_slice_retry(&sid, 4).await.unwrap();
        let scheduler = harness(
            store.clone(),
            ScriptedAgent::new(vec![Script::hanging()]),
            fast_config().with_monitor_timeout(Duration::from_secs(60)),
        );

        // one attempt left in a budget of five
        let first = scheduler
            .on_failed(&pid, &sid, ErrorContext::new("building", "blip", true))
            .await
            .unwrap();
        assert_eq!(first, RetryDecision::SelfHeal { retry_count: 5 });

        let second = scheduler
            .on_failed(&pid, &sid, ErrorContext::new("building", "blip again", true))
            .await
            .unwrap();
        assert_eq!(second, RetryDecision::TerminalFailure);

        let slice = store.get_slice(&sid).await.unwrap();
        assert_eq!(slice.status, SliceStatus::Failed);
        assert_eq!(slice.retry_count, 5);

        let project = store.get_project(&pid).await.unwrap();
        assert_eq!(project.status, ProjectStatus::Failed);
        assert!(project.error_context.is_some());
    }

    #[tokio::test]
    async fn test_non_retryable_failure_skips_self_heal() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let sid = add_slice(&store, &pid, "a", 1, vec![]).await;
        let scheduler = harness(store.clone(), ScriptedAgent::happy(1), fast_config());

        let decision = scheduler
            .on_failed(
                &pid,
                &sid,
                ErrorContext::new("building", "bad endpoint", false),
            )
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::TerminalFailure);
        assert_eq!(
            store.get_slice(&sid).await.unwrap().status,
            SliceStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_on_failed_idempotent_for_failed_slice() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let sid = add_slice(&store, &pid, "a", 1, vec![]).await;
        store
            .update_slice_status(&sid, SliceStatus::Failed)
            .await
            .unwrap();
        let scheduler = harness(store.clone(), ScriptedAgent::happy(1), fast_config());

        let decision = scheduler
            .on_failed(&pid, &sid, ErrorContext::new("building", "again", true))
            .await
            .unwrap();
        assert_eq!(decision, RetryDecision::TerminalFailure);
        assert_eq!(store.get_slice(&sid).await.unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_trigger_on_terminal_project_is_noop() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        add_slice(&store, &pid, "a", 1, vec![]).await;
        store
            .update_project_status(&pid, ProjectStatus::Paused)
            .await
            .unwrap();
        let agent = ScriptedAgent::happy(1);
        let scheduler = harness(store.clone(), agent.clone(), fast_config());

        scheduler.trigger_next(&pid).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(agent.created_conversations().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_agent_fails_without_retry() {
        let store = MemoryStore::new();
        let pid = seeded_project(&store).await;
        let sid = add_slice(&store, &pid, "a", 1, vec![]).await;
        let agent = ScriptedAgent::new(vec![Script {
            events: vec![crate::agent::ScriptItem::FatalError("dns failure".into())],
            hold_open: false,
        }]);
        let scheduler = harness(store.clone(), agent, fast_config());

        scheduler.trigger_next(&pid).await.unwrap();
        let status = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.wait_for_terminal(&pid),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(status, ProjectStatus::Failed);
        let slice = store.get_slice(&sid).await.unwrap();
        assert_eq!(slice.status, SliceStatus::Failed);
        assert_eq!(slice.retry_count, 0);
        let ctx = store.get_project(&pid).await.unwrap().error_context.unwrap();
        assert!(!ctx.retryable);
    }
}
