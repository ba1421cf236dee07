//! Integration tests for the weave orchestration engine.
//!
//! These exercise the full pipeline against the in-memory store with
//! scripted agents and planners, plus a few CLI-level checks.

use std::sync::Arc;
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};

use weave::agent::{Script, ScriptItem, ScriptedAgent};
use weave::checkpoint::CheckpointManager;
use weave::config::{EngineConfig, ExecutionMode};
use weave::models::{
    ErrorContext, EventKind, PipelineCheckpoint, Project, ProjectStatus, Slice, SliceStatus,
};
use weave::pipeline::{
    PipelineCoordinator, ScriptedPlanner, SliceSpec, STEP_ANALYSIS, STEP_PLANNING,
};
use weave::store::{Datastore, MemoryStore};

fn weave_cmd() -> Command {
    cargo_bin_cmd!("weave")
}

fn fast_config() -> EngineConfig {
    EngineConfig::default().with_event_pacing(Duration::ZERO)
}

async fn seed_project(store: &Arc<MemoryStore>, name: &str) -> String {
    let project = Project::new(name);
    let id = project.id.clone();
    store.upsert_project(project).await.unwrap();
    id
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        weave_cmd().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        weave_cmd().arg("--version").assert().success();
    }

    #[test]
    fn test_rehearse_runs_to_completion() {
        weave_cmd()
            .arg("rehearse")
            .arg("--name")
            .arg("demo")
            .assert()
            .success()
            .stdout(predicate::str::contains("finished: complete"))
            .stdout(predicate::str::contains("data-model"));
    }
}

// =============================================================================
// Scheduling
// =============================================================================

mod scheduling {
    use super::*;

    /// Builds run one at a time, in priority order, honoring dependencies.
    #[tokio::test]
    async fn test_slices_build_in_plan_order() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "ordered").await;
        let agent = ScriptedAgent::happy(3);
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            agent.clone(),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config(),
        );

        let status = coordinator.start(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Complete);

        // the opening event of each slice records its conversation id;
        // creation order on the agent side is therefore build order
        let conversations = agent.created_conversations().await;
        assert_eq!(conversations.len(), 3);

        let mut build_order = vec![String::new(); 3];
        for slice in store.list_slices(&pid).await.unwrap() {
            let events = store.list_events(&slice.id).await.unwrap();
            let conv = events[0]
                .metadata
                .get("conversation_id")
                .and_then(Value::as_str)
                .unwrap()
                .to_string();
            let position = conversations.iter().position(|c| *c == conv).unwrap();
            build_order[position] = slice.name.clone();
        }
        assert_eq!(build_order, vec!["data-model", "api", "ui-shell"]);
    }

    #[tokio::test]
    async fn test_dependent_slice_waits_for_dependency() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "blocked").await;
        // dependency has lower urgency than its dependent; the dependent
        // must still wait
        let plan = vec![
            SliceSpec::new("late-dep", vec![], json!({})),
            SliceSpec::new("eager", vec!["late-dep"], json!({})),
        ];
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(2),
            ScriptedPlanner::new(plan),
            fast_config(),
        );

        let status = coordinator.start(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Complete);

        let slices = store.list_slices(&pid).await.unwrap();
        assert!(slices.iter().all(|s| s.status == SliceStatus::Complete));
    }

    #[tokio::test]
    async fn test_build_slot_released_on_completion() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "slot").await;
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(3),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config(),
        );

        coordinator.start(&pid).await.unwrap();
        assert!(store
            .get_project(&pid)
            .await
            .unwrap()
            .current_slice_id
            .is_none());
    }
}

// =============================================================================
// Failure handling
// =============================================================================

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_agent_fails_project_terminally() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "unreachable").await;
        let agent = ScriptedAgent::new(vec![Script {
            events: vec![ScriptItem::FatalError("connection refused".into())],
            hold_open: false,
        }]);
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            agent,
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config(),
        );

        let status = coordinator.start(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Failed);

        let project = store.get_project(&pid).await.unwrap();
        let ctx = project.error_context.unwrap();
        assert_eq!(ctx.step, "building");
        assert!(!ctx.retryable);

        let slices = store.list_slices(&pid).await.unwrap();
        assert_eq!(
            slices
                .iter()
                .filter(|s| s.status == SliceStatus::Failed)
                .count(),
            1
        );
        // downstream slices were never attempted
        assert!(slices
            .iter()
            .filter(|s| s.status != SliceStatus::Failed)
            .all(|s| s.status == SliceStatus::Pending));
    }

    #[tokio::test]
    async fn test_retryable_failures_exhaust_budget_then_fail() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "flaky").await;
        // every conversation dies; a budget of 2 allows three attempts
        let agent = ScriptedAgent::new(vec![Script::failing("flaky backend")]);
        let plan = vec![SliceSpec::new("only", vec![], json!({}))];
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            agent.clone(),
            ScriptedPlanner::new(plan),
            fast_config().with_max_retries(2),
        );

        let status = coordinator.start(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Failed);

        let slice = &store.list_slices(&pid).await.unwrap()[0];
        assert_eq!(slice.status, SliceStatus::Failed);
        assert_eq!(slice.retry_count, 2);
        assert_eq!(agent.created_conversations().await.len(), 3);
    }

    #[tokio::test]
    async fn test_restart_after_failed_build_succeeds() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "second-chance").await;
        let failing = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::new(vec![Script::failing("backend down")]),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config().with_max_retries(0),
        );
        assert_eq!(failing.start(&pid).await.unwrap(), ProjectStatus::Failed);

        // a fresh start over the same store must not trip over the old
        // failed slice or accumulate a duplicate plan
        let healthy = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(3),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config(),
        );
        assert_eq!(healthy.start(&pid).await.unwrap(), ProjectStatus::Complete);

        let slices = store.list_slices(&pid).await.unwrap();
        assert_eq!(slices.len(), 3);
        assert!(slices.iter().all(|s| s.status == SliceStatus::Complete));
        assert!(store
            .get_project(&pid)
            .await
            .unwrap()
            .error_context
            .is_none());
    }

    #[tokio::test]
    async fn test_analysis_failure_leaves_other_phase_recorded() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "half-analysis").await;
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(1),
            ScriptedPlanner::with_failing_requirements(ScriptedPlanner::demo_plan()),
            fast_config(),
        );

        let status = coordinator.start(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Failed);

        let project = store.get_project(&pid).await.unwrap();
        assert_eq!(
            project.phase_status.get("requirements").map(|s| s.as_str()),
            Some("failed")
        );
        // the sibling phase ran to completion in isolation
        assert_eq!(
            project.phase_status.get("architecture").map(|s| s.as_str()),
            Some("complete")
        );
        assert!(project.error_context.unwrap().retryable);
    }
}

// =============================================================================
// Checkpoint and resume
// =============================================================================

mod checkpointing {
    use super::*;

    /// A run interrupted after analysis resumes at planning with a fresh
    /// coordinator over the same store, without replaying analysis.
    #[tokio::test]
    async fn test_resume_across_coordinator_instances() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "resumable").await;

        // simulate the dead run's footprint
        let checkpoints = CheckpointManager::new(store.clone());
        let mut cp = PipelineCheckpoint::new();
        cp.record_step(STEP_ANALYSIS, Some(json!({"requirements": {"features": 3}})));
        checkpoints.save(&pid, &cp).await.unwrap();
        store
            .update_project_status(&pid, ProjectStatus::Paused)
            .await
            .unwrap();
        store
            .update_error_context(
                &pid,
                Some(ErrorContext::new(STEP_PLANNING, "process exited", true)),
            )
            .await
            .unwrap();

        let coordinator = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(3),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config(),
        );
        let status = coordinator.resume(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Complete);

        let project = store.get_project(&pid).await.unwrap();
        assert!(project.error_context.is_none());
        assert_eq!(store.list_slices(&pid).await.unwrap().len(), 3);

        let cp: PipelineCheckpoint =
            serde_json::from_value(project.checkpoint.unwrap()).unwrap();
        assert_eq!(cp.completed_steps.len(), 3);
    }

    #[tokio::test]
    async fn test_malformed_checkpoint_restarts_from_scratch() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "corrupt").await;
        store
            .update_checkpoint(&pid, Some(json!("not a checkpoint")))
            .await
            .unwrap();
        store
            .update_project_status(&pid, ProjectStatus::Failed)
            .await
            .unwrap();

        let coordinator = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(3),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config(),
        );
        // corruption reads as no progress, so resume is refused
        assert!(coordinator.resume(&pid).await.is_err());
        // but a fresh start works and rebuilds everything
        let status = coordinator.start(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Complete);
    }
}

// =============================================================================
// Pause
// =============================================================================

mod pausing {
    use super::*;

    #[tokio::test]
    async fn test_pause_stops_conversations_and_settles_run() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "pausable").await;
        let agent = ScriptedAgent::new(vec![Script::hanging()]);
        let coordinator = Arc::new(PipelineCoordinator::new(
            store.clone(),
            agent.clone(),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config().with_monitor_timeout(Duration::from_secs(60)),
        ));

        let run = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            let pid = pid.clone();
            async move { coordinator.start(&pid).await }
        });

        // let the run reach the hanging build
        tokio::time::sleep(Duration::from_millis(200)).await;
        coordinator.pause(&pid).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, ProjectStatus::Paused);
        assert!(!agent.stopped_conversations().await.is_empty());
    }
}

// =============================================================================
// Event log
// =============================================================================

mod event_log {
    use super::*;

    #[tokio::test]
    async fn test_slice_logs_follow_build_shape() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "logged").await;
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(3),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config(),
        );
        coordinator.start(&pid).await.unwrap();

        for slice in store.list_slices(&pid).await.unwrap() {
            let events = store.list_events(&slice.id).await.unwrap();
            assert!(!events.is_empty());
            let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
            assert_eq!(kinds[0], EventKind::Thought);
            assert!(kinds.contains(&EventKind::CodeWrite));
            assert!(kinds.contains(&EventKind::TestResult));
            assert_eq!(kinds.last(), Some(&EventKind::ConfidenceUpdate));
            // timestamps never go backwards within one log
            assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }

    #[tokio::test]
    async fn test_confidence_persisted_at_or_above_threshold() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "confident").await;
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(3),
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config(),
        );
        coordinator.start(&pid).await.unwrap();

        for slice in store.list_slices(&pid).await.unwrap() {
            assert!(slice.confidence_score >= 0.85);
            assert!(slice.confidence_score <= 1.0);
        }
    }
}

// =============================================================================
// Rehearsal mode
// =============================================================================

mod rehearsal {
    use super::*;

    #[tokio::test]
    async fn test_rehearsal_masks_agent_failures() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "rehearsed").await;
        let agent = ScriptedAgent::new(vec![Script::failing("backend down")]);
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            agent,
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config().with_mode(ExecutionMode::Rehearsal),
        );

        let status = coordinator.start(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Complete);

        for slice in store.list_slices(&pid).await.unwrap() {
            assert_eq!(slice.status, SliceStatus::Complete);
            let events = store.list_events(&slice.id).await.unwrap();
            assert!(events.iter().any(|e| e.kind == EventKind::TestResult));
        }
    }

    #[tokio::test]
    async fn test_production_mode_does_not_mask_failures() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "unmasked").await;
        // retry budget of zero so a single failure is terminal
        let agent = ScriptedAgent::new(vec![Script::failing("backend down")]);
        let coordinator = PipelineCoordinator::new(
            store.clone(),
            agent,
            ScriptedPlanner::new(ScriptedPlanner::demo_plan()),
            fast_config().with_max_retries(0),
        );

        let status = coordinator.start(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Failed);
    }
}

// =============================================================================
// Store isolation for manual slices
// =============================================================================

mod manual_slices {
    use super::*;

    /// Slices created outside the planner are scheduled the same way.
    #[tokio::test]
    async fn test_manually_seeded_slices_schedule() {
        let store = MemoryStore::new();
        let pid = seed_project(&store, "manual").await;
        store
            .update_project_status(&pid, ProjectStatus::Ready)
            .await
            .unwrap();

        let first = Slice::new(&pid, "first", 0, json!({}));
        let second =
            Slice::new(&pid, "second", 1, json!({})).with_dependencies([first.id.clone()]);
        store.upsert_slice(first).await.unwrap();
        store.upsert_slice(second).await.unwrap();

        // checkpoint says analysis and planning already happened
        let checkpoints = CheckpointManager::new(store.clone());
        let mut cp = PipelineCheckpoint::new();
        cp.record_step(STEP_ANALYSIS, None);
        cp.record_step(STEP_PLANNING, None);
        checkpoints.save(&pid, &cp).await.unwrap();
        store
            .update_project_status(&pid, ProjectStatus::Paused)
            .await
            .unwrap();

        let coordinator = PipelineCoordinator::new(
            store.clone(),
            ScriptedAgent::happy(2),
            ScriptedPlanner::new(vec![]),
            fast_config(),
        );
        let status = coordinator.resume(&pid).await.unwrap();
        assert_eq!(status, ProjectStatus::Complete);

        let slices = store.list_slices(&pid).await.unwrap();
        assert_eq!(slices.len(), 2);
        assert!(slices.iter().all(|s| s.status == SliceStatus::Complete));
    }
}
