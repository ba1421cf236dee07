//! Engine configuration.
//!
//! Mirrors the builder-style config objects used elsewhere in the codebase:
//! sensible defaults plus `with_*` overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum retry count before a slice fails terminally.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Confidence threshold a build must reach to complete without a warning.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.85;

/// Margin added above the threshold when rehearsal mode forces acceptance.
pub const REHEARSAL_EPSILON: f64 = 0.05;

/// Default wall-clock limit on a single monitoring window (10 minutes).
const DEFAULT_MONITOR_TIMEOUT_SECS: u64 = 600;

/// Default pacing between appended events. UI smoothing, not correctness.
const DEFAULT_EVENT_PACING_MS: u64 = 150;

/// Execution mode for the build state machine.
///
/// Rehearsal is an explicit value threaded through the supervisor, never an
/// implicit fallback, so production and demonstration semantics stay
/// independently testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Production,
    /// Force builds to succeed with scripted events; for demos and drills.
    Rehearsal,
}

impl ExecutionMode {
    pub fn is_rehearsal(&self) -> bool {
        matches!(self, Self::Rehearsal)
    }
}

/// Configuration shared by the scheduler, supervisor, and coordinator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry budget per slice; reaching it fails the slice terminally.
    pub max_retries: u32,
    /// Confidence a build must accumulate to pass evaluation cleanly.
    pub confidence_threshold: f64,
    /// Wall-clock limit for one monitoring window.
    pub monitor_timeout: Duration,
    /// Sleep between appended events; zero disables pacing.
    pub event_pacing: Duration,
    pub mode: ExecutionMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            monitor_timeout: Duration::from_secs(DEFAULT_MONITOR_TIMEOUT_SECS),
            event_pacing: Duration::from_millis(DEFAULT_EVENT_PACING_MS),
            mode: ExecutionMode::Production,
        }
    }
}

impl EngineConfig {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_monitor_timeout(mut self, timeout: Duration) -> Self {
        self.monitor_timeout = timeout;
        self
    }

    pub fn with_event_pacing(mut self, pacing: Duration) -> Self {
        self.event_pacing = pacing;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}
