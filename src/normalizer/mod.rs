//! Event normalizer: raw agent signals to canonical events.
//!
//! `map` is a pure function; identical input yields identical output on
//! repeated calls. Timestamps are assigned when an event is appended to the
//! log, never here.
//!
//! Classification priority:
//! 1. `action` (file writes, shell commands, browser operations)
//! 2. `observation` (command output, test results)
//! 3. `message` (assistant text)
//! 4. session-state change in `extras`
//! 5. Anything else is dropped.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::{AgentEvent, EventKind};

/// Confidence deltas per classification. Deterministic lookup table; the
/// supervisor clamps the accumulator to [0, 1] after applying each one.
pub mod deltas {
    pub const TEST_PASS: f64 = 0.15;
    pub const TEST_FAIL: f64 = -0.05;
    pub const BUILD_SUCCESS: f64 = 0.10;
    pub const BUILD_FAIL: f64 = -0.05;
    pub const CODE_WRITE: f64 = 0.02;
    pub const APP_START: f64 = 0.05;
    pub const SELF_HEAL: f64 = -0.02;
}

static PASS_COUNT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s+(?:tests?\s+)?pass(?:ed|ing)?").unwrap());

static FAIL_COUNT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d+)\s+(?:tests?\s+)?fail(?:ed|ing)?").unwrap());

static BUILD_OK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)build succeeded|compiled successfully|build successful|build complete")
        .unwrap()
});

static BUILD_ERR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)build failed|compilation failed|error\[|cannot find module|syntaxerror")
        .unwrap()
});

static SELF_HEAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)diagnos|root cause|retrying after|fixing the (?:error|failure|issue)")
        .unwrap()
});

// Free-text completion phrasing is a compatibility shim for agents that
// predate an explicit done signal, not a protocol contract.
static COMPLETION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(all (?:tasks? )?done|implementation (?:is )?complete|build (?:is )?complete|finished implementing|everything (?:is )?working)\b",
    )
    .unwrap()
});

/// A raw event as delivered by the agent conversation service.
///
/// Heterogeneous by design: any subset of the optional fields may be set
/// depending on the signal source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAgentEvent {
    pub id: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub observation: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub extras: Option<Value>,
}

impl RawAgentEvent {
    fn empty(source: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.to_string(),
            timestamp: Utc::now(),
            message: None,
            action: None,
            args: None,
            observation: None,
            content: None,
            extras: None,
        }
    }

    pub fn message(text: &str) -> Self {
        Self {
            message: Some(text.to_string()),
            ..Self::empty("agent")
        }
    }

    pub fn action(action: &str, args: Value) -> Self {
        Self {
            action: Some(action.to_string()),
            args: Some(args),
            ..Self::empty("agent")
        }
    }

    pub fn observation(text: &str, exit_code: i64) -> Self {
        Self {
            observation: Some(text.to_string()),
            extras: Some(serde_json::json!({ "exit_code": exit_code })),
            ..Self::empty("environment")
        }
    }

    pub fn state_change(state: &str) -> Self {
        Self {
            extras: Some(serde_json::json!({ "state": state })),
            ..Self::empty("session")
        }
    }

    /// Session state reported in `extras`, if any.
    pub fn agent_state(&self) -> Option<&str> {
        self.extras.as_ref()?.get("state")?.as_str()
    }

    fn exit_code(&self) -> i64 {
        self.extras
            .as_ref()
            .and_then(|e| e.get("exit_code"))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }
}

/// A normalized event plus its confidence delta, not yet bound to a slice.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub confidence_delta: f64,
}

impl CanonicalEvent {
    pub fn new(kind: EventKind, content: impl Into<String>, confidence_delta: f64) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: Map::new(),
            confidence_delta,
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Bind to a slice as an append-only log record. Id and timestamp are
    /// assigned here, at append time.
    pub fn into_record(self, slice_id: &str) -> AgentEvent {
        AgentEvent {
            id: Uuid::new_v4().to_string(),
            slice_id: slice_id.to_string(),
            kind: self.kind,
            content: self.content,
            metadata: self.metadata,
            confidence_delta: self.confidence_delta,
            timestamp: Utc::now(),
        }
    }
}

/// Coarse shell-command classification by substring heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    E2e,
    Test,
    Build,
    DevServer,
    Install,
    Generic,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::E2e => "e2e",
            Self::Test => "test",
            Self::Build => "build",
            Self::DevServer => "dev_server",
            Self::Install => "install",
            Self::Generic => "generic",
        }
    }
}

/// Map a raw agent signal into the canonical vocabulary.
///
/// Returns `None` when the event carries no classifiable signal (including
/// zero-exit command output with nothing to say).
pub fn map(raw: &RawAgentEvent) -> Option<CanonicalEvent> {
    if let Some(action) = raw.action.as_deref() {
        return map_action(raw, action);
    }
    if let Some(observation) = raw.observation.as_deref() {
        return map_observation(raw, observation);
    }
    if let Some(message) = raw.message.as_deref() {
        return Some(map_message(message));
    }
    if let Some(state) = raw.agent_state() {
        return Some(
            CanonicalEvent::new(EventKind::Observation, format!("Agent state: {}", state), 0.0)
                .with_meta("agent_state", Value::String(state.to_string())),
        );
    }
    None
}

/// Whether assistant text matches the completion phrasing shim.
pub fn is_completion_message(text: &str) -> bool {
    COMPLETION_REGEX.is_match(text)
}

/// Classify a shell command by substring.
pub fn classify_command(command: &str) -> CommandKind {
    const E2E: &[&str] = &["playwright", "cypress", "e2e"];
    const TEST: &[&str] = &[
        "npm test",
        "npm run test",
        "yarn test",
        "pnpm test",
        "jest",
        "vitest",
        "pytest",
        "cargo test",
        "go test",
    ];
    const BUILD: &[&str] = &[
        "npm run build",
        "yarn build",
        "cargo build",
        "go build",
        "tsc",
        "webpack",
        "vite build",
        "make",
    ];
    const DEV: &[&str] = &["npm run dev", "npm start", "yarn dev", "next dev", "vite"];
    const INSTALL: &[&str] = &[
        "npm install",
        "npm i ",
        "yarn add",
        "pnpm add",
        "pip install",
        "cargo add",
    ];

    let contains_any = |needles: &[&str]| needles.iter().any(|n| command.contains(n));

    if contains_any(E2E) {
        CommandKind::E2e
    } else if contains_any(TEST) {
        CommandKind::Test
    } else if contains_any(BUILD) {
        CommandKind::Build
    } else if contains_any(DEV) {
        CommandKind::DevServer
    } else if contains_any(INSTALL) {
        CommandKind::Install
    } else {
        CommandKind::Generic
    }
}

/// Best-effort (passed, failed) extraction from free text. Defaults to 0.
pub fn extract_test_counts(text: &str) -> (u32, u32) {
    let grab = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };
    (grab(&PASS_COUNT_REGEX), grab(&FAIL_COUNT_REGEX))
}

fn map_action(raw: &RawAgentEvent, action: &str) -> Option<CanonicalEvent> {
    let arg_str = |key: &str| -> Option<String> {
        raw.args
            .as_ref()
            .and_then(|a| a.get(key))
            .and_then(Value::as_str)
            .map(String::from)
    };

    match action {
        "write" | "edit" | "create_file" | "str_replace" => {
            let path = arg_str("path")
                .or_else(|| arg_str("file_path"))
                .unwrap_or_else(|| "file".to_string());
            let lines = arg_str("content")
                .map(|c| c.lines().count() as u64)
                .or_else(|| raw.content.as_ref().map(|c| c.lines().count() as u64))
                .unwrap_or(1);
            Some(
                CanonicalEvent::new(
                    EventKind::CodeWrite,
                    format!("Wrote {}", path),
                    deltas::CODE_WRITE,
                )
                .with_meta("path", Value::String(path))
                .with_meta("lines", Value::from(lines)),
            )
        }
        "run" | "shell" | "bash" | "execute" => {
            let command = arg_str("command").unwrap_or_default();
            let kind = classify_command(&command);
            let event = match kind {
                CommandKind::Test | CommandKind::E2e => CanonicalEvent::new(
                    EventKind::TestRun,
                    format!("Running tests: {}", command),
                    0.0,
                )
                .with_meta("suite", Value::String(kind.as_str().to_string())),
                CommandKind::DevServer => CanonicalEvent::new(
                    EventKind::AppStart,
                    format!("Starting app: {}", command),
                    deltas::APP_START,
                ),
                _ => CanonicalEvent::new(
                    EventKind::ToolCall,
                    format!("Running: {}", command),
                    0.0,
                )
                .with_meta("command_kind", Value::String(kind.as_str().to_string())),
            };
            Some(event.with_meta("command", Value::String(command)))
        }
        "screenshot" => Some(CanonicalEvent::new(
            EventKind::Screenshot,
            "Captured screenshot".to_string(),
            0.0,
        )),
        "browser" | "navigate" | "click" | "scroll" | "type" => {
            let target = arg_str("url").or_else(|| arg_str("selector")).unwrap_or_default();
            Some(
                CanonicalEvent::new(
                    EventKind::BrowserAction,
                    format!("Browser {}: {}", action, target),
                    0.0,
                )
                .with_meta("operation", Value::String(action.to_string())),
            )
        }
        _ => Some(
            CanonicalEvent::new(EventKind::ToolCall, action.to_string(), 0.0)
                .with_meta("command_kind", Value::String("generic".to_string())),
        ),
    }
}

fn map_observation(raw: &RawAgentEvent, observation: &str) -> Option<CanonicalEvent> {
    let exit_code = raw.exit_code();
    let (passed, failed) = extract_test_counts(observation);

    if passed > 0 || failed > 0 {
        let delta = if failed > 0 {
            deltas::TEST_FAIL
        } else {
            deltas::TEST_PASS
        };
        return Some(
            CanonicalEvent::new(
                EventKind::TestResult,
                format!("{} passed, {} failed", passed, failed),
                delta,
            )
            .with_meta("passed", Value::from(passed))
            .with_meta("failed", Value::from(failed)),
        );
    }

    if BUILD_OK_REGEX.is_match(observation) {
        return Some(
            CanonicalEvent::new(
                EventKind::Observation,
                "Build succeeded".to_string(),
                deltas::BUILD_SUCCESS,
            )
            .with_meta("outcome", Value::String("build_success".to_string())),
        );
    }

    if exit_code != 0 && BUILD_ERR_REGEX.is_match(observation) {
        return Some(
            CanonicalEvent::new(
                EventKind::Observation,
                "Build failed".to_string(),
                deltas::BUILD_FAIL,
            )
            .with_meta("outcome", Value::String("build_failure".to_string()))
            .with_meta("exit_code", Value::from(exit_code)),
        );
    }

    if SELF_HEAL_REGEX.is_match(observation) {
        return Some(
            CanonicalEvent::new(
                EventKind::SelfHeal,
                first_line(observation).to_string(),
                deltas::SELF_HEAL,
            )
            .with_meta("diagnosis", Value::Bool(true)),
        );
    }

    if exit_code == 0 {
        // No classifiable signal and a clean exit: drop it.
        return None;
    }

    Some(
        CanonicalEvent::new(EventKind::Observation, first_line(observation).to_string(), 0.0)
            .with_meta("exit_code", Value::from(exit_code)),
    )
}

fn map_message(message: &str) -> CanonicalEvent {
    let event = CanonicalEvent::new(EventKind::Thought, message.to_string(), 0.0);
    if is_completion_message(message) {
        event.with_meta("completion", Value::Bool(true))
    } else {
        event
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text).trim()
}
