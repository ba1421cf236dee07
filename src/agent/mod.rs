//! Client seam for the external autonomous coding agent.
//!
//! `AgentService` abstracts conversation lifecycle and the raw event
//! stream. Production deploys a remote client behind it; `ScriptedAgent`
//! drives the same machinery from canned event scripts in tests and
//! rehearsals.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::errors::AgentError;
use crate::normalizer::RawAgentEvent;

/// Session state reported by the agent service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Running,
    Stopped,
    Finished,
}

#[async_trait]
pub trait AgentService: Send + Sync {
    /// Open a conversation seeded with the build prompt. Returns the
    /// conversation id.
    async fn create_conversation(
        &self,
        prompt: &str,
        repo_ref: Option<&str>,
    ) -> Result<String, AgentError>;

    async fn get_status(&self, conversation_id: &str) -> Result<ConversationStatus, AgentError>;

    async fn stop_conversation(&self, conversation_id: &str) -> Result<(), AgentError>;

    /// Subscribe to the conversation's raw event stream. The channel closes
    /// when the conversation ends.
    async fn open_stream(
        &self,
        conversation_id: &str,
    ) -> Result<mpsc::Receiver<Result<RawAgentEvent, AgentError>>, AgentError>;
}

/// Canned behavior for one scripted conversation.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub events: Vec<ScriptItem>,
    /// Keep the stream open after the script runs out instead of closing.
    /// The monitoring window then ends by completion signal or timeout.
    pub hold_open: bool,
}

#[derive(Debug, Clone)]
pub enum ScriptItem {
    Event(RawAgentEvent),
    Error(String),
    /// Fatal stream error; maps to `AgentError::Unreachable`.
    FatalError(String),
    Delay(Duration),
}

impl Script {
    /// A representative successful build: write, test, pass, done.
    pub fn happy_path() -> Self {
        Self {
            events: vec![
                ScriptItem::Event(RawAgentEvent::message("Starting on the slice contract")),
                ScriptItem::Event(RawAgentEvent::action(
                    "write",
                    json!({"path": "src/feature.ts", "content": "export const x = 1;\n"}),
                )),
                ScriptItem::Event(RawAgentEvent::action(
                    "run",
                    json!({"command": "npm test"}),
                )),
                ScriptItem::Event(RawAgentEvent::observation("5 passed, 0 failed", 0)),
                ScriptItem::Event(RawAgentEvent::message("Implementation complete.")),
            ],
            hold_open: false,
        }
    }

    /// A build that dies mid-stream with a transient service error.
    pub fn failing(message: &str) -> Self {
        Self {
            events: vec![
                ScriptItem::Event(RawAgentEvent::message("Starting work")),
                ScriptItem::Error(message.to_string()),
            ],
            hold_open: false,
        }
    }

    /// A conversation that emits nothing and never closes. Builds hang
    /// until stopped or timed out.
    pub fn hanging() -> Self {
        Self {
            events: vec![],
            hold_open: true,
        }
    }
}

#[derive(Default)]
struct ScriptedState {
    scripts: Vec<Script>,
    statuses: HashMap<String, ConversationStatus>,
    created: Vec<String>,
    stopped: Vec<String>,
}

/// Agent service driven by pre-loaded scripts, one per conversation in
/// creation order. The last script repeats if more conversations are
/// opened than scripts were loaded.
pub struct ScriptedAgent {
    state: Mutex<ScriptedState>,
    fail_session_creation: bool,
}

impl ScriptedAgent {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptedState {
                scripts,
                ..Default::default()
            }),
            fail_session_creation: false,
        })
    }

    pub fn happy(conversations: usize) -> Arc<Self> {
        Self::new(vec![Script::happy_path(); conversations.max(1)])
    }

    pub fn refusing_sessions() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptedState::default()),
            fail_session_creation: true,
        })
    }

    /// Conversation ids created so far, in order.
    pub async fn created_conversations(&self) -> Vec<String> {
        self.state.lock().await.created.clone()
    }

    /// Conversation ids explicitly stopped.
    pub async fn stopped_conversations(&self) -> Vec<String> {
        self.state.lock().await.stopped.clone()
    }
}

#[async_trait]
impl AgentService for ScriptedAgent {
    async fn create_conversation(
        &self,
        _prompt: &str,
        _repo_ref: Option<&str>,
    ) -> Result<String, AgentError> {
        if self.fail_session_creation {
            return Err(AgentError::SessionCreation("scripted refusal".into()));
        }
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().await;
        state.created.push(id.clone());
        state.statuses.insert(id.clone(), ConversationStatus::Running);
        Ok(id)
    }

    async fn get_status(&self, conversation_id: &str) -> Result<ConversationStatus, AgentError> {
        let state = self.state.lock().await;
        state
            .statuses
            .get(conversation_id)
            .copied()
            .ok_or_else(|| AgentError::Service(format!("unknown conversation {}", conversation_id)))
    }

    async fn stop_conversation(&self, conversation_id: &str) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        state.stopped.push(conversation_id.to_string());
        state
            .statuses
            .insert(conversation_id.to_string(), ConversationStatus::Stopped);
        Ok(())
    }

    async fn open_stream(
        &self,
        conversation_id: &str,
    ) -> Result<mpsc::Receiver<Result<RawAgentEvent, AgentError>>, AgentError> {
        let script = {
            let state = self.state.lock().await;
            let index = state
                .created
                .iter()
                .position(|c| c == conversation_id)
                .ok_or_else(|| {
                    AgentError::Stream(format!("unknown conversation {}", conversation_id))
                })?;
            state
                .scripts
                .get(index)
                .or_else(|| state.scripts.last())
                .cloned()
                .unwrap_or_default()
        };

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for item in script.events {
                let send = match item {
                    ScriptItem::Event(event) => tx.send(Ok(event)).await,
                    ScriptItem::Error(msg) => tx.send(Err(AgentError::Service(msg))).await,
                    ScriptItem::FatalError(msg) => {
                        tx.send(Err(AgentError::Unreachable(msg))).await
                    }
                    ScriptItem::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                };
                if send.is_err() {
                    return;
                }
            }
            if script.hold_open {
                tx.closed().await;
            }
        });
        Ok(rx)
    }
}

/// Ownership registry mapping slices to their live conversations.
///
/// A slice registers its conversation when setup succeeds and releases it
/// on any exit path. `shutdown` stops everything still registered, which
/// is what pause and process exit lean on.
pub struct ConversationRegistry {
    agent: Arc<dyn AgentService>,
    active: Mutex<HashMap<String, String>>,
}

impl ConversationRegistry {
    pub fn new(agent: Arc<dyn AgentService>) -> Arc<Self> {
        Arc::new(Self {
            agent,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub async fn register(&self, slice_id: &str, conversation_id: &str) {
        let mut active = self.active.lock().await;
        active.insert(slice_id.to_string(), conversation_id.to_string());
    }

    pub async fn release(&self, slice_id: &str) -> Option<String> {
        let mut active = self.active.lock().await;
        active.remove(slice_id)
    }

    pub async fn conversation_for(&self, slice_id: &str) -> Option<String> {
        let active = self.active.lock().await;
        active.get(slice_id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Stop every registered conversation, best effort, and clear the map.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, String)> = {
            let mut active = self.active.lock().await;
            active.drain().collect()
        };
        for (slice_id, conversation_id) in drained {
            if let Err(e) = self.agent.stop_conversation(&conversation_id).await {
                warn!(slice_id, conversation_id, error = %e, "Failed to stop conversation during shutdown");
            }
        }
    }
}
