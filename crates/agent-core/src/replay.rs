//! Offline collaborators that replay a recorded conversation. A transcript
//! holds the model turns in order plus queued outcomes per tool name; tools
//! without queued outcomes succeed with an empty payload.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use ai_agent::{
    AgentContext, ChatSession, ChatSessionFactory, ModelConfig, ModelMessage, ModelResponse,
    ToolExecutor, ToolResult, ToolTarget,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub context: AgentContext,
    pub turns: Vec<ModelResponse>,
    #[serde(default)]
    pub tool_outcomes: HashMap<String, Vec<ToolResult>>,
}

impl Transcript {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading transcript at {:?}", path))?;
        serde_json::from_str(&contents).with_context(|| "parsing transcript")
    }

    /// Splits the transcript into a session factory and a tool executor.
    pub fn into_collaborators(self) -> (Arc<ReplaySessionFactory>, Arc<ReplayToolExecutor>) {
        (
            Arc::new(ReplaySessionFactory::new(self.turns)),
            Arc::new(ReplayToolExecutor::new(self.tool_outcomes)),
        )
    }
}

/// Hands out sessions that all read from one shared queue of turns.
pub struct ReplaySessionFactory {
    turns: Arc<Mutex<VecDeque<ModelResponse>>>,
}

impl ReplaySessionFactory {
    pub fn new(turns: Vec<ModelResponse>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns.into())),
        }
    }

    pub async fn remaining_turns(&self) -> usize {
        self.turns.lock().await.len()
    }
}

impl ChatSessionFactory for ReplaySessionFactory {
    fn create_session(&self) -> Result<Arc<dyn ChatSession>> {
        Ok(Arc::new(ReplaySession {
            turns: self.turns.clone(),
        }))
    }
}

pub struct ReplaySession {
    turns: Arc<Mutex<VecDeque<ModelResponse>>>,
}

#[async_trait]
impl ChatSession for ReplaySession {
    async fn send_message(
        &self,
        message: ModelMessage,
        _config: &ModelConfig,
    ) -> Result<ModelResponse> {
        let kind = match &message {
            ModelMessage::Text(_) => "text",
            ModelMessage::Parts(_) => "parts",
            ModelMessage::ToolResponses(_) => "tool_responses",
        };
        debug!(kind, "replaying model turn");
        self.turns
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| anyhow!("transcript has no more model turns"))
    }

    fn trim_history(&self, _max_messages: Option<usize>) {}
}

pub struct ReplayToolExecutor {
    outcomes: Mutex<HashMap<String, VecDeque<ToolResult>>>,
}

impl ReplayToolExecutor {
    pub fn new(outcomes: HashMap<String, Vec<ToolResult>>) -> Self {
        Self {
            outcomes: Mutex::new(
                outcomes
                    .into_iter()
                    .map(|(name, results)| (name, results.into()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl ToolExecutor for ReplayToolExecutor {
    async fn execute(
        &self,
        name: &str,
        args: &Map<String, Value>,
        target: ToolTarget,
    ) -> Result<ToolResult> {
        let args = Value::Object(args.clone());
        info!(tool = name, tab = %target.tab_id, args = %args, "replaying tool call");
        let queued = self
            .outcomes
            .lock()
            .await
            .get_mut(name)
            .and_then(VecDeque::pop_front);
        Ok(queued.unwrap_or_else(|| ToolResult::success(json!({}))))
    }
}
