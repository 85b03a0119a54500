use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{AgentContext, ToolDefinition};

/// Request to run a nested agent on a subtask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentTask {
    pub prompt: String,
    #[serde(default)]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default)]
    pub context: Option<AgentContext>,
    /// Depth of the agent asking for the spawn; top-level agents are 0.
    #[serde(default)]
    pub depth: usize,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SubagentTask {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_context(mut self, context: AgentContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentResult {
    pub subagent_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub steps_completed: usize,
}

impl SubagentResult {
    pub fn completed(subagent_id: String, text: String, steps_completed: usize) -> Self {
        Self {
            subagent_id: Some(subagent_id),
            success: true,
            text: Some(text),
            error: None,
            steps_completed,
        }
    }

    pub fn failed(subagent_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            subagent_id,
            success: false,
            text: None,
            error: Some(error.into()),
            steps_completed: 0,
        }
    }
}

/// Runs delegated subtasks. Implementations resolve every failure into a
/// `SubagentResult` instead of returning an error.
#[async_trait]
pub trait SubagentSpawner: Send + Sync {
    async fn spawn(&self, task: SubagentTask) -> SubagentResult;

    /// Requests from agents at this depth or deeper are refused; `None` when
    /// unbounded.
    fn max_depth(&self) -> Option<usize> {
        None
    }
}
