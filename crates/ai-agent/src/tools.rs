use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::types::{PageContext, TabId, ToolDefinition, ToolResult};

pub const CREATE_PLAN_TOOL: &str = "create_plan";
pub const UPDATE_PLAN_TOOL: &str = "update_plan";
pub const DELEGATE_TO_TAB_TOOL: &str = "delegate_to_tab";
pub const SPAWN_SUBAGENT_TOOL: &str = "spawn_subagent";

/// Where a tool call is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolTarget {
    pub tab_id: TabId,
    pub origin_tab_id: TabId,
}

/// Executes a named tool against browser state. An `Err` is treated like a
/// thrown tool and becomes a failed call record.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(
        &self,
        name: &str,
        args: &Map<String, Value>,
        target: ToolTarget,
    ) -> Result<ToolResult>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescanOutcome {
    pub page_context: Option<PageContext>,
    pub tools: Vec<ToolDefinition>,
}

/// Re-discovers tools and page context after a navigation.
#[async_trait]
pub trait Rescanner: Send + Sync {
    async fn rescan(&self, tab_id: TabId, tools: &[ToolDefinition]) -> Result<RescanOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabDelegationRequest {
    pub required_skills: Vec<String>,
    pub task: String,
    pub origin_tab_id: TabId,
}

/// Hands a task to another tab that advertises the required skills.
#[async_trait]
pub trait TabDelegation: Send + Sync {
    async fn delegate(&self, request: TabDelegationRequest) -> Result<ToolResult>;
}

pub fn build_plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "goal": { "type": "string", "description": "What the plan accomplishes" },
            "steps": {
                "type": "array",
                "description": "Ordered step titles",
                "items": { "type": "string" }
            }
        },
        "required": ["goal", "steps"],
        "additionalProperties": false
    })
}

pub fn build_delegate_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "required_skills": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Skills the target tab must offer (e.g. email, compose)"
            },
            "task": { "type": "string", "description": "Instruction for the target tab" }
        },
        "required": ["required_skills", "task"],
        "additionalProperties": false
    })
}

pub fn build_subagent_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "task": { "type": "string", "description": "Self-contained subtask for the subagent" },
            "timeout_ms": { "type": "integer", "minimum": 1, "description": "Override the subagent timeout" }
        },
        "required": ["task"],
        "additionalProperties": false
    })
}

pub fn plan_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            CREATE_PLAN_TOOL,
            "Create a step-by-step plan before working on a multi-step task.",
            build_plan_schema(),
        )
        .with_category("planning"),
        ToolDefinition::new(
            UPDATE_PLAN_TOOL,
            "Replace the current plan when the approach changes.",
            build_plan_schema(),
        )
        .with_category("planning"),
    ]
}

pub fn delegate_tool_definition() -> ToolDefinition {
    ToolDefinition::new(
        DELEGATE_TO_TAB_TOOL,
        "Delegate a task to another open tab that has the required skills.",
        build_delegate_schema(),
    )
    .with_category("delegation")
}

pub fn subagent_tool_definition() -> ToolDefinition {
    ToolDefinition::new(
        SPAWN_SUBAGENT_TOOL,
        "Run an independent subagent on a self-contained subtask and wait for its answer.",
        build_subagent_schema(),
    )
    .with_category("delegation")
}
