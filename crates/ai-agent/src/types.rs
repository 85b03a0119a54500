use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque identifier of the browser surface (tab) a tool call targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub i64);

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TabId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Snapshot of the page the agent operates on. The core never inspects it
/// beyond forwarding it to the config builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContext {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub metadata: IndexMap<String, Value>,
}

impl PageContext {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            title: Some(title.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters_schema,
            category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Tool => "tool",
        };
        f.write_str(role)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionContext {
    pub target_id: TabId,
    #[serde(default)]
    pub page_context: Option<PageContext>,
}

/// Input to a single agent run. Never mutated by the orchestrator; updated
/// tools and page context come back on [`AgentResult`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub tab_id: TabId,
    #[serde(default)]
    pub page_context: Option<PageContext>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    #[serde(default)]
    pub live_state: Option<Value>,
    #[serde(default)]
    pub mention_contexts: Vec<MentionContext>,
}

impl AgentContext {
    pub fn new(tab_id: impl Into<TabId>) -> Self {
        Self {
            tab_id: tab_id.into(),
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_page_context(mut self, page_context: PageContext) -> Self {
        self.page_context = Some(page_context);
        self
    }

    /// Tab that non-local tool calls are sent to: the first mentioned tab,
    /// falling back to the tab the run was started from.
    pub fn target_tab(&self) -> TabId {
        self.mention_contexts
            .first()
            .map(|mention| mention.target_id)
            .unwrap_or(self.tab_id)
    }
}

/// A model request to invoke one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl ParsedFunctionCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        let args = match args {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ToolResultWire", from = "ToolResultWire")]
pub enum ToolResult {
    Success { data: Value },
    Failure { error: String },
}

impl ToolResult {
    pub fn success(data: Value) -> Self {
        Self::Success { data }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error } => Some(error),
        }
    }

    /// Payload handed back to the model as the function response.
    pub fn to_response(&self) -> Value {
        serde_json::to_value(ToolResultWire::from(self.clone())).unwrap_or(Value::Null)
    }
}

#[derive(Serialize, Deserialize)]
struct ToolResultWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<ToolResult> for ToolResultWire {
    fn from(result: ToolResult) -> Self {
        match result {
            ToolResult::Success { data } => Self {
                success: true,
                data: Some(data),
                error: None,
            },
            ToolResult::Failure { error } => Self {
                success: false,
                data: None,
                error: Some(error),
            },
        }
    }
}

impl From<ToolResultWire> for ToolResult {
    fn from(wire: ToolResultWire) -> Self {
        if wire.success {
            ToolResult::Success {
                data: wire.data.unwrap_or(Value::Null),
            }
        } else {
            ToolResult::Failure {
                error: wire.error.unwrap_or_else(|| "unknown error".to_string()),
            }
        }
    }
}

/// Audit entry for one attempted tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub name: String,
    pub args: Map<String, Value>,
    pub call_id: String,
    pub result: ToolResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub updated_tools: Vec<ToolDefinition>,
    pub updated_page_context: Option<PageContext>,
    pub steps_completed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_serializes_with_success_tag() {
        let ok = ToolResult::success(json!({ "clicked": true }));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({ "success": true, "data": { "clicked": true } })
        );

        let parsed: ToolResult =
            serde_json::from_value(json!({ "success": false, "error": "no such element" }))
                .unwrap();
        assert_eq!(parsed.error(), Some("no such element"));
        assert!(!parsed.is_success());
    }

    #[test]
    fn target_tab_prefers_first_mention() {
        let mut context = AgentContext::new(7);
        assert_eq!(context.target_tab(), TabId(7));

        context.mention_contexts = vec![
            MentionContext {
                target_id: TabId(11),
                page_context: None,
            },
            MentionContext {
                target_id: TabId(12),
                page_context: None,
            },
        ];
        assert_eq!(context.target_tab(), TabId(11));
    }

    #[test]
    fn non_object_args_become_empty_map() {
        let call = ParsedFunctionCall::new("c1", "scroll", json!("down"));
        assert!(call.args.is_empty());
    }
}
