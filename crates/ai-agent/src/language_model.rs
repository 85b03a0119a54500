use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{PageContext, ParsedFunctionCall, ToolDefinition};

/// Per-request model configuration. Rebuilt every iteration so the model sees
/// the tools and page context as they are after any navigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub system_instruction: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            system_instruction: None,
            tools: Vec::new(),
            temperature: 0.4,
            max_output_tokens: Some(2048),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
}

/// Function response paired with the call id the model issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub call_id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum ModelMessage {
    Text(String),
    Parts(Vec<ContentPart>),
    ToolResponses(Vec<ToolResponse>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub function_calls: Vec<ParsedFunctionCall>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn calls(function_calls: Vec<ParsedFunctionCall>) -> Self {
        Self {
            function_calls,
            ..Self::default()
        }
    }
}

/// Stateful chat session owned by the caller. The orchestrator only sends
/// turns and asks it to trim its history.
#[async_trait]
pub trait ChatSession: Send + Sync {
    async fn send_message(
        &self,
        message: ModelMessage,
        config: &ModelConfig,
    ) -> Result<ModelResponse>;

    fn trim_history(&self, max_messages: Option<usize>);
}

/// Creates fresh sessions for nested agents.
pub trait ChatSessionFactory: Send + Sync {
    fn create_session(&self) -> Result<Arc<dyn ChatSession>>;
}

/// Pure mapping from the current page context and tools to a model config.
pub trait ConfigBuilder: Send + Sync {
    fn build(&self, page_context: Option<&PageContext>, tools: &[ToolDefinition]) -> ModelConfig;
}

impl<F> ConfigBuilder for F
where
    F: Fn(Option<&PageContext>, &[ToolDefinition]) -> ModelConfig + Send + Sync,
{
    fn build(&self, page_context: Option<&PageContext>, tools: &[ToolDefinition]) -> ModelConfig {
        self(page_context, tools)
    }
}

/// Config builder that folds the page title and URL into the system prompt.
#[derive(Debug, Clone)]
pub struct DefaultConfigBuilder {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
}

impl Default for DefaultConfigBuilder {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.trim().to_string(),
            temperature: 0.4,
            max_output_tokens: Some(2048),
        }
    }
}

impl ConfigBuilder for DefaultConfigBuilder {
    fn build(&self, page_context: Option<&PageContext>, tools: &[ToolDefinition]) -> ModelConfig {
        let mut instruction = self.system_prompt.clone();
        if let Some(page) = page_context {
            instruction.push_str("\n\n<<PAGE>>\n");
            if let Some(title) = &page.title {
                instruction.push_str(&format!("Title: {}\n", title));
            }
            if let Some(url) = &page.url {
                instruction.push_str(&format!("URL: {}\n", url));
            }
            if let Some(summary) = &page.summary {
                instruction.push_str(summary);
                instruction.push('\n');
            }
        }
        ModelConfig {
            system_instruction: Some(instruction),
            tools: tools.to_vec(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are a browsing agent operating inside the user's browser. You accomplish the user's task by calling the tools you are given.
Rules:
- Prefer calling tools for navigation, page inspection and form input instead of fabricating answers.
- For tasks with several steps, call create_plan first and update_plan when the approach changes.
- After a navigation the available tools are refreshed; do not reuse element references from the previous page.
- When the task is done, reply with a concise answer and no further tool calls.
"#;
