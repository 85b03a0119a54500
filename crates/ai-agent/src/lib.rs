//! Core agent orchestration primitives for the browser.
//! The crate drives a chat model through a bounded tool-calling loop, keeps
//! plan state in sync with an external store and hands subtasks to other tabs
//! or nested agents through host-provided ports.

pub mod calls;
pub mod event_bus;
pub mod language_model;
pub mod orchestrator;
pub mod plan;
pub mod subagent;
pub mod tools;
pub mod types;

pub use calls::{AgentCall, DelegationRoutes, DelegationToolCall, PlanToolCall};
pub use event_bus::{EventBus, ListenerId, Subscription};
pub use language_model::{
    ChatSession, ChatSessionFactory, ConfigBuilder, ContentPart, DefaultConfigBuilder,
    ModelConfig, ModelMessage, ModelResponse, ToolResponse,
};
pub use orchestrator::{
    AgentConfig, AgentError, AgentEvent, AgentOrchestrator, FinishReason, OrchestratorDeps,
};
pub use plan::{InMemoryPlanStore, Plan, PlanCoordinator, PlanStep, PlanStepStatus, PlanStore};
pub use subagent::{SubagentResult, SubagentSpawner, SubagentTask};
pub use tools::{
    RescanOutcome, Rescanner, TabDelegation, TabDelegationRequest, ToolExecutor, ToolTarget,
};
pub use types::{
    AgentContext, AgentResult, MentionContext, PageContext, ParsedFunctionCall, TabId,
    ToolCallRecord, ToolDefinition, ToolResult,
};

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_LOOP_TIMEOUT_MS: u64 = 60_000;
