//! Runtime assembly for the browser agent: the bounded subagent pool, the
//! runtime builder that wires host ports into orchestrators, and transcript
//! replay collaborators for running the agent offline.

pub mod replay;
pub mod runtime;
pub mod subagent;

pub use replay::{ReplaySession, ReplaySessionFactory, ReplayToolExecutor, Transcript};
pub use runtime::{AgentRuntime, AgentRuntimeBuilder, RuntimeConfig};
pub use subagent::{
    AgentFactory, NestedAgent, SubagentConfig, SubagentError, SubagentEvent, SubagentInfo,
    SubagentManager, SubagentStatus,
};
