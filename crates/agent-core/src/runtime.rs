use std::path::Path;
use std::sync::{Arc, Weak};

use ai_agent::{
    AgentConfig, AgentContext, AgentError, AgentEvent, AgentOrchestrator, AgentResult,
    ChatSessionFactory, ConfigBuilder, DefaultConfigBuilder, EventBus, OrchestratorDeps,
    PlanCoordinator, PlanStore, Rescanner, SubagentSpawner, SubagentTask, TabDelegation,
    ToolExecutor,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::subagent::{AgentFactory, NestedAgent, SubagentConfig, SubagentManager};

/// Settings for a runtime, usually read from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub agent: AgentConfig,
    pub subagents: SubagentConfig,
}

impl RuntimeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading runtime config at {:?}", path))?;
        serde_json::from_str(&contents).with_context(|| "parsing runtime config")
    }
}

/// Collaborators shared by the top-level agent and every nested agent.
#[derive(Clone)]
struct SharedPorts {
    sessions: Arc<dyn ChatSessionFactory>,
    tools: Arc<dyn ToolExecutor>,
    config_builder: Arc<dyn ConfigBuilder>,
    rescanner: Option<Arc<dyn Rescanner>>,
    delegation: Option<Arc<dyn TabDelegation>>,
}

impl SharedPorts {
    fn orchestrator(
        &self,
        plans: Arc<PlanCoordinator>,
        subagents: Option<Arc<dyn SubagentSpawner>>,
        config: AgentConfig,
    ) -> Result<AgentOrchestrator> {
        let session = self
            .sessions
            .create_session()
            .context("creating chat session")?;
        let deps = OrchestratorDeps {
            session,
            tools: self.tools.clone(),
            plans,
            config_builder: self.config_builder.clone(),
            rescanner: self.rescanner.clone(),
            delegation: self.delegation.clone(),
            subagents,
        };
        Ok(AgentOrchestrator::new(deps, config))
    }
}

struct OrchestratorFactory {
    ports: SharedPorts,
    config: AgentConfig,
    manager: Weak<SubagentManager>,
}

impl AgentFactory for OrchestratorFactory {
    fn create(&self, task: &SubagentTask) -> Result<Arc<dyn NestedAgent>> {
        let config = self.config.clone().with_depth(task.depth + 1);
        let subagents = self
            .manager
            .upgrade()
            .map(|manager| manager as Arc<dyn SubagentSpawner>);
        debug!(depth = config.depth, "building nested agent");
        let agent = self.ports.orchestrator(
            Arc::new(PlanCoordinator::in_memory()),
            subagents,
            config,
        )?;
        Ok(Arc::new(agent))
    }
}

pub struct AgentRuntime {
    orchestrator: AgentOrchestrator,
    subagents: Arc<SubagentManager>,
    plans: Arc<PlanCoordinator>,
}

impl AgentRuntime {
    pub fn builder(
        sessions: Arc<dyn ChatSessionFactory>,
        tools: Arc<dyn ToolExecutor>,
    ) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(sessions, tools)
    }

    pub async fn run(&self, prompt: &str, context: AgentContext) -> Result<AgentResult, AgentError> {
        self.orchestrator.run(prompt, context).await
    }

    pub async fn run_cancellable(
        &self,
        prompt: &str,
        context: AgentContext,
        cancel: CancellationToken,
    ) -> Result<AgentResult, AgentError> {
        self.orchestrator
            .run_cancellable(prompt, context, cancel)
            .await
    }

    pub fn events(&self) -> &EventBus<AgentEvent> {
        self.orchestrator.events()
    }

    pub fn plans(&self) -> &Arc<PlanCoordinator> {
        &self.plans
    }

    pub fn subagents(&self) -> &Arc<SubagentManager> {
        &self.subagents
    }

    pub fn config(&self) -> &AgentConfig {
        self.orchestrator.config()
    }

    /// Cancels running subagents and releases the top-level session.
    pub async fn dispose(&self) {
        self.subagents.cancel_all().await;
        self.orchestrator.dispose();
    }
}

pub struct AgentRuntimeBuilder {
    ports: SharedPorts,
    config: RuntimeConfig,
    plan_store: Option<Arc<dyn PlanStore>>,
}

impl AgentRuntimeBuilder {
    fn new(sessions: Arc<dyn ChatSessionFactory>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            ports: SharedPorts {
                sessions,
                tools,
                config_builder: Arc::new(DefaultConfigBuilder::default()),
                rescanner: None,
                delegation: None,
            },
            config: RuntimeConfig::default(),
            plan_store: None,
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.plan_store = Some(store);
        self
    }

    pub fn with_rescanner(mut self, rescanner: Arc<dyn Rescanner>) -> Self {
        self.ports.rescanner = Some(rescanner);
        self
    }

    pub fn with_delegation(mut self, delegation: Arc<dyn TabDelegation>) -> Self {
        self.ports.delegation = Some(delegation);
        self
    }

    pub fn with_config_builder(mut self, builder: Arc<dyn ConfigBuilder>) -> Self {
        self.ports.config_builder = builder;
        self
    }

    pub fn build(self) -> Result<AgentRuntime> {
        let RuntimeConfig { agent, subagents } = self.config;
        let ports = self.ports;
        let manager = Arc::new_cyclic(|weak| {
            let factory = OrchestratorFactory {
                ports: ports.clone(),
                config: agent.clone(),
                manager: weak.clone(),
            };
            SubagentManager::new(subagents, Arc::new(factory))
        });
        let plans = Arc::new(match self.plan_store {
            Some(store) => PlanCoordinator::new(store),
            None => PlanCoordinator::in_memory(),
        });
        let orchestrator = ports.orchestrator(
            plans.clone(),
            Some(manager.clone() as Arc<dyn SubagentSpawner>),
            agent,
        )?;
        Ok(AgentRuntime {
            orchestrator,
            subagents: manager,
            plans,
        })
    }
}
