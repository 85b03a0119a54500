use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ai_agent::{
    AgentContext, AgentOrchestrator, AgentResult, EventBus, SubagentResult, SubagentSpawner,
    SubagentTask, Subscription,
};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SUBAGENT_CHANGED: &str = "subagent_changed";
const TASK_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubagentConfig {
    pub max_concurrent: usize,
    /// Agents at this depth may not spawn further subagents.
    pub max_depth: usize,
    pub default_timeout_ms: u64,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_depth: 2,
            default_timeout_ms: 30_000,
        }
    }
}

impl SubagentConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum SubagentError {
    #[error("Maximum concurrent subagents ({limit}) reached")]
    CapacityExceeded { limit: usize },
    #[error("Maximum subagent depth ({limit}) reached")]
    DepthExceeded { limit: usize },
    #[error("Subagent cancelled")]
    Cancelled,
    #[error("failed to create subagent: {0:#}")]
    Factory(anyhow::Error),
    #[error("{0:#}")]
    Run(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Running,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentInfo {
    pub id: String,
    /// First hundred characters of the prompt.
    pub task: String,
    pub depth: usize,
    pub status: SubagentStatus,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubagentEvent {
    Spawned { info: SubagentInfo },
    Finished { info: SubagentInfo, success: bool },
    Cancelled { info: SubagentInfo, reason: String },
}

/// An agent a subagent task runs on.
#[async_trait]
pub trait NestedAgent: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        context: AgentContext,
        cancel: CancellationToken,
    ) -> Result<AgentResult>;

    async fn dispose(&self) -> Result<()>;
}

#[async_trait]
impl NestedAgent for AgentOrchestrator {
    async fn run(
        &self,
        prompt: &str,
        context: AgentContext,
        cancel: CancellationToken,
    ) -> Result<AgentResult> {
        Ok(self.run_cancellable(prompt, context, cancel).await?)
    }

    async fn dispose(&self) -> Result<()> {
        AgentOrchestrator::dispose(self);
        Ok(())
    }
}

/// Builds the nested agent for a task. `task.depth` is the depth of the
/// requester, so the created agent runs one level deeper.
pub trait AgentFactory: Send + Sync {
    fn create(&self, task: &SubagentTask) -> Result<Arc<dyn NestedAgent>>;
}

struct ActiveSubagent {
    info: SubagentInfo,
    token: CancellationToken,
}

enum Outcome {
    Finished(Result<AgentResult>),
    TimedOut,
    Cancelled,
}

/// Bounded pool of nested agents.
pub struct SubagentManager {
    config: SubagentConfig,
    factory: Arc<dyn AgentFactory>,
    active: Mutex<HashMap<String, ActiveSubagent>>,
    events: EventBus<SubagentEvent>,
}

impl SubagentManager {
    pub fn new(config: SubagentConfig, factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            config,
            factory,
            active: Mutex::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &SubagentConfig {
        &self.config
    }

    /// Checks both limits and registers the subagent under a single lock so
    /// two spawns racing for the last slot cannot both be accepted.
    async fn admit(&self, task: &SubagentTask) -> Result<ActiveSubagent, SubagentError> {
        let mut active = self.active.lock().await;
        if active.len() >= self.config.max_concurrent {
            return Err(SubagentError::CapacityExceeded {
                limit: self.config.max_concurrent,
            });
        }
        if task.depth >= self.config.max_depth {
            return Err(SubagentError::DepthExceeded {
                limit: self.config.max_depth,
            });
        }

        let entry = ActiveSubagent {
            info: SubagentInfo {
                id: format!("sub_{}", Uuid::new_v4().simple()),
                task: task.prompt.chars().take(TASK_PREVIEW_CHARS).collect(),
                depth: task.depth,
                status: SubagentStatus::Running,
                started_at_ms: current_timestamp_ms(),
            },
            token: CancellationToken::new(),
        };
        active.insert(
            entry.info.id.clone(),
            ActiveSubagent {
                info: entry.info.clone(),
                token: entry.token.clone(),
            },
        );
        Ok(entry)
    }

    async fn execute(
        &self,
        entry: &ActiveSubagent,
        task: SubagentTask,
    ) -> Result<AgentResult, SubagentError> {
        let id = &entry.info.id;
        let agent = match self.factory.create(&task) {
            Ok(agent) => agent,
            Err(err) => {
                let info = self.release(id, SubagentStatus::Done).await;
                self.emit(SubagentEvent::Finished {
                    info,
                    success: false,
                });
                return Err(SubagentError::Factory(err));
            }
        };

        let timeout = task.timeout().unwrap_or_else(|| self.config.default_timeout());
        let context = nested_context(&task);
        let token = &entry.token;
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Outcome::Cancelled,
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            result = agent.run(&task.prompt, context, token.child_token()) => Outcome::Finished(result),
        };
        token.cancel();

        if let Err(err) = agent.dispose().await {
            warn!(subagent = %id, error = %err, "subagent dispose failed");
        }

        let (reason, result) = match outcome {
            Outcome::Finished(result) => (None, result.map_err(SubagentError::Run)),
            Outcome::TimedOut => {
                warn!(subagent = %id, timeout_ms = timeout.as_millis() as u64, "subagent timed out");
                (Some("timeout"), Err(SubagentError::Cancelled))
            }
            Outcome::Cancelled => (Some("cancelled"), Err(SubagentError::Cancelled)),
        };

        match reason {
            Some(reason) => {
                let info = self.release(id, SubagentStatus::Cancelled).await;
                self.emit(SubagentEvent::Cancelled {
                    info,
                    reason: reason.to_string(),
                });
            }
            None => {
                let info = self.release(id, SubagentStatus::Done).await;
                self.emit(SubagentEvent::Finished {
                    info,
                    success: result.is_ok(),
                });
            }
        }
        result
    }

    /// Requests cancellation of a running subagent. Unknown ids are ignored.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut active = self.active.lock().await;
        match active.get_mut(id) {
            Some(entry) => {
                entry.info.status = SubagentStatus::Cancelled;
                entry.token.cancel();
                true
            }
            None => {
                debug!(subagent = id, "cancel requested for unknown subagent");
                false
            }
        }
    }

    pub async fn cancel_all(&self) {
        let mut active = self.active.lock().await;
        for entry in active.values_mut() {
            entry.info.status = SubagentStatus::Cancelled;
            entry.token.cancel();
        }
    }

    pub async fn active_subagents(&self) -> Vec<SubagentInfo> {
        let active = self.active.lock().await;
        let mut infos: Vec<_> = active.values().map(|entry| entry.info.clone()).collect();
        infos.sort_by(|a, b| a.started_at_ms.cmp(&b.started_at_ms).then(a.id.cmp(&b.id)));
        infos
    }

    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SubagentEvent) + Send + Sync + 'static,
    {
        self.events.on(SUBAGENT_CHANGED, listener)
    }

    /// Removes the entry and returns its final info. The caller owning the
    /// spawn is the only one that releases, so each entry goes exactly once.
    async fn release(&self, id: &str, status: SubagentStatus) -> SubagentInfo {
        let removed = self.active.lock().await.remove(id);
        let mut info = match removed {
            Some(entry) => entry.info,
            None => SubagentInfo {
                id: id.to_string(),
                task: String::new(),
                depth: 0,
                status,
                started_at_ms: 0,
            },
        };
        info.status = status;
        info
    }

    fn emit(&self, event: SubagentEvent) {
        self.events.emit(SUBAGENT_CHANGED, &event);
    }
}

#[async_trait]
impl SubagentSpawner for SubagentManager {
    async fn spawn(&self, task: SubagentTask) -> SubagentResult {
        let entry = match self.admit(&task).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(depth = task.depth, error = %err, "subagent spawn rejected");
                return SubagentResult::failed(None, err.to_string());
            }
        };
        let id = entry.info.id.clone();
        info!(subagent = %id, depth = task.depth, "spawned subagent");
        self.emit(SubagentEvent::Spawned {
            info: entry.info.clone(),
        });

        match self.execute(&entry, task).await {
            Ok(result) => {
                debug!(subagent = %id, steps = result.steps_completed, "subagent finished");
                SubagentResult::completed(id, result.text, result.steps_completed)
            }
            Err(err) => {
                info!(subagent = %id, error = %err, "subagent did not complete");
                SubagentResult::failed(Some(id), err.to_string())
            }
        }
    }

    fn max_depth(&self) -> Option<usize> {
        Some(self.config.max_depth)
    }
}

/// Context handed to the nested agent. Tools listed on the task replace the
/// ones carried by the task's context.
fn nested_context(task: &SubagentTask) -> AgentContext {
    let mut context = task.context.clone().unwrap_or_default();
    if let Some(tools) = &task.tools {
        context.tools = tools.clone();
    }
    context
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct SleepyAgent {
        delay: Duration,
        disposed: Arc<AtomicUsize>,
        contexts: Arc<StdMutex<Vec<AgentContext>>>,
    }

    #[async_trait]
    impl NestedAgent for SleepyAgent {
        async fn run(
            &self,
            prompt: &str,
            context: AgentContext,
            cancel: CancellationToken,
        ) -> Result<AgentResult> {
            self.contexts.lock().unwrap().push(context);
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => anyhow::bail!("stopped"),
            }
            if prompt == "explode" {
                anyhow::bail!("page crashed");
            }
            Ok(AgentResult {
                text: format!("done: {prompt}"),
                reasoning: None,
                tool_calls: Vec::new(),
                updated_tools: Vec::new(),
                updated_page_context: None,
                steps_completed: 1,
            })
        }

        async fn dispose(&self) -> Result<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("dispose errors are swallowed")
        }
    }

    struct SleepyFactory {
        delay: Duration,
        disposed: Arc<AtomicUsize>,
        contexts: Arc<StdMutex<Vec<AgentContext>>>,
        depths: StdMutex<Vec<usize>>,
    }

    impl SleepyFactory {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                disposed: Arc::new(AtomicUsize::new(0)),
                contexts: Arc::new(StdMutex::new(Vec::new())),
                depths: StdMutex::new(Vec::new()),
            })
        }
    }

    impl AgentFactory for SleepyFactory {
        fn create(&self, task: &SubagentTask) -> Result<Arc<dyn NestedAgent>> {
            self.depths.lock().unwrap().push(task.depth);
            Ok(Arc::new(SleepyAgent {
                delay: self.delay,
                disposed: self.disposed.clone(),
                contexts: self.contexts.clone(),
            }))
        }
    }

    struct BrokenFactory;

    impl AgentFactory for BrokenFactory {
        fn create(&self, _task: &SubagentTask) -> Result<Arc<dyn NestedAgent>> {
            anyhow::bail!("no chat session available")
        }
    }

    fn manager(factory: Arc<SleepyFactory>, config: SubagentConfig) -> Arc<SubagentManager> {
        Arc::new(SubagentManager::new(config, factory))
    }

    #[tokio::test(start_paused = true)]
    async fn completes_and_releases_slot() {
        let factory = SleepyFactory::new(Duration::from_millis(10));
        let manager = manager(factory.clone(), SubagentConfig::default());

        let result = manager.spawn(SubagentTask::new("read the page")).await;

        assert!(result.success);
        assert_eq!(result.text.as_deref(), Some("done: read the page"));
        assert!(result.subagent_id.unwrap().starts_with("sub_"));
        assert!(manager.active_subagents().await.is_empty());
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_spawns_over_capacity() {
        let factory = SleepyFactory::new(Duration::from_secs(5));
        let manager = manager(factory, SubagentConfig::default());

        let mut running = Vec::new();
        for idx in 0..3 {
            let manager = manager.clone();
            running.push(tokio::spawn(async move {
                manager.spawn(SubagentTask::new(format!("task {idx}"))).await
            }));
        }
        tokio::task::yield_now().await;
        while manager.active_subagents().await.len() < 3 {
            tokio::task::yield_now().await;
        }

        let rejected = manager.spawn(SubagentTask::new("one too many")).await;
        assert!(!rejected.success);
        assert_eq!(
            rejected.error.as_deref(),
            Some("Maximum concurrent subagents (3) reached")
        );

        for handle in running {
            assert!(handle.await.unwrap().success);
        }
        assert!(manager.active_subagents().await.is_empty());
    }

    #[tokio::test]
    async fn rejects_requests_at_max_depth() {
        let factory = SleepyFactory::new(Duration::from_millis(1));
        let manager = manager(factory.clone(), SubagentConfig::default());

        let result = manager
            .spawn(SubagentTask::new("nested").with_depth(2))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Maximum subagent depth (2) reached")
        );
        assert!(factory.depths.lock().unwrap().is_empty());

        let allowed = manager
            .spawn(SubagentTask::new("nested").with_depth(1))
            .await;
        assert!(allowed.success);
        assert_eq!(*factory.depths.lock().unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_and_removes() {
        let factory = SleepyFactory::new(Duration::from_secs(60));
        let manager = manager(factory.clone(), SubagentConfig::default());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        manager.on_change(move |event| sink.lock().unwrap().push(event.clone()));

        let result = manager
            .spawn(SubagentTask::new("slow").with_timeout(Duration::from_millis(100)))
            .await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Subagent cancelled"));
        assert!(manager.active_subagents().await.is_empty());
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], SubagentEvent::Spawned { .. }));
        assert!(
            matches!(&events[1], SubagentEvent::Cancelled { reason, .. } if reason == "timeout")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancel_stops_running_subagent() {
        let factory = SleepyFactory::new(Duration::from_secs(10));
        let manager = manager(factory, SubagentConfig::default());

        let runner = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.spawn(SubagentTask::new("long task")).await })
        };
        let id = loop {
            if let Some(info) = manager.active_subagents().await.first() {
                break info.id.clone();
            }
            tokio::task::yield_now().await;
        };

        assert!(manager.cancel(&id).await);
        let result = runner.await.unwrap();
        assert_eq!(result.error.as_deref(), Some("Subagent cancelled"));
        assert!(!manager.cancel(&id).await);
    }

    #[tokio::test]
    async fn unknown_cancel_is_noop() {
        let factory = SleepyFactory::new(Duration::from_millis(1));
        let manager = manager(factory, SubagentConfig::default());
        assert!(!manager.cancel("sub_missing").await);
    }

    #[tokio::test]
    async fn run_failures_become_failed_results() {
        let factory = SleepyFactory::new(Duration::from_millis(1));
        let manager = manager(factory, SubagentConfig::default());

        let result = manager.spawn(SubagentTask::new("explode")).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("page crashed"));
    }

    #[tokio::test]
    async fn long_prompts_are_truncated_in_info() {
        let factory = SleepyFactory::new(Duration::from_millis(50));
        let manager = manager(factory, SubagentConfig::default());
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        manager.on_change(move |event| sink.lock().unwrap().push(event.clone()));

        manager.spawn(SubagentTask::new("x".repeat(250))).await;

        let events = events.lock().unwrap();
        let SubagentEvent::Spawned { info } = &events[0] else {
            panic!("expected spawn event");
        };
        assert_eq!(info.task.chars().count(), 100);
    }

    #[tokio::test]
    async fn task_tools_reach_nested_agent() {
        let factory = SleepyFactory::new(Duration::from_millis(1));
        let manager = manager(factory.clone(), SubagentConfig::default());
        let only_tool = ai_agent::ToolDefinition::new("read_table", "Read a table", serde_json::json!({}));

        let mut task = SubagentTask::new("read prices");
        task.tools = Some(vec![only_tool.clone()]);
        assert!(manager.spawn(task).await.success);

        let mut with_context = SubagentTask::new("read prices again").with_context(
            AgentContext::new(5).with_tools(vec![ai_agent::ToolDefinition::new(
                "click",
                "Click",
                serde_json::json!({}),
            )]),
        );
        with_context.tools = Some(vec![only_tool.clone()]);
        assert!(manager.spawn(with_context).await.success);

        let contexts = factory.contexts.lock().unwrap();
        assert_eq!(contexts[0].tools, vec![only_tool.clone()]);
        assert_eq!(contexts[1].tools, vec![only_tool]);
        assert_eq!(contexts[1].tab_id.0, 5);
    }

    #[tokio::test]
    async fn factory_failure_releases_slot() {
        let manager = Arc::new(SubagentManager::new(
            SubagentConfig::default(),
            Arc::new(BrokenFactory),
        ));
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        manager.on_change(move |event| sink.lock().unwrap().push(event.clone()));

        let result = manager.spawn(SubagentTask::new("anything")).await;

        assert!(!result.success);
        assert!(result.subagent_id.is_some());
        assert_eq!(
            result.error.as_deref(),
            Some("failed to create subagent: no chat session available")
        );
        assert!(manager.active_subagents().await.is_empty());
        assert!(matches!(
            events.lock().unwrap()[1],
            SubagentEvent::Finished { success: false, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_every_running_subagent() {
        let factory = SleepyFactory::new(Duration::from_secs(10));
        let manager = manager(factory.clone(), SubagentConfig::default());

        let runners: Vec<_> = (0..2)
            .map(|idx| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.spawn(SubagentTask::new(format!("job {idx}"))).await })
            })
            .collect();
        while manager.active_subagents().await.len() < 2 {
            tokio::task::yield_now().await;
        }

        manager.cancel_all().await;
        for runner in runners {
            let result = runner.await.unwrap();
            assert_eq!(result.error.as_deref(), Some("Subagent cancelled"));
        }
        assert!(manager.active_subagents().await.is_empty());
        assert_eq!(factory.disposed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_spawns_never_exceed_capacity() {
        let factory = SleepyFactory::new(Duration::from_millis(500));
        let manager = manager(factory, SubagentConfig::default());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let running = running.clone();
            let peak = peak.clone();
            manager.on_change(move |event| match event {
                SubagentEvent::Spawned { .. } => {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                }
                _ => {
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|idx| {
                let manager = manager.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    manager.spawn(SubagentTask::new(format!("race {idx}"))).await
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            if result.success {
                accepted += 1;
            } else {
                assert_eq!(
                    result.error.as_deref(),
                    Some("Maximum concurrent subagents (3) reached")
                );
            }
        }
        assert_eq!(accepted, 3);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(manager.active_subagents().await.is_empty());
    }
}
