use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::calls::{AgentCall, DelegationRoutes, DelegationToolCall, PlanToolCall};
use crate::event_bus::EventBus;
use crate::language_model::{
    ChatSession, ConfigBuilder, ContentPart, ModelConfig, ModelMessage, ModelResponse, ToolResponse,
};
use crate::plan::{PlanCoordinator, PlanToolKind};
use crate::subagent::{SubagentSpawner, SubagentTask};
use crate::tools::{
    delegate_tool_definition, plan_tool_definitions, subagent_tool_definition, Rescanner,
    TabDelegation, TabDelegationRequest, ToolExecutor, ToolTarget,
};
use crate::types::{
    AgentContext, AgentResult, PageContext, ParsedFunctionCall, TabId, ToolCallRecord,
    ToolDefinition, ToolResult,
};

/// Tool response sent for calls dropped after a navigation in the same batch.
pub const SKIPPED_AFTER_NAVIGATION: &str = "skipped: page navigated";

const NAVIGATION_CATEGORY: &str = "navigation";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    /// Wall-clock budget for the whole tool loop, measured from loop entry.
    pub loop_timeout_ms: u64,
    /// Forwarded to `ChatSession::trim_history` before every follow-up turn.
    pub history_limit: Option<usize>,
    pub navigation_tools: Vec<String>,
    /// Delay before rescanning a page that just navigated.
    pub navigation_settle_ms: u64,
    pub depth: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: crate::DEFAULT_MAX_ITERATIONS,
            loop_timeout_ms: crate::DEFAULT_LOOP_TIMEOUT_MS,
            history_limit: Some(40),
            navigation_tools: [
                "navigate",
                "navigate_to_url",
                "open_url",
                "go_back",
                "go_forward",
                "reload_page",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
            navigation_settle_ms: 500,
            depth: 0,
        }
    }
}

impl AgentConfig {
    pub fn loop_timeout(&self) -> Duration {
        Duration::from_millis(self.loop_timeout_ms)
    }

    pub fn navigation_settle(&self) -> Duration {
        Duration::from_millis(self.navigation_settle_ms)
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model request failed: {0:#}")]
    Model(anyhow::Error),
    #[error("agent has been disposed")]
    Disposed,
    #[error("agent run was cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Completed,
    IterationLimit,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ModelResponse {
        iteration: usize,
        text: String,
        call_count: usize,
    },
    ToolCall {
        call_id: String,
        name: String,
        args: Map<String, Value>,
    },
    ToolResult {
        call_id: String,
        name: String,
        result: ToolResult,
    },
    PlanTool {
        call_id: String,
        goal: String,
        step_count: usize,
    },
    Navigation {
        call_id: String,
        name: String,
        skipped: usize,
    },
    Finished {
        reason: FinishReason,
        steps_completed: usize,
    },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ModelResponse { .. } => "model_response",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::PlanTool { .. } => "plan_tool",
            Self::Navigation { .. } => "navigation",
            Self::Finished { .. } => "finished",
        }
    }
}

/// Every collaborator the orchestrator talks to.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub session: Arc<dyn ChatSession>,
    pub tools: Arc<dyn ToolExecutor>,
    pub plans: Arc<PlanCoordinator>,
    pub config_builder: Arc<dyn ConfigBuilder>,
    pub rescanner: Option<Arc<dyn Rescanner>>,
    pub delegation: Option<Arc<dyn TabDelegation>>,
    pub subagents: Option<Arc<dyn SubagentSpawner>>,
}

struct RunState {
    tools: Vec<ToolDefinition>,
    page_context: Option<PageContext>,
    records: Vec<ToolCallRecord>,
    text: Vec<String>,
    reasoning: Vec<String>,
    steps_completed: usize,
}

impl RunState {
    fn absorb(&mut self, response: &ModelResponse) {
        if !response.text.trim().is_empty() {
            self.text.push(response.text.clone());
        }
        if let Some(reasoning) = response.reasoning.as_ref().filter(|r| !r.trim().is_empty()) {
            self.reasoning.push(reasoning.clone());
        }
    }
}

pub struct AgentOrchestrator {
    session: Mutex<Option<Arc<dyn ChatSession>>>,
    deps: OrchestratorDeps,
    config: AgentConfig,
    events: EventBus<AgentEvent>,
    cancel: CancellationToken,
}

impl AgentOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: AgentConfig) -> Self {
        Self {
            session: Mutex::new(Some(deps.session.clone())),
            deps,
            config,
            events: EventBus::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<AgentEvent> {
        &self.events
    }

    pub fn plans(&self) -> &Arc<PlanCoordinator> {
        &self.deps.plans
    }

    pub async fn run(&self, prompt: &str, context: AgentContext) -> Result<AgentResult, AgentError> {
        self.run_cancellable(prompt, context, CancellationToken::new())
            .await
    }

    /// Runs the tool loop until the model stops calling tools, the iteration
    /// cap is hit or the loop timeout elapses. Tool failures are reported to
    /// the model; only model failures, disposal and cancellation surface as
    /// errors.
    pub async fn run_cancellable(
        &self,
        prompt: &str,
        context: AgentContext,
        cancel: CancellationToken,
    ) -> Result<AgentResult, AgentError> {
        let session = self.session()?;
        let started = Instant::now();
        let target = ToolTarget {
            tab_id: context.target_tab(),
            origin_tab_id: context.tab_id,
        };
        let mut state = RunState {
            tools: context.tools.clone(),
            page_context: context.page_context.clone(),
            records: Vec::new(),
            text: Vec::new(),
            reasoning: Vec::new(),
            steps_completed: 0,
        };

        let model_config = self.model_config(&state);
        let mut response = self
            .send(&session, initial_message(prompt, &context), &model_config, &cancel)
            .await?;
        let mut iteration = 0;

        let reason = loop {
            state.absorb(&response);
            self.emit(AgentEvent::ModelResponse {
                iteration,
                text: response.text.clone(),
                call_count: response.function_calls.len(),
            });

            if response.function_calls.is_empty() {
                break FinishReason::Completed;
            }
            if iteration >= self.config.max_iterations {
                break FinishReason::IterationLimit;
            }
            if started.elapsed() >= self.config.loop_timeout() {
                break FinishReason::Timeout;
            }

            iteration += 1;
            debug!(
                iteration,
                calls = response.function_calls.len(),
                "executing function call batch"
            );
            let calls = std::mem::take(&mut response.function_calls);
            let responses = self.execute_batch(calls, &mut state, target).await;
            state.steps_completed += 1;
            self.deps.plans.advance_step();

            let model_config = self.model_config(&state);
            session.trim_history(self.config.history_limit);
            response = self
                .send(
                    &session,
                    ModelMessage::ToolResponses(responses),
                    &model_config,
                    &cancel,
                )
                .await?;
        };

        let mut text = state.text.join("\n\n");
        match reason {
            FinishReason::Completed => {}
            FinishReason::IterationLimit => {
                warn!(iterations = iteration, "agent exhausted max iterations");
                append_note(
                    &mut text,
                    &format!(
                        "Reached maximum tool iterations ({}) before the task finished.",
                        self.config.max_iterations
                    ),
                );
            }
            FinishReason::Timeout => {
                warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "agent loop timed out"
                );
                append_note(
                    &mut text,
                    &format!(
                        "Stopped after the {} tool loop timeout before the task finished.",
                        format_budget(self.config.loop_timeout())
                    ),
                );
            }
        }

        info!(
            steps_completed = state.steps_completed,
            tool_calls = state.records.len(),
            ?reason,
            "agent run finished"
        );
        self.emit(AgentEvent::Finished {
            reason,
            steps_completed: state.steps_completed,
        });

        Ok(AgentResult {
            text,
            reasoning: (!state.reasoning.is_empty()).then(|| state.reasoning.join("\n\n")),
            tool_calls: state.records,
            updated_tools: state.tools,
            updated_page_context: state.page_context,
            steps_completed: state.steps_completed,
        })
    }

    /// Releases the model session and aborts any in-flight model request.
    /// Safe to call more than once.
    pub fn dispose(&self) {
        let released = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            debug!(depth = self.config.depth, "disposing agent orchestrator");
            self.cancel.cancel();
            self.events.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn session(&self) -> Result<Arc<dyn ChatSession>, AgentError> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(AgentError::Disposed)
    }

    async fn send(
        &self,
        session: &Arc<dyn ChatSession>,
        message: ModelMessage,
        config: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, AgentError> {
        if cancel.is_cancelled() || self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        tokio::select! {
            response = session.send_message(message, config) => response.map_err(AgentError::Model),
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    fn model_config(&self, state: &RunState) -> ModelConfig {
        let tools = self.advertised_tools(&state.tools);
        self.deps
            .config_builder
            .build(state.page_context.as_ref(), &tools)
    }

    /// Context tools plus the locally handled planning and delegation tools.
    fn advertised_tools(&self, tools: &[ToolDefinition]) -> Vec<ToolDefinition> {
        let mut advertised = tools.to_vec();
        let mut builtin = plan_tool_definitions();
        if self.deps.delegation.is_some() {
            builtin.push(delegate_tool_definition());
        }
        if let Some(spawner) = &self.deps.subagents {
            let allowed = spawner
                .max_depth()
                .map_or(true, |max_depth| self.config.depth < max_depth);
            if allowed {
                builtin.push(subagent_tool_definition());
            }
        }
        for definition in builtin {
            if !advertised.iter().any(|tool| tool.name == definition.name) {
                advertised.push(definition);
            }
        }
        advertised
    }

    fn is_navigation(&self, name: &str, tools: &[ToolDefinition]) -> bool {
        self.config.navigation_tools.iter().any(|tool| tool == name)
            || tools.iter().any(|tool| {
                tool.name == name && tool.category.as_deref() == Some(NAVIGATION_CATEGORY)
            })
    }

    async fn execute_batch(
        &self,
        calls: Vec<ParsedFunctionCall>,
        state: &mut RunState,
        target: ToolTarget,
    ) -> Vec<ToolResponse> {
        let mut responses = Vec::with_capacity(calls.len());
        let mut pending = calls.into_iter();
        let routes = DelegationRoutes {
            tab_delegation: self.deps.delegation.is_some(),
            subagents: self.deps.subagents.is_some(),
        };

        while let Some(call) = pending.next() {
            let (call, result, touches_plan) = match AgentCall::classify_with(call, routes) {
                AgentCall::Plan(plan_call) => {
                    let (call, result) = self.handle_plan_call(plan_call);
                    (call, result, false)
                }
                AgentCall::Invalid { call, error } => {
                    warn!(tool = %call.name, call_id = %call.id, %error, "rejecting malformed call");
                    (call, ToolResult::failure(error), false)
                }
                AgentCall::Delegation(delegation) => {
                    let (call, result) = self.delegate(delegation, state, target).await;
                    (call, result, true)
                }
                AgentCall::Function(call) => {
                    let result = self.execute_tool(&call, target).await;
                    (call, result, true)
                }
            };

            if touches_plan {
                match result.error() {
                    None => self.deps.plans.mark_step_done(None),
                    Some(error) => self.deps.plans.mark_step_failed(Some(error)),
                }
            }

            let navigated = result.is_success() && self.is_navigation(&call.name, &state.tools);
            responses.push(ToolResponse {
                call_id: call.id.clone(),
                name: call.name.clone(),
                response: result.to_response(),
            });
            self.emit(AgentEvent::ToolResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                result: result.clone(),
            });
            state.records.push(ToolCallRecord {
                name: call.name.clone(),
                args: call.args.clone(),
                call_id: call.id.clone(),
                result,
            });

            if navigated {
                let before = responses.len();
                responses.extend(pending.by_ref().map(|skipped| skipped_response(&skipped)));
                let skipped = responses.len() - before;
                info!(tool = %call.name, skipped, "page navigated; truncating batch");
                self.emit(AgentEvent::Navigation {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    skipped,
                });
                self.rescan(state, target.tab_id).await;
                break;
            }
        }

        responses
    }

    async fn execute_tool(&self, call: &ParsedFunctionCall, target: ToolTarget) -> ToolResult {
        self.emit(AgentEvent::ToolCall {
            call_id: call.id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
        });
        debug!(tool = %call.name, call_id = %call.id, tab = %target.tab_id, "dispatching tool call");
        match self.deps.tools.execute(&call.name, &call.args, target).await {
            Ok(result) => {
                if let Some(error) = result.error() {
                    warn!(tool = %call.name, call_id = %call.id, error, "tool reported failure");
                }
                result
            }
            Err(err) => {
                warn!(tool = %call.name, call_id = %call.id, error = %err, "tool execution failed");
                ToolResult::failure(err.to_string())
            }
        }
    }

    fn handle_plan_call(&self, plan_call: PlanToolCall) -> (ParsedFunctionCall, ToolResult) {
        let PlanToolCall {
            call,
            kind,
            goal,
            steps,
        } = plan_call;
        let plan = self
            .deps
            .plans
            .apply_plan_tool(kind, &goal, steps, &call.id);
        let verb = match kind {
            PlanToolKind::Create => "created",
            PlanToolKind::Update => "updated",
        };
        self.emit(AgentEvent::PlanTool {
            call_id: call.id.clone(),
            goal: plan.goal.clone(),
            step_count: plan.steps.len(),
        });
        let result = ToolResult::success(json!({
            "message": format!("Plan \"{}\" {}", plan.goal, verb),
            "steps": plan.steps.len(),
        }));
        (call, result)
    }

    async fn delegate(
        &self,
        delegation: DelegationToolCall,
        state: &RunState,
        target: ToolTarget,
    ) -> (ParsedFunctionCall, ToolResult) {
        match delegation {
            DelegationToolCall::DelegateToTab {
                call,
                required_skills,
                task,
            } => {
                let Some(port) = &self.deps.delegation else {
                    let result = self.execute_tool(&call, target).await;
                    return (call, result);
                };
                self.emit(AgentEvent::ToolCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                });
                info!(skills = ?required_skills, "delegating task to another tab");
                let request = TabDelegationRequest {
                    required_skills,
                    task,
                    origin_tab_id: target.origin_tab_id,
                };
                let result = match port.delegate(request).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(call_id = %call.id, error = %err, "tab delegation failed");
                        ToolResult::failure(err.to_string())
                    }
                };
                (call, result)
            }
            DelegationToolCall::SpawnSubagent {
                call,
                task,
                timeout,
            } => {
                let Some(spawner) = &self.deps.subagents else {
                    let result = self.execute_tool(&call, target).await;
                    return (call, result);
                };
                self.emit(AgentEvent::ToolCall {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                });
                let mut subtask = SubagentTask::new(task)
                    .with_depth(self.config.depth)
                    .with_context(child_context(target.tab_id, state));
                if let Some(timeout) = timeout {
                    subtask = subtask.with_timeout(timeout);
                }
                let outcome = spawner.spawn(subtask).await;
                let result = if outcome.success {
                    ToolResult::success(json!({
                        "subagentId": outcome.subagent_id,
                        "text": outcome.text,
                        "stepsCompleted": outcome.steps_completed,
                    }))
                } else {
                    ToolResult::failure(
                        outcome
                            .error
                            .unwrap_or_else(|| "subagent failed".to_string()),
                    )
                };
                (call, result)
            }
        }
    }

    async fn rescan(&self, state: &mut RunState, tab_id: TabId) {
        let Some(rescanner) = &self.deps.rescanner else {
            return;
        };
        tokio::time::sleep(self.config.navigation_settle()).await;
        match rescanner.rescan(tab_id, &state.tools).await {
            Ok(outcome) => {
                debug!(tab = %tab_id, tools = outcome.tools.len(), "rescanned page after navigation");
                state.tools = outcome.tools;
                state.page_context = outcome.page_context;
            }
            Err(err) => {
                warn!(tab = %tab_id, error = %err, "rescan after navigation failed; keeping previous tools");
            }
        }
    }

    fn emit(&self, event: AgentEvent) {
        self.events.emit(event.event_type(), &event);
    }
}

impl Drop for AgentOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// First turn of a run. Prior conversation leads as one part per message,
/// followed by the prompt and any mentioned tabs or live state.
fn initial_message(prompt: &str, context: &AgentContext) -> ModelMessage {
    if context.conversation_history.is_empty()
        && context.mention_contexts.is_empty()
        && context.live_state.is_none()
    {
        return ModelMessage::Text(prompt.to_string());
    }

    let mut parts: Vec<ContentPart> = context
        .conversation_history
        .iter()
        .map(|message| ContentPart::Text {
            text: format!("[{}] {}", message.role, message.text),
        })
        .collect();
    parts.push(ContentPart::Text {
        text: prompt.to_string(),
    });
    for mention in &context.mention_contexts {
        let page = mention
            .page_context
            .as_ref()
            .and_then(|page| serde_json::to_string(page).ok())
            .unwrap_or_else(|| "{}".to_string());
        parts.push(ContentPart::Text {
            text: format!("Context from tab {}: {}", mention.target_id, page),
        });
    }
    if let Some(live_state) = &context.live_state {
        parts.push(ContentPart::Text {
            text: format!("Live state: {}", live_state),
        });
    }
    ModelMessage::Parts(parts)
}

fn child_context(tab_id: TabId, state: &RunState) -> AgentContext {
    AgentContext {
        tab_id,
        page_context: state.page_context.clone(),
        tools: state.tools.clone(),
        ..AgentContext::default()
    }
}

fn skipped_response(call: &ParsedFunctionCall) -> ToolResponse {
    ToolResponse {
        call_id: call.id.clone(),
        name: call.name.clone(),
        response: json!({
            "success": false,
            "skipped": true,
            "error": SKIPPED_AFTER_NAVIGATION,
        }),
    }
}

fn format_budget(budget: Duration) -> String {
    let millis = budget.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

fn append_note(text: &mut String, note: &str) {
    if !text.is_empty() {
        text.push_str("\n\n");
    }
    text.push_str(note);
}
