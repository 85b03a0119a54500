//! Resolves loosely-typed model function calls into a closed set of variants
//! so the orchestrator loop never re-inspects tool names.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::plan::{PlanStep, PlanToolKind};
use crate::tools::{CREATE_PLAN_TOOL, DELEGATE_TO_TAB_TOOL, SPAWN_SUBAGENT_TOOL, UPDATE_PLAN_TOOL};
use crate::types::ParsedFunctionCall;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    /// Anything dispatched to the tool-execution collaborator.
    Function(ParsedFunctionCall),
    Plan(PlanToolCall),
    Delegation(DelegationToolCall),
    /// A plan or delegation call whose arguments could not be understood.
    Invalid {
        call: ParsedFunctionCall,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanToolCall {
    pub call: ParsedFunctionCall,
    pub kind: PlanToolKind,
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DelegationToolCall {
    DelegateToTab {
        call: ParsedFunctionCall,
        required_skills: Vec<String>,
        task: String,
    },
    SpawnSubagent {
        call: ParsedFunctionCall,
        task: String,
        timeout: Option<Duration>,
    },
}

impl DelegationToolCall {
    pub fn call(&self) -> &ParsedFunctionCall {
        match self {
            Self::DelegateToTab { call, .. } | Self::SpawnSubagent { call, .. } => call,
        }
    }
}

/// Delegation tools the agent handles itself. A tool whose route is off is
/// an ordinary function call for the tool executor, arguments untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationRoutes {
    pub tab_delegation: bool,
    pub subagents: bool,
}

impl DelegationRoutes {
    pub const ALL: Self = Self {
        tab_delegation: true,
        subagents: true,
    };
    pub const NONE: Self = Self {
        tab_delegation: false,
        subagents: false,
    };
}

impl AgentCall {
    pub fn classify(call: ParsedFunctionCall) -> Self {
        Self::classify_with(call, DelegationRoutes::ALL)
    }

    pub fn classify_with(call: ParsedFunctionCall, routes: DelegationRoutes) -> Self {
        let parsed = match call.name.as_str() {
            CREATE_PLAN_TOOL => Some(parse_plan(&call, PlanToolKind::Create)),
            UPDATE_PLAN_TOOL => Some(parse_plan(&call, PlanToolKind::Update)),
            DELEGATE_TO_TAB_TOOL if routes.tab_delegation => Some(parse_delegate(&call)),
            SPAWN_SUBAGENT_TOOL if routes.subagents => Some(parse_spawn(&call)),
            _ => None,
        };
        match parsed {
            None => AgentCall::Function(call),
            Some(Ok(resolved)) => resolved,
            Some(Err(error)) => AgentCall::Invalid { call, error },
        }
    }

    pub fn call(&self) -> &ParsedFunctionCall {
        match self {
            Self::Function(call) | Self::Invalid { call, .. } => call,
            Self::Plan(plan) => &plan.call,
            Self::Delegation(delegation) => delegation.call(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StepArg {
    Title(String),
    Detailed {
        title: String,
        #[serde(default)]
        detail: Option<String>,
    },
}

#[derive(Deserialize)]
struct PlanArgs {
    goal: String,
    #[serde(default)]
    steps: Vec<StepArg>,
}

#[derive(Deserialize)]
struct DelegateArgs {
    #[serde(default)]
    required_skills: Vec<String>,
    task: String,
}

#[derive(Deserialize)]
struct SpawnArgs {
    #[serde(alias = "prompt")]
    task: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

fn decode<T: DeserializeOwned>(call: &ParsedFunctionCall) -> Result<T, String> {
    serde_json::from_value(Value::Object(call.args.clone()))
        .map_err(|err| format!("invalid arguments for {}: {}", call.name, err))
}

fn parse_plan(call: &ParsedFunctionCall, kind: PlanToolKind) -> Result<AgentCall, String> {
    let args: PlanArgs = decode(call)?;
    let steps = args
        .steps
        .into_iter()
        .enumerate()
        .map(|(idx, step)| {
            let mut plan_step = match step {
                StepArg::Title(title) => PlanStep::pending(format!("step-{}", idx + 1), title),
                StepArg::Detailed { title, detail } => {
                    let mut step = PlanStep::pending(format!("step-{}", idx + 1), title);
                    step.detail = detail;
                    step
                }
            };
            plan_step.title = plan_step.title.trim().to_string();
            plan_step
        })
        .collect();
    Ok(AgentCall::Plan(PlanToolCall {
        call: call.clone(),
        kind,
        goal: args.goal,
        steps,
    }))
}

fn parse_delegate(call: &ParsedFunctionCall) -> Result<AgentCall, String> {
    let args: DelegateArgs = decode(call)?;
    Ok(AgentCall::Delegation(DelegationToolCall::DelegateToTab {
        call: call.clone(),
        required_skills: args.required_skills,
        task: args.task,
    }))
}

fn parse_spawn(call: &ParsedFunctionCall) -> Result<AgentCall, String> {
    let args: SpawnArgs = decode(call)?;
    if args.task.trim().is_empty() {
        return Err(format!("{} requires a non-empty task", call.name));
    }
    Ok(AgentCall::Delegation(DelegationToolCall::SpawnSubagent {
        call: call.clone(),
        task: args.task,
        timeout: args.timeout_ms.map(Duration::from_millis),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStepStatus;
    use serde_json::json;

    #[test]
    fn plan_calls_accept_titles_and_objects() {
        let call = ParsedFunctionCall::new(
            "c1",
            CREATE_PLAN_TOOL,
            json!({
                "goal": "Book a table",
                "steps": ["Open site", { "title": "Pick time", "detail": "7pm" }]
            }),
        );
        let AgentCall::Plan(plan) = AgentCall::classify(call) else {
            panic!("expected plan call");
        };
        assert_eq!(plan.kind, PlanToolKind::Create);
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].id, "step-2");
        assert_eq!(plan.steps[1].detail.as_deref(), Some("7pm"));
        assert!(plan
            .steps
            .iter()
            .all(|step| step.status == PlanStepStatus::Pending));
    }

    #[test]
    fn delegation_calls_are_typed() {
        let call = ParsedFunctionCall::new(
            "c2",
            DELEGATE_TO_TAB_TOOL,
            json!({ "required_skills": ["email", "compose"], "task": "Send email to x" }),
        );
        match AgentCall::classify(call) {
            AgentCall::Delegation(DelegationToolCall::DelegateToTab {
                required_skills,
                task,
                ..
            }) => {
                assert_eq!(required_skills, vec!["email", "compose"]);
                assert_eq!(task, "Send email to x");
            }
            other => panic!("unexpected classification: {other:?}"),
        }

        let spawn = ParsedFunctionCall::new(
            "c3",
            SPAWN_SUBAGENT_TOOL,
            json!({ "prompt": "Summarize tab", "timeout_ms": 1500 }),
        );
        match AgentCall::classify(spawn) {
            AgentCall::Delegation(DelegationToolCall::SpawnSubagent { task, timeout, .. }) => {
                assert_eq!(task, "Summarize tab");
                assert_eq!(timeout, Some(Duration::from_millis(1500)));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn malformed_arguments_are_invalid() {
        let call = ParsedFunctionCall::new("c4", UPDATE_PLAN_TOOL, json!({ "steps": [] }));
        let classified = AgentCall::classify(call);
        assert!(matches!(classified, AgentCall::Invalid { .. }));
        assert_eq!(classified.call().id, "c4");
    }

    #[test]
    fn unrouted_delegation_calls_pass_through() {
        let malformed = ParsedFunctionCall::new("c6", DELEGATE_TO_TAB_TOOL, json!({ "skills": "email" }));
        let classified = AgentCall::classify_with(malformed.clone(), DelegationRoutes::NONE);
        assert_eq!(classified, AgentCall::Function(malformed));

        let spawn = ParsedFunctionCall::new("c7", SPAWN_SUBAGENT_TOOL, json!({ "task": "" }));
        let routes = DelegationRoutes {
            tab_delegation: true,
            subagents: false,
        };
        assert!(matches!(
            AgentCall::classify_with(spawn, routes),
            AgentCall::Function(_)
        ));
    }

    #[test]
    fn other_names_are_plain_functions() {
        let call = ParsedFunctionCall::new("c5", "click", json!({ "selector": "#go" }));
        assert!(matches!(AgentCall::classify(call), AgentCall::Function(_)));
    }
}
