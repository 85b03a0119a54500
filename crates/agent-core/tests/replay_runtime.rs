use std::sync::Arc;

use agent_core::{AgentRuntime, RuntimeConfig, SubagentConfig, Transcript};
use ai_agent::{AgentConfig, AgentContext, PlanStepStatus, ToolResult};
use async_trait::async_trait;
use serde_json::json;

fn transcript(value: serde_json::Value) -> Transcript {
    serde_json::from_value(value).expect("transcript fixture should parse")
}

#[tokio::test]
async fn replays_navigation_batch_with_plan() {
    let transcript = transcript(json!({
        "prompt": "Find the pricing page",
        "context": { "tabId": 7, "pageContext": { "url": "https://example.com", "title": "Home" } },
        "turns": [
            { "functionCalls": [
                { "id": "p1", "name": "create_plan", "args": { "goal": "Pricing", "steps": ["Open pricing", "Read plans"] } }
            ] },
            { "functionCalls": [
                { "id": "c1", "name": "navigate", "args": { "url": "https://example.com/pricing" } },
                { "id": "c2", "name": "click", "args": { "selector": "#monthly" } }
            ] },
            { "functionCalls": [
                { "id": "c3", "name": "read_page", "args": {} }
            ] },
            { "text": "The pro plan is $20/month" }
        ],
        "toolOutcomes": {
            "read_page": [{ "success": true, "data": { "text": "Pro $20" } }]
        }
    }));
    let context = transcript.context.clone();
    let (sessions, tools) = transcript.into_collaborators();
    let config = RuntimeConfig {
        agent: AgentConfig {
            navigation_settle_ms: 0,
            ..AgentConfig::default()
        },
        subagents: SubagentConfig::default(),
    };
    let runtime = AgentRuntime::builder(sessions.clone(), tools)
        .with_config(config)
        .build()
        .expect("runtime should build");

    let result = runtime
        .run("Find the pricing page", context)
        .await
        .expect("replay should succeed");

    assert_eq!(result.text, "The pro plan is $20/month");
    assert_eq!(result.steps_completed, 3);
    let names: Vec<_> = result.tool_calls.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["create_plan", "navigate", "read_page"]);
    assert_eq!(sessions.remaining_turns().await, 0);

    let plan = runtime.plans().current_plan().expect("plan should exist");
    assert_eq!(plan.steps[0].status, PlanStepStatus::Done);
    assert_eq!(plan.steps[1].status, PlanStepStatus::Done);
}

#[tokio::test]
async fn failed_tool_is_reported_without_failing_run() {
    let transcript = transcript(json!({
        "turns": [
            { "functionCalls": [{ "id": "c1", "name": "click", "args": { "selector": "#gone" } }] },
            { "text": "The button is gone" }
        ],
        "toolOutcomes": {
            "click": [{ "success": false, "error": "element not found" }]
        }
    }));
    let (sessions, tools) = transcript.into_collaborators();
    let runtime = AgentRuntime::builder(sessions, tools).build().unwrap();

    let result = runtime
        .run("Click the button", AgentContext::new(1))
        .await
        .unwrap();

    assert_eq!(result.tool_calls.len(), 1);
    assert_eq!(
        result.tool_calls[0].result,
        ToolResult::failure("element not found")
    );
    assert_eq!(result.text, "The button is gone");
}

struct SkillDelegation;

#[async_trait]
impl ai_agent::TabDelegation for SkillDelegation {
    async fn delegate(
        &self,
        request: ai_agent::TabDelegationRequest,
    ) -> anyhow::Result<ToolResult> {
        if request.required_skills.iter().any(|skill| skill == "email") {
            Ok(ToolResult::success(json!({ "targetTabId": 12 })))
        } else {
            Ok(ToolResult::failure("no matching tab"))
        }
    }
}

#[tokio::test]
async fn delegates_email_task_to_another_tab() {
    let transcript = transcript(json!({
        "turns": [
            { "functionCalls": [{
                "id": "d1",
                "name": "delegate_to_tab",
                "args": { "required_skills": ["email", "compose"], "task": "Send email to x" }
            }] },
            { "text": "Email delegation completed successfully" }
        ]
    }));
    let (sessions, tools) = transcript.into_collaborators();
    let runtime = AgentRuntime::builder(sessions, tools)
        .with_delegation(Arc::new(SkillDelegation))
        .build()
        .unwrap();

    let result = runtime
        .run("Email x about the meeting", AgentContext::new(3))
        .await
        .unwrap();

    assert_eq!(result.text, "Email delegation completed successfully");
    assert!(result.tool_calls[0].result.is_success());
}

#[tokio::test]
async fn exhausted_transcript_surfaces_model_error() {
    let transcript = transcript(json!({
        "turns": [
            { "functionCalls": [{ "id": "c1", "name": "scroll", "args": {} }] }
        ]
    }));
    let (sessions, tools) = transcript.into_collaborators();
    let runtime = AgentRuntime::builder(sessions, tools).build().unwrap();

    let err = runtime
        .run("Scroll", AgentContext::new(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no more model turns"));
}
