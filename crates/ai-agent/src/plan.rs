//! Plan state transitions. The canonical plan lives in a [`PlanStore`]; the
//! [`PlanCoordinator`] only forwards mutations and re-reads the store after
//! each one so observers never see a stale copy.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event_bus::{EventBus, Subscription};

const PLAN_CHANGED: &str = "plan_changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl PlanStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PlanStepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub status: PlanStepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PlanStep {
    pub fn pending(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: PlanStepStatus::Pending,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn current_step(&self) -> Option<&PlanStep> {
        self.steps
            .iter()
            .find(|step| step.status == PlanStepStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanToolKind {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanInput {
    pub goal: String,
    pub steps: Vec<PlanStep>,
}

/// Externally-owned plan state.
pub trait PlanStore: Send + Sync {
    fn handle_plan_tool(&self, kind: PlanToolKind, input: &PlanInput, request_id: &str);
    fn advance_step(&self);
    fn mark_step_done(&self, detail: Option<&str>);
    fn mark_step_failed(&self, detail: Option<&str>);
    fn active_plan(&self) -> Option<Plan>;
}

/// Simple store kept in process memory.
///
/// Create and update replace the plan wholesale. `advance_step` promotes the
/// first pending step to in-progress when nothing is in progress, and the
/// mark operations finish the in-progress step.
#[derive(Debug, Default)]
pub struct InMemoryPlanStore {
    plan: Mutex<Option<Plan>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_plan(&self, mutate: impl FnOnce(&mut Plan)) {
        let mut guard = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(plan) = guard.as_mut() {
            mutate(plan);
        }
    }

    fn finish_current(&self, status: PlanStepStatus, detail: Option<&str>) {
        self.with_plan(|plan| {
            if let Some(step) = plan
                .steps
                .iter_mut()
                .find(|step| step.status == PlanStepStatus::InProgress)
            {
                step.status = status;
                if let Some(detail) = detail {
                    step.detail = Some(detail.to_string());
                }
            }
        });
    }
}

impl PlanStore for InMemoryPlanStore {
    fn handle_plan_tool(&self, kind: PlanToolKind, input: &PlanInput, request_id: &str) {
        debug!(?kind, request_id, goal = %input.goal, "replacing plan");
        let mut guard = self.plan.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Plan {
            goal: input.goal.clone(),
            steps: input.steps.clone(),
        });
    }

    fn advance_step(&self) {
        self.with_plan(|plan| {
            if plan.current_step().is_some() {
                return;
            }
            if let Some(step) = plan
                .steps
                .iter_mut()
                .find(|step| step.status == PlanStepStatus::Pending)
            {
                step.status = PlanStepStatus::InProgress;
            }
        });
    }

    fn mark_step_done(&self, detail: Option<&str>) {
        self.finish_current(PlanStepStatus::Done, detail);
    }

    fn mark_step_failed(&self, detail: Option<&str>) {
        self.finish_current(PlanStepStatus::Failed, detail);
    }

    fn active_plan(&self) -> Option<Plan> {
        self.plan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct PlanCoordinator {
    store: Arc<dyn PlanStore>,
    events: EventBus<Option<Plan>>,
}

impl PlanCoordinator {
    pub fn new(store: Arc<dyn PlanStore>) -> Self {
        Self {
            store,
            events: EventBus::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryPlanStore::new()))
    }

    pub fn create_plan(&self, goal: &str, steps: Vec<PlanStep>) -> Plan {
        self.apply_plan_tool(PlanToolKind::Create, goal, steps, "")
    }

    pub fn update_plan(&self, goal: &str, steps: Vec<PlanStep>) -> Plan {
        self.apply_plan_tool(PlanToolKind::Update, goal, steps, "")
    }

    /// Forwards a plan tool call, tagging the store request with the id of
    /// the function call that asked for it.
    pub fn apply_plan_tool(
        &self,
        kind: PlanToolKind,
        goal: &str,
        steps: Vec<PlanStep>,
        request_id: &str,
    ) -> Plan {
        let input = PlanInput {
            goal: goal.to_string(),
            steps,
        };
        self.store.handle_plan_tool(kind, &input, request_id);
        let plan = self.broadcast();
        plan.unwrap_or(Plan {
            goal: input.goal,
            steps: input.steps,
        })
    }

    pub fn current_plan(&self) -> Option<Plan> {
        self.store.active_plan()
    }

    pub fn advance_step(&self) {
        self.store.advance_step();
        self.broadcast();
    }

    pub fn mark_step_done(&self, detail: Option<&str>) {
        self.store.mark_step_done(detail);
        self.broadcast();
    }

    pub fn mark_step_failed(&self, detail: Option<&str>) {
        self.store.mark_step_failed(detail);
        self.broadcast();
    }

    pub fn on_plan_changed<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&Plan>) + Send + Sync + 'static,
    {
        self.events
            .on(PLAN_CHANGED, move |plan: &Option<Plan>| listener(plan.as_ref()))
    }

    fn broadcast(&self) -> Option<Plan> {
        let plan = self.store.active_plan();
        self.events.emit(PLAN_CHANGED, &plan);
        plan
    }
}
