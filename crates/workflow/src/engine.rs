use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bizflow_agent::Outbox;
use bizflow_core::{
    ActionKind, Error, Message, OutgoingMessage, Priority, Result, RunTrigger, Step, StepStatus,
    Trigger, Workflow, WorkflowConfig, WorkflowRun, WorkflowStatus,
};
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::action::{ActionContext, ActionHandler, ActionRegistry, CommunicationHandler, FunctionHandler};
use crate::condition::{ConditionEvaluator, VariableConditionEvaluator};
use crate::graph;
use crate::triggers;

pub(crate) struct EngineInner {
    workflows: RwLock<HashMap<String, Workflow>>,
    schedules: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    history: Mutex<VecDeque<WorkflowRun>>,
    /// Woken on resume and stop so paused executors re-check status.
    resumed: Notify,
    actions: ActionRegistry,
    evaluator: Arc<dyn ConditionEvaluator>,
    outbox: Outbox,
    config: WorkflowConfig,
}

/// Stores workflows, arms their triggers and executes their step graphs.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) inner: Arc<EngineInner>,
}

pub struct WorkflowEngineBuilder {
    outbox: Outbox,
    config: WorkflowConfig,
    actions: ActionRegistry,
    functions: FunctionHandler,
    evaluator: Arc<dyn ConditionEvaluator>,
}

impl WorkflowEngineBuilder {
    /// Register a named async function for `Function` actions.
    pub fn function<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Value, HashMap<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.functions.register(name, f);
        self
    }

    /// Install a handler for an action kind, replacing any default.
    pub fn handler(mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) -> Self {
        self.actions.register(kind, handler);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let mut actions = self.actions;
        if !actions.has_handler(ActionKind::Function) {
            actions.register(ActionKind::Function, Arc::new(self.functions));
        }
        WorkflowEngine {
            inner: Arc::new(EngineInner {
                workflows: RwLock::new(HashMap::new()),
                schedules: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                resumed: Notify::new(),
                actions,
                evaluator: self.evaluator,
                outbox: self.outbox,
                config: self.config,
            }),
        }
    }
}

impl WorkflowEngine {
    /// Engine with the default action handlers: communications for `Email`
    /// and `Notification`, an empty function registry for `Function`.
    pub fn new(outbox: Outbox, config: WorkflowConfig) -> Self {
        Self::builder(outbox, config).build()
    }

    pub fn builder(outbox: Outbox, config: WorkflowConfig) -> WorkflowEngineBuilder {
        let communications: Arc<dyn ActionHandler> =
            Arc::new(CommunicationHandler::new(outbox.clone(), &config.communications_agent));
        let mut actions = ActionRegistry::new();
        actions.register(ActionKind::Email, communications.clone());
        actions.register(ActionKind::Notification, communications);
        WorkflowEngineBuilder {
            outbox,
            config,
            actions,
            functions: FunctionHandler::new(),
            evaluator: Arc::new(VariableConditionEvaluator),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    pub async fn create_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        if workflow.id.trim().is_empty() {
            workflow.id = uuid::Uuid::new_v4().to_string();
        }
        if self.inner.config.validate_on_create {
            graph::validate(&workflow)?;
        }

        let now = Utc::now();
        workflow.status = idle_status(&workflow);
        workflow.created_at = now;
        workflow.updated_at = now;
        workflow.started_at = None;
        workflow.completed_at = None;
        workflow.error = None;
        workflow.run_id = None;
        workflow.steps.iter_mut().for_each(|s| s.reset());

        {
            let mut workflows = self.inner.workflows.write().await;
            if workflows.contains_key(&workflow.id) {
                return Err(Error::InvalidWorkflow(format!(
                    "{}: a workflow with this id already exists",
                    workflow.id
                )));
            }
            workflows.insert(workflow.id.clone(), workflow.clone());
        }
        self.arm_triggers(&workflow).await;

        info!(workflow_id = %workflow.id, name = %workflow.name, steps = workflow.steps.len(), "Workflow created");
        Ok(workflow)
    }

    /// Replace a stored workflow. Rejected while it is running or paused.
    pub async fn update_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        if self.inner.config.validate_on_create {
            graph::validate(&workflow)?;
        }

        {
            let mut workflows = self.inner.workflows.write().await;
            let existing = workflows
                .get(&workflow.id)
                .ok_or_else(|| Error::WorkflowNotFound(workflow.id.clone()))?;
            if existing.status.is_in_flight() {
                return Err(Error::AlreadyRunning(workflow.id.clone()));
            }
            workflow.version = existing.version + 1;
            workflow.created_at = existing.created_at;
            workflow.updated_at = Utc::now();
            workflow.status = idle_status(&workflow);
            workflow.started_at = None;
            workflow.completed_at = None;
            workflow.error = None;
            workflow.run_id = None;
            workflow.steps.iter_mut().for_each(|s| s.reset());
            workflows.insert(workflow.id.clone(), workflow.clone());
        }
        self.disarm_triggers(&workflow.id).await;
        self.arm_triggers(&workflow).await;

        info!(workflow_id = %workflow.id, version = workflow.version, "Workflow updated");
        Ok(workflow)
    }

    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        self.inner
            .workflows
            .write()
            .await
            .remove(workflow_id)
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
        self.disarm_triggers(workflow_id).await;
        self.inner.resumed.notify_waiters();
        info!(workflow_id = %workflow_id, "Workflow deleted");
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        self.inner.workflows.read().await.get(workflow_id).cloned()
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let mut workflows: Vec<Workflow> = self.inner.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        workflows
    }

    /// Begin a manual run and execute it in the background. Returns the run
    /// id once the workflow is `Running`.
    pub async fn start_workflow(&self, workflow_id: &str, variables: HashMap<String, Value>) -> Result<String> {
        self.start_with_trigger(workflow_id, variables, RunTrigger::Manual).await
    }

    pub(crate) async fn start_with_trigger(
        &self,
        workflow_id: &str,
        variables: HashMap<String, Value>,
        trigger: RunTrigger,
    ) -> Result<String> {
        let run_id = self.begin(workflow_id, variables, trigger).await?;
        let engine = self.clone();
        let workflow_id = workflow_id.to_string();
        let spawned_run_id = run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(&workflow_id, &spawned_run_id).await {
                error!(workflow_id = %workflow_id, error = %e, "Workflow run failed");
            }
        });
        Ok(run_id)
    }

    /// Begin a manual run and drive it to the end on the caller's task.
    ///
    /// Returns the final status; a step failure yields `Ok(Failed)`, a
    /// dependency deadlock yields `Err(Error::Deadlock)` (the workflow is
    /// left `Failed` in both cases).
    pub async fn run_workflow(&self, workflow_id: &str, variables: HashMap<String, Value>) -> Result<WorkflowStatus> {
        let run_id = self.begin(workflow_id, variables, RunTrigger::Manual).await?;
        self.run(workflow_id, &run_id).await
    }

    /// Mark a running or paused workflow `Terminated`. Steps already
    /// dispatched finish; no further wave starts.
    pub async fn stop_workflow(&self, workflow_id: &str) -> Result<()> {
        {
            let mut workflows = self.inner.workflows.write().await;
            let workflow = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
            if !workflow.status.is_in_flight() {
                return Err(Error::NotRunning(workflow_id.to_string()));
            }
            workflow.status = WorkflowStatus::Terminated;
            workflow.completed_at = Some(Utc::now());
        }
        self.inner.resumed.notify_waiters();
        info!(workflow_id = %workflow_id, "Workflow stopped");
        Ok(())
    }

    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<()> {
        self.transition(workflow_id, WorkflowStatus::Running, WorkflowStatus::Paused)
            .await?;
        info!(workflow_id = %workflow_id, "Workflow paused");
        Ok(())
    }

    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<()> {
        self.transition(workflow_id, WorkflowStatus::Paused, WorkflowStatus::Running)
            .await?;
        self.inner.resumed.notify_waiters();
        info!(workflow_id = %workflow_id, "Workflow resumed");
        Ok(())
    }

    /// Start every workflow whose `Event` trigger matches `event_type`, or
    /// whose `Condition` trigger holds over the event variables. Returns the
    /// ids of the workflows started.
    pub async fn handle_event(&self, event_type: &str, variables: HashMap<String, Value>) -> Vec<String> {
        let candidates: Vec<(String, HashMap<String, Value>, Vec<Trigger>)> = self
            .inner
            .workflows
            .read()
            .await
            .values()
            .map(|w| (w.id.clone(), w.variable_values(), w.triggers.clone()))
            .collect();

        let mut started = Vec::new();
        for (workflow_id, mut scope, triggers) in candidates {
            scope.extend(variables.clone());
            let fires = triggers.iter().any(|t| match t {
                Trigger::Event { event } => event == event_type,
                Trigger::Condition { condition } => self.inner.evaluator.evaluate(condition, &scope),
                _ => false,
            });
            if !fires {
                continue;
            }

            let trigger = RunTrigger::Event {
                event_type: event_type.to_string(),
            };
            match self.start_with_trigger(&workflow_id, variables.clone(), trigger).await {
                Ok(_) => started.push(workflow_id),
                Err(Error::AlreadyRunning(_)) => {
                    debug!(workflow_id = %workflow_id, event_type = %event_type, "Event ignored, workflow already running")
                }
                Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Event trigger failed to start workflow"),
            }
        }
        started
    }

    /// Past and in-progress runs, oldest first.
    pub async fn run_history(&self, workflow_id: Option<&str>) -> Vec<WorkflowRun> {
        self.inner
            .history
            .lock()
            .await
            .iter()
            .filter(|r| workflow_id.map_or(true, |id| r.workflow_id == id))
            .cloned()
            .collect()
    }

    pub async fn armed_schedules(&self, workflow_id: &str) -> usize {
        self.inner
            .schedules
            .lock()
            .await
            .get(workflow_id)
            .map_or(0, |handles| handles.len())
    }

    /// Arm the schedule triggers of every stored workflow that has none
    /// armed, e.g. after [`WorkflowEngine::shutdown`]. Returns the number of
    /// timers armed.
    pub async fn rearm_triggers(&self) -> usize {
        let mut armed = 0;
        for workflow in self.list_workflows().await {
            if self.armed_schedules(&workflow.id).await > 0 {
                continue;
            }
            self.arm_triggers(&workflow).await;
            armed += self.armed_schedules(&workflow.id).await;
        }
        armed
    }

    /// Disarm every schedule trigger. Stored workflows are kept.
    pub async fn shutdown(&self) {
        let mut schedules = self.inner.schedules.lock().await;
        let count: usize = schedules.values().map(|h| h.len()).sum();
        for handle in schedules.drain().flat_map(|(_, handles)| handles) {
            handle.abort();
        }
        info!(schedules = count, "Workflow engine shut down");
    }

    async fn arm_triggers(&self, workflow: &Workflow) {
        let handles = triggers::arm_schedules(self, workflow);
        if !handles.is_empty() {
            debug!(workflow_id = %workflow.id, count = handles.len(), "Schedule triggers armed");
            self.inner
                .schedules
                .lock()
                .await
                .insert(workflow.id.clone(), handles);
        }
    }

    async fn disarm_triggers(&self, workflow_id: &str) {
        if let Some(handles) = self.inner.schedules.lock().await.remove(workflow_id) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    async fn transition(&self, workflow_id: &str, from: WorkflowStatus, to: WorkflowStatus) -> Result<()> {
        let mut workflows = self.inner.workflows.write().await;
        let workflow = workflows
            .get_mut(workflow_id)
            .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
        if workflow.status != from {
            return Err(Error::NotRunning(format!("{} (status {})", workflow_id, workflow.status)));
        }
        workflow.status = to;
        Ok(())
    }

    /// Move the workflow to `Running`, merge the run variables into it and
    /// record the run. The new run takes ownership of execution from any
    /// executor still winding down after a stop.
    async fn begin(&self, workflow_id: &str, variables: HashMap<String, Value>, trigger: RunTrigger) -> Result<String> {
        let now = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        {
            let mut workflows = self.inner.workflows.write().await;
            let workflow = workflows
                .get_mut(workflow_id)
                .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
            if workflow.status.is_in_flight() {
                return Err(Error::AlreadyRunning(workflow_id.to_string()));
            }
            for (name, value) in variables {
                workflow.set_variable(&name, value);
            }
            workflow.steps.iter_mut().for_each(|s| s.reset());
            workflow.status = WorkflowStatus::Running;
            workflow.started_at = Some(now);
            workflow.completed_at = None;
            workflow.error = None;
            workflow.run_id = Some(run_id.clone());
        }

        let mut history = self.inner.history.lock().await;
        history.push_back(WorkflowRun {
            run_id: run_id.clone(),
            workflow_id: workflow_id.to_string(),
            trigger,
            started_at: now,
            completed_at: None,
            status: WorkflowStatus::Running,
            error: None,
        });
        while history.len() > self.inner.config.history_limit.max(1) {
            history.pop_front();
        }

        info!(workflow_id = %workflow_id, run_id = %run_id, "Workflow started");
        Ok(run_id)
    }

    async fn run(&self, workflow_id: &str, run_id: &str) -> Result<WorkflowStatus> {
        let outcome = self.execute_workflow_steps(workflow_id, run_id).await;
        let (mut status, mut error) = match &outcome {
            Ok(WorkflowStatus::Failed) => (WorkflowStatus::Failed, self.first_step_error(workflow_id).await),
            Ok(status) => (*status, None),
            Err(e) => (WorkflowStatus::Failed, Some(e.to_string())),
        };

        {
            let mut workflows = self.inner.workflows.write().await;
            match workflows.get_mut(workflow_id) {
                Some(workflow) if owns_run(workflow, run_id) => {
                    if workflow.status == WorkflowStatus::Terminated {
                        status = WorkflowStatus::Terminated;
                        error = None;
                    } else {
                        workflow.status = status;
                        workflow.completed_at = Some(Utc::now());
                        workflow.error = error.clone();
                    }
                }
                // Deleted, or superseded by a newer run after a stop.
                _ => {
                    status = WorkflowStatus::Terminated;
                    error = None;
                }
            }
        }

        if let Some(run) = self
            .inner
            .history
            .lock()
            .await
            .iter_mut()
            .rev()
            .find(|r| r.run_id == run_id)
        {
            run.status = status;
            run.completed_at = Some(Utc::now());
            run.error = error.clone();
        }

        match status {
            WorkflowStatus::Completed => info!(workflow_id = %workflow_id, run_id = %run_id, "Workflow completed"),
            _ => warn!(
                workflow_id = %workflow_id,
                run_id = %run_id,
                status = %status,
                error = error.as_deref().unwrap_or(""),
                "Workflow finished without completing"
            ),
        }

        self.inner
            .outbox
            .broadcast(
                OutgoingMessage::new(Message::WorkflowCompleted {
                    workflow_id: workflow_id.to_string(),
                    status,
                })
                .priority(Priority::Medium),
            )
            .await;

        outcome.map(|_| status)
    }

    /// Run the step graph wave by wave until every step has executed, a
    /// step fails, the workflow is stopped, or no pending step can run.
    pub(crate) async fn execute_workflow_steps(&self, workflow_id: &str, run_id: &str) -> Result<WorkflowStatus> {
        let dependencies: HashMap<String, Vec<String>> = {
            let workflows = self.inner.workflows.read().await;
            let workflow = workflows
                .get(workflow_id)
                .ok_or_else(|| Error::WorkflowNotFound(workflow_id.to_string()))?;
            workflow
                .steps
                .iter()
                .map(|s| (s.id.clone(), s.dependencies.clone()))
                .collect()
        };

        let mut pending: HashSet<String> = dependencies.keys().cloned().collect();
        let mut executed: HashSet<String> = HashSet::new();

        while !pending.is_empty() {
            match self.wait_while_paused(workflow_id, run_id).await {
                Some(WorkflowStatus::Running) => {}
                Some(WorkflowStatus::Terminated) | None => {
                    info!(workflow_id = %workflow_id, remaining = pending.len(), "Workflow no longer running, dispatch stopped");
                    return Ok(WorkflowStatus::Terminated);
                }
                Some(other) => {
                    warn!(workflow_id = %workflow_id, status = %other, "Unexpected status during execution");
                    return Ok(WorkflowStatus::Terminated);
                }
            }

            let mut ready: Vec<String> = pending
                .iter()
                .filter(|id| {
                    dependencies
                        .get(*id)
                        .map_or(false, |deps| deps.iter().all(|d| executed.contains(d)))
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                let mut stuck: Vec<String> = pending.into_iter().collect();
                stuck.sort();
                error!(workflow_id = %workflow_id, pending = ?stuck, "Workflow deadlocked");
                return Err(Error::Deadlock {
                    workflow_id: workflow_id.to_string(),
                    pending: stuck,
                });
            }

            ready.sort();
            for id in &ready {
                pending.remove(id);
            }
            debug!(workflow_id = %workflow_id, wave = ?ready, "Dispatching step wave");

            let outcomes = join_all(
                ready
                    .iter()
                    .map(|step_id| self.execute_step(workflow_id, run_id, step_id)),
            )
            .await;
            executed.extend(ready);

            if outcomes.contains(&StepStatus::Failed) {
                return Ok(WorkflowStatus::Failed);
            }
        }
        Ok(WorkflowStatus::Completed)
    }

    /// Current status after waiting out any pause. `None` once the workflow
    /// has been deleted or a newer run has taken it over.
    async fn wait_while_paused(&self, workflow_id: &str, run_id: &str) -> Option<WorkflowStatus> {
        loop {
            let notified = self.inner.resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let status = self
                .inner
                .workflows
                .read()
                .await
                .get(workflow_id)
                .filter(|w| owns_run(w, run_id))
                .map(|w| w.status)?;
            if status != WorkflowStatus::Paused {
                return Some(status);
            }
            debug!(workflow_id = %workflow_id, "Workflow paused, waiting for resume");
            notified.await;
        }
    }

    async fn execute_step(&self, workflow_id: &str, run_id: &str, step_id: &str) -> StepStatus {
        let prepared = {
            let mut workflows = self.inner.workflows.write().await;
            workflows
                .get_mut(workflow_id)
                .filter(|w| owns_run(w, run_id))
                .and_then(|workflow| {
                    let variables = workflow.variable_values();
                    let step = workflow.step_mut(step_id)?;
                    step.status = StepStatus::Running;
                    step.started_at = Some(Utc::now());
                    Some((step.clone(), variables))
                })
        };
        let Some((step, variables)) = prepared else {
            return StepStatus::Failed;
        };

        if !self.inner.evaluator.evaluate_all(&step.conditions, &variables) {
            debug!(workflow_id = %workflow_id, step_id = %step_id, "Step conditions not met, skipping");
            self.finish_step(workflow_id, run_id, step_id, StepStatus::Skipped, None, None)
                .await;
            return StepStatus::Skipped;
        }

        let mut attempt = 0;
        let mut delay: Option<Duration> = None;
        loop {
            attempt += 1;
            if attempt > 1 && !self.is_current_run(workflow_id, run_id).await {
                debug!(workflow_id = %workflow_id, step_id = %step_id, "Run superseded, retries abandoned");
                return StepStatus::Failed;
            }
            self.update_step(workflow_id, run_id, step_id, |s| s.attempts = attempt)
                .await;

            let ctx = ActionContext {
                workflow_id: workflow_id.to_string(),
                step_id: step_id.to_string(),
                variables: variables.clone(),
                attempt,
            };
            match self.inner.actions.execute(&step.action, &ctx).await {
                Ok(result) => {
                    debug!(workflow_id = %workflow_id, step_id = %step_id, attempt, "Step completed");
                    self.finish_step(workflow_id, run_id, step_id, StepStatus::Completed, Some(result), None)
                        .await;
                    return StepStatus::Completed;
                }
                Err(e) => {
                    let policy = match step.retry_policy.as_ref() {
                        Some(policy) if attempt < policy.max_attempts => policy,
                        _ => {
                            warn!(workflow_id = %workflow_id, step_id = %step_id, attempt, error = %e, "Step failed");
                            self.finish_step(workflow_id, run_id, step_id, StepStatus::Failed, None, Some(e.to_string()))
                                .await;
                            return StepStatus::Failed;
                        }
                    };
                    let wait = match delay {
                        None => policy.first_delay(),
                        Some(previous) => policy.next_delay(previous),
                    };
                    delay = Some(wait);
                    warn!(
                        workflow_id = %workflow_id,
                        step_id = %step_id,
                        attempt,
                        delay_ms = wait.as_millis() as u64,
                        error = %e,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn is_current_run(&self, workflow_id: &str, run_id: &str) -> bool {
        self.inner
            .workflows
            .read()
            .await
            .get(workflow_id)
            .is_some_and(|w| owns_run(w, run_id))
    }

    /// Apply `f` to the step, unless `run_id` no longer owns the workflow.
    async fn update_step(&self, workflow_id: &str, run_id: &str, step_id: &str, f: impl FnOnce(&mut Step)) {
        let mut workflows = self.inner.workflows.write().await;
        if let Some(step) = workflows
            .get_mut(workflow_id)
            .filter(|w| owns_run(w, run_id))
            .and_then(|w| w.step_mut(step_id))
        {
            f(step);
        }
    }

    async fn finish_step(
        &self,
        workflow_id: &str,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        self.update_step(workflow_id, run_id, step_id, |s| {
            s.status = status;
            s.completed_at = Some(Utc::now());
            s.result = result;
            s.error = error;
        })
        .await;
    }

    async fn first_step_error(&self, workflow_id: &str) -> Option<String> {
        let workflows = self.inner.workflows.read().await;
        workflows.get(workflow_id).and_then(|w| {
            w.steps
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .map(|s| format!("step '{}' failed: {}", s.id, s.error.as_deref().unwrap_or("unknown error")))
        })
    }
}

fn owns_run(workflow: &Workflow, run_id: &str) -> bool {
    workflow.run_id.as_deref() == Some(run_id)
}

fn idle_status(workflow: &Workflow) -> WorkflowStatus {
    if workflow.workflow_type.auto_activates() {
        WorkflowStatus::Active
    } else {
        WorkflowStatus::Draft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{engine_with, wait_for_status, Recorder};
    use bizflow_agent::MessageBus;
    use bizflow_core::{Condition, ConditionOperator, RetryPolicy, StepAction, WorkflowType};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    fn call(name: &str) -> StepAction {
        StepAction::Function {
            name: name.into(),
            args: Value::Null,
        }
    }

    fn no_vars() -> HashMap<String, Value> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_independent_steps_complete() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("noop", |_, _| async { Ok(json!("done")) })
        });
        let wf = Workflow::new("wf", "Three steps", WorkflowType::Manual)
            .with_step(Step::new("a", call("noop")))
            .with_step(Step::new("b", call("noop")))
            .with_step(Step::new("c", call("noop")));
        let created = engine.create_workflow(wf).await.unwrap();
        assert_eq!(created.status, WorkflowStatus::Draft);

        let status = engine.run_workflow("wf", no_vars()).await.unwrap();
        assert_eq!(status, WorkflowStatus::Completed);

        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert!(wf.completed_at.is_some());
        for step in &wf.steps {
            assert_eq!(step.status, StepStatus::Completed);
            assert_eq!(step.attempts, 1);
            assert_eq!(step.result, Some(json!("done")));
        }
    }

    #[tokio::test]
    async fn test_mutual_dependency_deadlocks() {
        let bus = MessageBus::new(10);
        let config = WorkflowConfig {
            validate_on_create: false,
            ..WorkflowConfig::default()
        };
        let engine = engine_with(&bus, config, |b| b.function("noop", |_, _| async { Ok(Value::Null) }));
        let wf = Workflow::new("wf", "Loop", WorkflowType::Manual)
            .with_step(Step::new("a", call("noop")).depends_on("b"))
            .with_step(Step::new("b", call("noop")).depends_on("a"));
        engine.create_workflow(wf).await.unwrap();

        let err = engine.run_workflow("wf", no_vars()).await.unwrap_err();
        match err {
            Error::Deadlock { workflow_id, pending } => {
                assert_eq!(workflow_id, "wf");
                assert_eq!(pending, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Failed);
        assert!(wf.error.unwrap().contains("Deadlock"));
        assert!(wf.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn test_retry_backoff_then_fail() {
        let bus = MessageBus::new(10);
        let calls: Arc<StdMutex<Vec<Instant>>> = Arc::new(StdMutex::new(Vec::new()));
        let recorded = calls.clone();
        let engine = engine_with(&bus, WorkflowConfig::default(), move |b| {
            b.function("always_fails", move |_, _| {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(Instant::now());
                    Err(Error::Action("upstream unavailable".into()))
                }
            })
        });
        let wf = Workflow::new("wf", "Retry", WorkflowType::Manual).with_step(
            Step::new("sync", call("always_fails")).with_retry(RetryPolicy::exponential(3, 100, 1000)),
        );
        engine.create_workflow(wf).await.unwrap();

        let status = engine.run_workflow("wf", no_vars()).await.unwrap();
        assert_eq!(status, WorkflowStatus::Failed);

        let times = calls.lock().unwrap().clone();
        assert_eq!(times.len(), 3);
        let first_gap = times[1] - times[0];
        let second_gap = times[2] - times[1];
        assert!(first_gap >= Duration::from_millis(100) && first_gap < Duration::from_millis(190));
        assert!(second_gap >= Duration::from_millis(200) && second_gap < Duration::from_millis(350));

        let wf = engine.get_workflow("wf").await.unwrap();
        let step = wf.step("sync").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempts, 3);
        assert!(step.error.as_deref().unwrap().contains("upstream unavailable"));
        assert!(wf.error.unwrap().contains("step 'sync' failed"));
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("slow", |_, _| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Value::Null)
            })
        });
        engine
            .create_workflow(Workflow::new("wf", "Slow", WorkflowType::Manual).with_step(Step::new("s", call("slow"))))
            .await
            .unwrap();

        engine.start_workflow("wf", no_vars()).await.unwrap();
        let err = engine.start_workflow("wf", no_vars()).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(id) if id == "wf"));
        let err = engine
            .update_workflow(Workflow::new("wf", "Slow v2", WorkflowType::Manual))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));

        assert!(wait_for_status(&engine, "wf", WorkflowStatus::Completed).await);
        engine.start_workflow("wf", no_vars()).await.unwrap();
        assert!(wait_for_status(&engine, "wf", WorkflowStatus::Completed).await);
        assert_eq!(engine.run_history(Some("wf")).await.len(), 2);
    }

    #[tokio::test]
    async fn test_skipped_step_unblocks_dependents() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("noop", |_, _| async { Ok(Value::Null) })
        });
        let wf = Workflow::new("wf", "Conditional", WorkflowType::Manual)
            .with_variable("amount", json!(40))
            .with_step(
                Step::new("escalate", call("noop")).with_condition(Condition::new(
                    "amount",
                    ConditionOperator::GreaterThan,
                    Some(json!(100)),
                )),
            )
            .with_step(Step::new("archive", call("noop")).depends_on("escalate"));
        engine.create_workflow(wf).await.unwrap();

        assert_eq!(engine.run_workflow("wf", no_vars()).await.unwrap(), WorkflowStatus::Completed);
        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.step("escalate").unwrap().status, StepStatus::Skipped);
        assert_eq!(wf.step("escalate").unwrap().attempts, 0);
        assert_eq!(wf.step("archive").unwrap().status, StepStatus::Completed);

        // Run variables are merged in and flip the condition.
        let vars = HashMap::from([("amount".to_string(), json!(500))]);
        engine.run_workflow("wf", vars).await.unwrap();
        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.step("escalate").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_step_stops_later_waves() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("noop", |_, _| async { Ok(Value::Null) })
        });
        let wf = Workflow::new("wf", "Unsupported", WorkflowType::Manual)
            .with_step(Step::new(
                "query",
                StepAction::Database {
                    query: "select * from invoices".into(),
                    params: vec![],
                },
            ))
            .with_step(Step::new("sibling", call("noop")))
            .with_step(Step::new("report", call("noop")).depends_on("query"));
        engine.create_workflow(wf).await.unwrap();

        assert_eq!(engine.run_workflow("wf", no_vars()).await.unwrap(), WorkflowStatus::Failed);
        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.step("query").unwrap().status, StepStatus::Failed);
        assert!(wf.step("query").unwrap().error.as_deref().unwrap().contains("no handler registered"));
        assert_eq!(wf.step("sibling").unwrap().status, StepStatus::Completed);
        assert_eq!(wf.step("report").unwrap().status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_event_trigger_starts_workflow() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("noop", |_, _| async { Ok(Value::Null) })
        });
        let wf = Workflow::new("on-payment", "Payment follow-up", WorkflowType::EventDriven)
            .with_step(Step::new("thank", call("noop")))
            .with_trigger(Trigger::Event {
                event: "invoice_paid".into(),
            });
        let created = engine.create_workflow(wf).await.unwrap();
        assert_eq!(created.status, WorkflowStatus::Active);
        engine
            .create_workflow(Workflow::new("other", "Other", WorkflowType::Manual).with_step(Step::new("x", call("noop"))))
            .await
            .unwrap();

        assert!(engine.handle_event("invoice_sent", no_vars()).await.is_empty());
        let vars = HashMap::from([("amount".to_string(), json!(120))]);
        let started = engine.handle_event("invoice_paid", vars).await;
        assert_eq!(started, vec!["on-payment".to_string()]);

        assert!(wait_for_status(&engine, "on-payment", WorkflowStatus::Completed).await);
        let wf = engine.get_workflow("on-payment").await.unwrap();
        assert_eq!(wf.variables["amount"].value, json!(120));
        let history = engine.run_history(Some("on-payment")).await;
        assert_eq!(
            history[0].trigger,
            RunTrigger::Event {
                event_type: "invoice_paid".into()
            }
        );
        assert_eq!(engine.get_workflow("other").await.unwrap().status, WorkflowStatus::Draft);
    }

    #[tokio::test]
    async fn test_condition_trigger_checks_event_variables() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("noop", |_, _| async { Ok(Value::Null) })
        });
        let wf = Workflow::new("big-order", "Big order", WorkflowType::EventDriven)
            .with_step(Step::new("alert", call("noop")))
            .with_trigger(Trigger::Condition {
                condition: Condition::new("total", ConditionOperator::GreaterThan, Some(json!(1000))),
            });
        engine.create_workflow(wf).await.unwrap();

        let small = HashMap::from([("total".to_string(), json!(10))]);
        assert!(engine.handle_event("order_placed", small).await.is_empty());
        let big = HashMap::from([("total".to_string(), json!(5000))]);
        assert_eq!(engine.handle_event("order_placed", big).await, vec!["big-order".to_string()]);
    }

    #[tokio::test]
    async fn test_email_step_sends_communication() {
        let bus = MessageBus::new(10);
        let comms = Recorder::new("communications", &bus);
        bus.register_agent(comms.clone()).await.unwrap();
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| b);

        let wf = Workflow::new("remind", "Reminder", WorkflowType::Manual)
            .with_variable("client", json!("Acme"))
            .with_step(Step::new(
                "mail",
                StepAction::Email {
                    to: "billing@acme.test".into(),
                    subject: "Invoice for {{client}}".into(),
                    body: "Dear {{client}}, your invoice is overdue.".into(),
                },
            ));
        engine.create_workflow(wf).await.unwrap();
        assert_eq!(engine.run_workflow("remind", no_vars()).await.unwrap(), WorkflowStatus::Completed);
        bus.wait_idle().await;

        let sent: Vec<_> = comms
            .received()
            .into_iter()
            .filter(|e| e.kind() == "SEND_COMMUNICATION")
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sender, "workflow");
        match &sent[0].payload {
            Message::SendCommunication { to, subject, body, .. } => {
                assert_eq!(to, "billing@acme.test");
                assert_eq!(subject.as_deref(), Some("Invoice for Acme"));
                assert!(body.starts_with("Dear Acme"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(comms.received_kinds().contains(&"WORKFLOW_COMPLETED".to_string()));
    }

    #[tokio::test]
    async fn test_stop_prevents_next_wave() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("slow", |_, _| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(Value::Null)
            })
        });
        let wf = Workflow::new("wf", "Two waves", WorkflowType::Manual)
            .with_step(Step::new("first", call("slow")))
            .with_step(Step::new("second", call("slow")).depends_on("first"));
        engine.create_workflow(wf).await.unwrap();

        engine.start_workflow("wf", no_vars()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.stop_workflow("wf").await.unwrap();
        assert!(matches!(engine.stop_workflow("wf").await, Err(Error::NotRunning(_))));

        tokio::time::sleep(Duration::from_millis(200)).await;
        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Terminated);
        assert_eq!(wf.step("first").unwrap().status, StepStatus::Completed);
        assert_eq!(wf.step("second").unwrap().status, StepStatus::Pending);
        assert_eq!(engine.run_history(Some("wf")).await[0].status, WorkflowStatus::Terminated);
    }

    #[tokio::test]
    async fn test_restart_after_stop_owns_the_workflow() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("slow", |_, _| async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok(Value::Null)
            })
        });
        let wf = Workflow::new("wf", "Two waves", WorkflowType::Manual)
            .with_step(Step::new("first", call("slow")))
            .with_step(Step::new("second", call("slow")).depends_on("first"));
        engine.create_workflow(wf).await.unwrap();

        let stopped_run = engine.start_workflow("wf", no_vars()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.stop_workflow("wf").await.unwrap();
        let second_run = engine.start_workflow("wf", no_vars()).await.unwrap();

        assert!(wait_for_status(&engine, "wf", WorkflowStatus::Completed).await);
        // let the stopped executor wind down
        tokio::time::sleep(Duration::from_millis(150)).await;

        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Completed);
        assert_eq!(wf.run_id.as_deref(), Some(second_run.as_str()));
        assert!(wf.steps.iter().all(|s| s.status == StepStatus::Completed && s.attempts == 1));

        let history = engine.run_history(Some("wf")).await;
        let statuses: Vec<(String, WorkflowStatus)> =
            history.into_iter().map(|r| (r.run_id, r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                (stopped_run, WorkflowStatus::Terminated),
                (second_run, WorkflowStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| {
            b.function("slow", |_, _| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Value::Null)
            })
        });
        let wf = Workflow::new("wf", "Pausable", WorkflowType::Manual)
            .with_step(Step::new("first", call("slow")))
            .with_step(Step::new("second", call("slow")).depends_on("first"));
        engine.create_workflow(wf).await.unwrap();

        assert!(matches!(engine.resume_workflow("wf").await, Err(Error::NotRunning(_))));
        engine.start_workflow("wf", no_vars()).await.unwrap();
        engine.pause_workflow("wf").await.unwrap();
        assert!(matches!(
            engine.start_workflow("wf", no_vars()).await,
            Err(Error::AlreadyRunning(_))
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.status, WorkflowStatus::Paused);
        assert_eq!(wf.step("second").unwrap().status, StepStatus::Pending);

        engine.resume_workflow("wf").await.unwrap();
        assert!(wait_for_status(&engine, "wf", WorkflowStatus::Completed).await);
        let wf = engine.get_workflow("wf").await.unwrap();
        assert_eq!(wf.step("second").unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_history_is_bounded() {
        let bus = MessageBus::new(10);
        let config = WorkflowConfig {
            history_limit: 2,
            ..WorkflowConfig::default()
        };
        let engine = engine_with(&bus, config, |b| b.function("noop", |_, _| async { Ok(Value::Null) }));
        let wf = Workflow::new("wf", "Versioned", WorkflowType::Manual).with_step(Step::new("a", call("noop")));
        engine.create_workflow(wf.clone()).await.unwrap();

        let updated = engine
            .update_workflow(wf.with_step(Step::new("b", call("noop")).depends_on("a")))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.steps.len(), 2);

        for _ in 0..3 {
            engine.run_workflow("wf", no_vars()).await.unwrap();
        }
        let history = engine.run_history(None).await;
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.status == WorkflowStatus::Completed && r.completed_at.is_some()));

        assert!(matches!(
            engine.update_workflow(Workflow::new("ghost", "Ghost", WorkflowType::Manual)).await,
            Err(Error::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_and_duplicate() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| b);
        let cyclic = Workflow::new("wf", "Cyclic", WorkflowType::Manual)
            .with_step(Step::new("a", call("noop")).depends_on("b"))
            .with_step(Step::new("b", call("noop")).depends_on("a"));
        assert!(matches!(engine.create_workflow(cyclic).await, Err(Error::InvalidWorkflow(_))));
        assert!(engine.get_workflow("wf").await.is_none());

        let ok = Workflow::new("wf", "Fine", WorkflowType::Manual);
        engine.create_workflow(ok.clone()).await.unwrap();
        assert!(matches!(engine.create_workflow(ok).await, Err(Error::InvalidWorkflow(_))));

        let anonymous = engine
            .create_workflow(Workflow::new("", "No id", WorkflowType::Manual))
            .await
            .unwrap();
        assert!(!anonymous.id.is_empty());
        assert_eq!(engine.list_workflows().await.len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_triggers_armed_and_disarmed() {
        let bus = MessageBus::new(10);
        let engine = engine_with(&bus, WorkflowConfig::default(), |b| b);
        let wf = Workflow::new("nightly", "Nightly", WorkflowType::Scheduled)
            .with_trigger(Trigger::Schedule {
                expression: "0 2 * * *".into(),
            })
            .with_trigger(Trigger::Schedule {
                expression: "every 6h".into(),
            });
        engine.create_workflow(wf).await.unwrap();
        assert_eq!(engine.armed_schedules("nightly").await, 2);

        engine.shutdown().await;
        assert_eq!(engine.armed_schedules("nightly").await, 0);
        assert_eq!(engine.rearm_triggers().await, 2);
        assert_eq!(engine.rearm_triggers().await, 0);
        assert_eq!(engine.armed_schedules("nightly").await, 2);

        engine.delete_workflow("nightly").await.unwrap();
        assert_eq!(engine.armed_schedules("nightly").await, 0);
        assert!(matches!(
            engine.delete_workflow("nightly").await,
            Err(Error::WorkflowNotFound(_))
        ));
    }
}
