use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Draft,
    /// Armed: waiting for a schedule or event trigger.
    Active,
    Running,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl WorkflowStatus {
    /// A run owns the workflow; another start must be rejected.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, WorkflowStatus::Running | WorkflowStatus::Paused)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Draft => write!(f, "draft"),
            WorkflowStatus::Active => write!(f, "active"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    Scheduled,
    EventDriven,
    #[default]
    Manual,
    Hybrid,
}

impl WorkflowType {
    /// Scheduled and event-driven workflows are armed as soon as they are created.
    pub fn auto_activates(&self) -> bool {
        !matches!(self, WorkflowType::Manual)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// What a step does when it runs. Each variant is dispatched to the
/// handler registered for its [`ActionKind`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    ApiCall {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Function {
        name: String,
        #[serde(default)]
        args: Value,
    },
    Script {
        #[serde(default = "default_script_language")]
        language: String,
        source: String,
    },
    Email {
        to: String,
        subject: String,
        body: String,
    },
    Notification {
        channel: String,
        message: String,
    },
    Database {
        query: String,
        #[serde(default)]
        params: Vec<Value>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_script_language() -> String {
    "shell".to_string()
}

impl StepAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            StepAction::ApiCall { .. } => ActionKind::ApiCall,
            StepAction::Function { .. } => ActionKind::Function,
            StepAction::Script { .. } => ActionKind::Script,
            StepAction::Email { .. } => ActionKind::Email,
            StepAction::Notification { .. } => ActionKind::Notification,
            StepAction::Database { .. } => ActionKind::Database,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ApiCall,
    Function,
    Script,
    Email,
    Notification,
    Database,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::ApiCall => write!(f, "api_call"),
            ActionKind::Function => write!(f, "function"),
            ActionKind::Script => write!(f, "script"),
            ActionKind::Email => write!(f, "email"),
            ActionKind::Notification => write!(f, "notification"),
            ActionKind::Database => write!(f, "database"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Exists,
    NotExists,
}

/// A predicate over a workflow variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub variable: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Condition {
    pub fn new(variable: &str, operator: ConditionOperator, value: Option<Value>) -> Self {
        Self {
            variable: variable.to_string(),
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffType {
    Fixed,
    Linear,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_type: BackoffType,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial_interval_ms: u64, max_interval_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_type: BackoffType::Exponential,
            initial_interval_ms,
            max_interval_ms,
            multiplier: default_multiplier(),
        }
    }

    /// Delay before the first retry.
    pub fn first_delay(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms.min(self.max_interval_ms))
    }

    /// Delay before the retry that follows one which waited `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let current_ms = current.as_millis() as f64;
        let next_ms = match self.backoff_type {
            BackoffType::Fixed => self.initial_interval_ms as f64,
            BackoffType::Linear => current_ms + self.initial_interval_ms as f64,
            BackoffType::Exponential => current_ms * self.multiplier,
        };
        let capped = next_ms.max(0.0).min(self.max_interval_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: StepStatus,
    pub action: StepAction,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    pub fn new(id: &str, action: StepAction) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            status: StepStatus::Pending,
            action,
            conditions: Vec::new(),
            retry_policy: None,
            dependencies: Vec::new(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            result: None,
            error: None,
        }
    }

    pub fn depends_on(mut self, step_id: &str) -> Self {
        self.dependencies.push(step_id.to_string());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Clear run state so the step can execute again.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.attempts = 0;
        self.result = None;
        self.error = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Cron expression or `every <n><s|m|h|d>`.
    Schedule { expression: String },
    Event { event: String },
    Condition { condition: Condition },
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub workflow_type: WorkflowType,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub variables: HashMap<String, Variable>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Run that owns execution. Each start replaces it, so an executor
    /// left over from a stopped run can tell it has been superseded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl Workflow {
    pub fn new(id: &str, name: &str, workflow_type: WorkflowType) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            version: default_version(),
            status: WorkflowStatus::Draft,
            workflow_type,
            steps: Vec::new(),
            triggers: Vec::new(),
            variables: HashMap::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            run_id: None,
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_variable(mut self, name: &str, value: Value) -> Self {
        self.set_variable(name, value);
        self
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.variables.insert(
            name.to_string(),
            Variable {
                name: name.to_string(),
                value,
                description: None,
            },
        );
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Flattened `name -> value` view used by conditions and actions.
    pub fn variable_values(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    pub fn schedule_expressions(&self) -> Vec<&str> {
        self.triggers
            .iter()
            .filter_map(|t| match t {
                Trigger::Schedule { expression } => Some(expression.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Schedule,
    Event { event_type: String },
}

/// One execution of a workflow, kept in the engine's bounded history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_id: String,
    pub trigger: RunTrigger,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
