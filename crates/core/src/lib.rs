pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;
pub mod workflow;

pub use config::{BusConfig, Config, OrchestratorConfig, WorkflowConfig};
pub use error::{Error, Result};
pub use message::{
    CommunicationChannel, Envelope, Message, OutgoingMessage, Priority, ORCHESTRATOR_ID,
    SYSTEM_SENDER,
};
pub use paths::Paths;
pub use types::{AgentConfig, AgentSnapshot, AgentStatus};
pub use workflow::{
    ActionKind, BackoffType, Condition, ConditionOperator, RetryPolicy, RunTrigger, Step,
    StepAction, StepStatus, Trigger, Variable, Workflow, WorkflowRun, WorkflowStatus,
    WorkflowType,
};
