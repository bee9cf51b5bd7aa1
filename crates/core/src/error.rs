use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Already running: {0}")]
    AlreadyRunning(String),

    #[error("Not running: {0}")]
    NotRunning(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Deadlock in workflow {workflow_id}: no runnable step among {pending:?}")]
    Deadlock {
        workflow_id: String,
        pending: Vec<String>,
    },

    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Action error: {0}")]
    Action(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
