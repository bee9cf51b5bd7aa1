use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::types::AgentSnapshot;
use crate::workflow::{Workflow, WorkflowStatus};

/// Sender id used when a message is submitted without one.
pub const SYSTEM_SENDER: &str = "system";
/// Recipient id used when a message is submitted without one.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommunicationChannel {
    Email,
    Notification,
}

/// Typed payload of an envelope. The serde tag doubles as the wire-level
/// message type (`START_AGENT`, `WORKFLOW_EVENT`, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    StartAgent { agent_id: String },
    StopAgent { agent_id: String },
    AgentError { agent_id: String, error: String },
    GetAgentStatus,
    AgentStatusResponse { agents: Vec<AgentSnapshot> },
    AgentStarted { agent_id: String },
    AgentStopped { agent_id: String },

    CreateWorkflow { workflow: Box<Workflow> },
    UpdateWorkflow { workflow: Box<Workflow> },
    DeleteWorkflow { workflow_id: String },
    StartWorkflow {
        workflow_id: String,
        #[serde(default)]
        variables: HashMap<String, Value>,
    },
    StopWorkflow { workflow_id: String },
    PauseWorkflow { workflow_id: String },
    ResumeWorkflow { workflow_id: String },
    GetWorkflowStatus {
        #[serde(default)]
        workflow_id: Option<String>,
    },
    WorkflowStatusResponse { workflows: Vec<Workflow> },
    WorkflowEvent {
        event_type: String,
        #[serde(default)]
        variables: HashMap<String, Value>,
    },
    WorkflowCreated { workflow_id: String },
    WorkflowUpdated { workflow_id: String },
    WorkflowDeleted { workflow_id: String },
    WorkflowCompleted { workflow_id: String, status: WorkflowStatus },

    SendCommunication {
        channel: CommunicationChannel,
        to: String,
        #[serde(default)]
        subject: Option<String>,
        body: String,
    },

    /// Collaborator-defined message; the core never looks inside `content`.
    Custom { kind: String, content: Value },
}

impl Message {
    /// Wire-level type tag.
    pub fn kind(&self) -> &str {
        match self {
            Message::StartAgent { .. } => "START_AGENT",
            Message::StopAgent { .. } => "STOP_AGENT",
            Message::AgentError { .. } => "AGENT_ERROR",
            Message::GetAgentStatus => "GET_AGENT_STATUS",
            Message::AgentStatusResponse { .. } => "AGENT_STATUS_RESPONSE",
            Message::AgentStarted { .. } => "AGENT_STARTED",
            Message::AgentStopped { .. } => "AGENT_STOPPED",
            Message::CreateWorkflow { .. } => "CREATE_WORKFLOW",
            Message::UpdateWorkflow { .. } => "UPDATE_WORKFLOW",
            Message::DeleteWorkflow { .. } => "DELETE_WORKFLOW",
            Message::StartWorkflow { .. } => "START_WORKFLOW",
            Message::StopWorkflow { .. } => "STOP_WORKFLOW",
            Message::PauseWorkflow { .. } => "PAUSE_WORKFLOW",
            Message::ResumeWorkflow { .. } => "RESUME_WORKFLOW",
            Message::GetWorkflowStatus { .. } => "GET_WORKFLOW_STATUS",
            Message::WorkflowStatusResponse { .. } => "WORKFLOW_STATUS_RESPONSE",
            Message::WorkflowEvent { .. } => "WORKFLOW_EVENT",
            Message::WorkflowCreated { .. } => "WORKFLOW_CREATED",
            Message::WorkflowUpdated { .. } => "WORKFLOW_UPDATED",
            Message::WorkflowDeleted { .. } => "WORKFLOW_DELETED",
            Message::WorkflowCompleted { .. } => "WORKFLOW_COMPLETED",
            Message::SendCommunication { .. } => "SEND_COMMUNICATION",
            Message::Custom { kind, .. } => kind.as_str(),
        }
    }
}

/// A routed message. Immutable once the bus has stamped it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub priority: Priority,
    pub sender: String,
    pub recipient: String,
    pub payload: Message,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub requires_response: bool,
}

impl Envelope {
    pub fn kind(&self) -> &str {
        self.payload.kind()
    }
}

/// A partially specified envelope handed to the bus. Unset fields get the
/// bus defaults when the message is enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub payload: Message,
    pub priority: Option<Priority>,
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub correlation_id: Option<String>,
    pub requires_response: bool,
}

impl OutgoingMessage {
    pub fn new(payload: Message) -> Self {
        Self {
            payload,
            priority: None,
            sender: None,
            recipient: None,
            correlation_id: None,
            requires_response: false,
        }
    }

    pub fn to(mut self, recipient: &str) -> Self {
        self.recipient = Some(recipient.to_string());
        self
    }

    pub fn sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn correlate(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn expect_response(mut self) -> Self {
        self.requires_response = true;
        self
    }

    /// Fill in id, timestamp and defaults.
    pub fn complete(self) -> Envelope {
        Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            priority: self.priority.unwrap_or_default(),
            sender: self.sender.unwrap_or_else(|| SYSTEM_SENDER.to_string()),
            recipient: self
                .recipient
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| ORCHESTRATOR_ID.to_string()),
            payload: self.payload,
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            requires_response: self.requires_response,
        }
    }
}

impl From<Message> for OutgoingMessage {
    fn from(payload: Message) -> Self {
        OutgoingMessage::new(payload)
    }
}
