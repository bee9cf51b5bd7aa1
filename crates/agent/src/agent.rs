use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bizflow_core::{
    AgentConfig, AgentSnapshot, AgentStatus, Envelope, Message, OutgoingMessage, Result,
};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bus::MessageBus;

/// An independently lifecycled unit that receives envelopes from the bus.
///
/// Implementors own an [`AgentState`] and expose it through [`Agent::state`];
/// the accessor methods below read through it. The bus and the orchestrator
/// only ever read the status.
#[async_trait]
pub trait Agent: Send + Sync {
    fn state(&self) -> &AgentState;

    fn id(&self) -> &str {
        self.state().id()
    }

    fn capabilities(&self) -> &[String] {
        self.state().capabilities()
    }

    async fn status(&self) -> AgentStatus {
        self.state().status().await
    }

    async fn snapshot(&self) -> AgentSnapshot {
        self.state().snapshot().await
    }

    /// One-time setup. Must leave the agent `Idle` on success.
    async fn initialize(&self) -> Result<()>;

    /// Handle one envelope. Unrecognized payloads are logged and ignored.
    async fn process_message(&self, envelope: Envelope) -> Result<()>;

    /// Local recovery attempt after a reported fault. An error here makes the
    /// orchestrator restart the agent.
    async fn handle_error(&self, error: &str) -> Result<()> {
        warn!(agent_id = %self.id(), error = %error, "Agent error reported, resetting to idle");
        self.state().recover().await;
        Ok(())
    }

    /// Release resources, unregister from the bus and become `Terminated`.
    async fn shutdown(&self) -> Result<()> {
        self.state().terminate().await;
        Ok(())
    }
}

/// Everything a factory gets when the orchestrator builds an agent.
#[derive(Clone)]
pub struct AgentContext {
    pub bus: MessageBus,
    pub config: AgentConfig,
}

pub type AgentFactory = Arc<dyn Fn(AgentContext) -> Arc<dyn Agent> + Send + Sync>;

/// The bus handle an agent emits through. Every message leaving an outbox
/// carries the owning agent's id as sender.
#[derive(Clone)]
pub struct Outbox {
    agent_id: String,
    bus: MessageBus,
}

impl Outbox {
    pub fn new(agent_id: &str, bus: MessageBus) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            bus,
        }
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub async fn send(&self, msg: impl Into<OutgoingMessage>) -> Envelope {
        self.bus.send_message(msg.into().sender(&self.agent_id)).await
    }

    pub async fn broadcast(&self, msg: impl Into<OutgoingMessage>) -> Vec<Envelope> {
        self.bus.broadcast(msg.into().sender(&self.agent_id)).await
    }

    /// Answer `request`, addressed to its sender and correlated by its id.
    pub async fn reply(&self, request: &Envelope, payload: Message) -> Envelope {
        self.send(
            OutgoingMessage::new(payload)
                .to(&request.sender)
                .priority(request.priority)
                .correlate(&request.id),
        )
        .await
    }
}

struct AgentRecord {
    status: AgentStatus,
    last_active: DateTime<Utc>,
    error_count: u32,
    metrics: HashMap<String, f64>,
}

/// Shared bookkeeping every agent carries: identity, status, counters and
/// its outbox.
pub struct AgentState {
    id: String,
    capabilities: Vec<String>,
    record: RwLock<AgentRecord>,
    outbox: Outbox,
}

impl AgentState {
    pub fn new(id: &str, capabilities: &[&str], bus: MessageBus) -> Self {
        Self {
            id: id.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            record: RwLock::new(AgentRecord {
                status: AgentStatus::Initializing,
                last_active: Utc::now(),
                error_count: 0,
                metrics: HashMap::new(),
            }),
            outbox: Outbox::new(id, bus),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub async fn status(&self) -> AgentStatus {
        self.record.read().await.status
    }

    pub async fn set_status(&self, status: AgentStatus) {
        let mut record = self.record.write().await;
        if record.status != status {
            debug!(agent_id = %self.id, from = %record.status, to = %status, "Agent status changed");
            record.status = status;
        }
        record.last_active = Utc::now();
    }

    /// Move from `from` to `to`; leaves any other status alone.
    pub async fn transition(&self, from: AgentStatus, to: AgentStatus) -> bool {
        let mut record = self.record.write().await;
        record.last_active = Utc::now();
        if record.status != from {
            return false;
        }
        debug!(agent_id = %self.id, from = %from, to = %to, "Agent status changed");
        record.status = to;
        true
    }

    pub async fn touch(&self) {
        self.record.write().await.last_active = Utc::now();
    }

    /// Record an unhandled fault: bump the error count and enter `Error`.
    pub async fn record_error(&self, error: &str) -> u32 {
        let mut record = self.record.write().await;
        record.error_count += 1;
        record.status = AgentStatus::Error;
        record.last_active = Utc::now();
        warn!(agent_id = %self.id, error_count = record.error_count, error = %error, "Agent entered error state");
        record.error_count
    }

    /// Leave `Error` for `Idle`. Other states are untouched.
    pub async fn recover(&self) {
        let mut record = self.record.write().await;
        if record.status == AgentStatus::Error {
            record.status = AgentStatus::Idle;
            record.last_active = Utc::now();
        }
    }

    pub async fn incr_metric(&self, name: &str, by: f64) {
        let mut record = self.record.write().await;
        *record.metrics.entry(name.to_string()).or_insert(0.0) += by;
    }

    pub async fn set_metric(&self, name: &str, value: f64) {
        self.record
            .write()
            .await
            .metrics
            .insert(name.to_string(), value);
    }

    pub async fn snapshot(&self) -> AgentSnapshot {
        let record = self.record.read().await;
        AgentSnapshot {
            id: self.id.clone(),
            status: record.status,
            last_active: record.last_active,
            error_count: record.error_count,
            metrics: record.metrics.clone(),
            capabilities: self.capabilities.clone(),
        }
    }

    pub async fn send(&self, msg: impl Into<OutgoingMessage>) -> Envelope {
        self.touch().await;
        self.outbox.send(msg).await
    }

    pub async fn broadcast(&self, msg: impl Into<OutgoingMessage>) -> Vec<Envelope> {
        self.touch().await;
        self.outbox.broadcast(msg).await
    }

    /// Enter `Terminated` and leave the bus. Safe to call more than once.
    pub async fn terminate(&self) {
        self.set_status(AgentStatus::Terminated).await;
        self.outbox.bus().unregister_agent(&self.id).await;
        info!(agent_id = %self.id, "Agent terminated");
    }
}
