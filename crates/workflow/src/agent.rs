use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bizflow_agent::{Agent, AgentContext, AgentFactory, AgentState, MessageBus, Outbox};
use bizflow_core::{AgentStatus, Envelope, Message, OutgoingMessage, Result, WorkflowConfig};
use tracing::{debug, info, warn};

use crate::engine::WorkflowEngine;

pub const WORKFLOW_AGENT_ID: &str = "workflow";

/// Bus front-end of the workflow engine.
pub struct WorkflowAgent {
    state: AgentState,
    engine: WorkflowEngine,
}

impl WorkflowAgent {
    pub fn new(bus: MessageBus, config: WorkflowConfig) -> Self {
        let state = Self::state_for(bus);
        let engine = WorkflowEngine::new(state.outbox().clone(), config);
        Self { state, engine }
    }

    /// Wrap an engine built elsewhere, e.g. one with custom functions. The
    /// engine should emit through an outbox bound to [`WORKFLOW_AGENT_ID`].
    pub fn with_engine(bus: MessageBus, engine: WorkflowEngine) -> Self {
        Self {
            state: Self::state_for(bus),
            engine,
        }
    }

    fn state_for(bus: MessageBus) -> AgentState {
        AgentState::new(
            WORKFLOW_AGENT_ID,
            &["workflow_management", "workflow_execution"],
            bus,
        )
    }

    /// Every agent the factory builds fronts the same engine, so a restart
    /// by the orchestrator keeps stored workflows and run history.
    pub fn factory(config: WorkflowConfig) -> AgentFactory {
        let shared: Arc<OnceLock<WorkflowEngine>> = Arc::new(OnceLock::new());
        Arc::new(move |ctx: AgentContext| {
            let engine = shared
                .get_or_init(|| {
                    WorkflowEngine::new(Outbox::new(WORKFLOW_AGENT_ID, ctx.bus.clone()), config.clone())
                })
                .clone();
            Arc::new(WorkflowAgent::with_engine(ctx.bus, engine)) as Arc<dyn Agent>
        })
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    async fn announce(&self, payload: Message) {
        self.state.broadcast(OutgoingMessage::new(payload)).await;
    }

    async fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        match &envelope.payload {
            Message::CreateWorkflow { workflow } => {
                let created = self.engine.create_workflow(workflow.as_ref().clone()).await?;
                self.announce(Message::WorkflowCreated {
                    workflow_id: created.id,
                })
                .await;
            }
            Message::UpdateWorkflow { workflow } => {
                let updated = self.engine.update_workflow(workflow.as_ref().clone()).await?;
                self.announce(Message::WorkflowUpdated {
                    workflow_id: updated.id,
                })
                .await;
            }
            Message::DeleteWorkflow { workflow_id } => {
                self.engine.delete_workflow(workflow_id).await?;
                self.announce(Message::WorkflowDeleted {
                    workflow_id: workflow_id.clone(),
                })
                .await;
            }
            Message::StartWorkflow { workflow_id, variables } => {
                self.engine.start_workflow(workflow_id, variables.clone()).await?;
            }
            Message::StopWorkflow { workflow_id } => self.engine.stop_workflow(workflow_id).await?,
            Message::PauseWorkflow { workflow_id } => self.engine.pause_workflow(workflow_id).await?,
            Message::ResumeWorkflow { workflow_id } => self.engine.resume_workflow(workflow_id).await?,
            Message::WorkflowEvent { event_type, variables } => {
                let started = self.engine.handle_event(event_type, variables.clone()).await;
                debug!(event_type = %event_type, started = started.len(), "Workflow event handled");
            }
            Message::GetWorkflowStatus { workflow_id } => {
                let workflows = match workflow_id {
                    Some(id) => self.engine.get_workflow(id).await.into_iter().collect(),
                    None => self.engine.list_workflows().await,
                };
                self.state
                    .outbox()
                    .reply(envelope, Message::WorkflowStatusResponse { workflows })
                    .await;
            }
            _ => {
                debug!(kind = %envelope.kind(), from = %envelope.sender, "Workflow agent ignoring message");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for WorkflowAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    async fn initialize(&self) -> Result<()> {
        let armed = self.engine.rearm_triggers().await;
        self.state.set_status(AgentStatus::Idle).await;
        info!(rearmed_schedules = armed, "Workflow agent initialized");
        Ok(())
    }

    async fn process_message(&self, envelope: Envelope) -> Result<()> {
        // An Error status is left for the health check to see.
        let claimed = self.state.transition(AgentStatus::Idle, AgentStatus::Busy).await;
        self.state.incr_metric("messages_processed", 1.0).await;
        if let Err(e) = self.dispatch(&envelope).await {
            warn!(kind = %envelope.kind(), from = %envelope.sender, error = %e, "Workflow request failed");
            self.state.incr_metric("requests_failed", 1.0).await;
        }
        if claimed {
            self.state.transition(AgentStatus::Busy, AgentStatus::Idle).await;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.engine.shutdown().await;
        self.state.terminate().await;
        Ok(())
    }
}
