use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bizflow_agent::{Agent, AgentState, MessageBus, Outbox};
use bizflow_core::{AgentStatus, Envelope, Result, WorkflowConfig, WorkflowStatus};

use crate::agent::WORKFLOW_AGENT_ID;
use crate::engine::{WorkflowEngine, WorkflowEngineBuilder};

/// Bus agent that keeps everything it receives.
pub(crate) struct Recorder {
    state: AgentState,
    received: Mutex<Vec<Envelope>>,
}

impl Recorder {
    pub fn new(id: &str, bus: &MessageBus) -> Arc<Self> {
        Arc::new(Self {
            state: AgentState::new(id, &[], bus.clone()),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn received(&self) -> Vec<Envelope> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_kinds(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|e| e.kind().to_string())
            .collect()
    }
}

#[async_trait]
impl Agent for Recorder {
    fn state(&self) -> &AgentState {
        &self.state
    }

    async fn initialize(&self) -> Result<()> {
        self.state.set_status(AgentStatus::Idle).await;
        Ok(())
    }

    async fn process_message(&self, envelope: Envelope) -> Result<()> {
        self.received.lock().unwrap().push(envelope);
        Ok(())
    }
}

pub(crate) fn engine_with(
    bus: &MessageBus,
    config: WorkflowConfig,
    customize: impl FnOnce(WorkflowEngineBuilder) -> WorkflowEngineBuilder,
) -> WorkflowEngine {
    let outbox = Outbox::new(WORKFLOW_AGENT_ID, bus.clone());
    customize(WorkflowEngine::builder(outbox, config)).build()
}

/// Poll until the workflow reaches `status`; false after two seconds.
pub(crate) async fn wait_for_status(engine: &WorkflowEngine, workflow_id: &str, status: WorkflowStatus) -> bool {
    for _ in 0..200 {
        if engine.get_workflow(workflow_id).await.map(|w| w.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
