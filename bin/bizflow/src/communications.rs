use std::sync::Arc;

use async_trait::async_trait;
use bizflow_agent::{Agent, AgentContext, AgentFactory, AgentState};
use bizflow_core::{AgentStatus, Envelope, Message, Result};
use tracing::{debug, info};

pub const COMMUNICATIONS_AGENT_ID: &str = "communications";

/// Delivery end of `SEND_COMMUNICATION`. The CLI runtime has no mail or
/// chat transport, so messages are written to the log.
pub struct LogCommunicationsAgent {
    state: AgentState,
    from: String,
}

impl LogCommunicationsAgent {
    pub fn new(id: &str, ctx: AgentContext) -> Self {
        let from = ctx.config.get_str("from").unwrap_or("bizflow").to_string();
        Self {
            state: AgentState::new(id, &["email", "notification"], ctx.bus),
            from,
        }
    }

    pub fn factory(id: &str) -> AgentFactory {
        let id = id.to_string();
        Arc::new(move |ctx: AgentContext| Arc::new(LogCommunicationsAgent::new(&id, ctx)) as Arc<dyn Agent>)
    }
}

#[async_trait]
impl Agent for LogCommunicationsAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    async fn initialize(&self) -> Result<()> {
        self.state.set_status(AgentStatus::Idle).await;
        Ok(())
    }

    async fn process_message(&self, envelope: Envelope) -> Result<()> {
        match envelope.payload {
            Message::SendCommunication {
                channel,
                to,
                subject,
                body,
            } => {
                info!(
                    channel = ?channel,
                    from = %self.from,
                    to = %to,
                    subject = subject.as_deref().unwrap_or(""),
                    requested_by = %envelope.sender,
                    "{}",
                    body
                );
                self.state.incr_metric("sent", 1.0).await;
                self.state.touch().await;
            }
            other => debug!(kind = %other.kind(), "Communications agent ignoring message"),
        }
        Ok(())
    }
}
