use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bizflow_core::{
    AgentConfig, AgentSnapshot, AgentStatus, Envelope, Error, Message, OrchestratorConfig,
    OutgoingMessage, Priority, Result, ORCHESTRATOR_ID,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::agent::{Agent, AgentContext, AgentFactory, AgentState};
use crate::bus::MessageBus;

struct AgentRegistration {
    factory: AgentFactory,
    config: AgentConfig,
}

/// Supervises agent lifecycles: starts agents from registered factories,
/// stops them, reacts to reported faults and restarts agents stuck in
/// `Error`. Itself an agent registered on the bus as `orchestrator`.
pub struct Orchestrator {
    state: AgentState,
    bus: MessageBus,
    registry: RwLock<HashMap<String, AgentRegistration>>,
    active: RwLock<HashMap<String, Arc<dyn Agent>>>,
    health_interval: Duration,
}

impl Orchestrator {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            state: AgentState::new(
                ORCHESTRATOR_ID,
                &["agent_lifecycle", "health_monitoring"],
                bus.clone(),
            ),
            bus,
            registry: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            health_interval: Duration::from_secs(60),
        }
    }

    pub fn from_config(bus: MessageBus, config: &OrchestratorConfig) -> Self {
        Self::new(bus).with_health_interval(Duration::from_secs(
            config.health_check_interval_secs.max(1),
        ))
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    /// Register (or replace) the factory for an agent type.
    pub async fn register_agent_type(&self, agent_id: &str, factory: AgentFactory, config: AgentConfig) {
        let replaced = self
            .registry
            .write()
            .await
            .insert(agent_id.to_string(), AgentRegistration { factory, config })
            .is_some();
        if replaced {
            warn!(agent_id = %agent_id, "Agent type re-registered, factory replaced");
        } else {
            debug!(agent_id = %agent_id, "Agent type registered");
        }
    }

    pub async fn registered_types(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registry.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Initialize the orchestrator and put it on the bus.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.initialize().await?;
        self.bus.register_agent(self.clone()).await
    }

    pub async fn start_agent(&self, agent_id: &str) -> Result<()> {
        let (factory, config) = {
            let registry = self.registry.read().await;
            let reg = registry
                .get(agent_id)
                .ok_or_else(|| Error::UnknownAgentType(agent_id.to_string()))?;
            (reg.factory.clone(), reg.config.clone())
        };
        if self.active.read().await.contains_key(agent_id) {
            return Err(Error::AlreadyRunning(agent_id.to_string()));
        }

        let agent = factory(AgentContext {
            bus: self.bus.clone(),
            config,
        });
        if agent.id() != agent_id {
            warn!(agent_type = %agent_id, agent_id = %agent.id(), "Factory produced an agent with a different id");
        }
        agent.initialize().await?;

        {
            let mut active = self.active.write().await;
            if active.contains_key(agent_id) {
                drop(active);
                agent.state().set_status(AgentStatus::Terminated).await;
                return Err(Error::AlreadyRunning(agent_id.to_string()));
            }
            active.insert(agent_id.to_string(), agent.clone());
        }
        // The losing instance never reached the bus, so it must not call
        // shutdown (that would unregister whoever owns the id).
        if let Err(e) = self.bus.register_agent(agent.clone()).await {
            self.active.write().await.remove(agent_id);
            agent.state().set_status(AgentStatus::Terminated).await;
            return Err(e);
        }

        info!(agent_id = %agent_id, "Agent started");
        self.state.incr_metric("agents_started", 1.0).await;
        self.state
            .broadcast(
                OutgoingMessage::new(Message::AgentStarted {
                    agent_id: agent_id.to_string(),
                })
                .priority(Priority::High),
            )
            .await;
        Ok(())
    }

    pub async fn stop_agent(&self, agent_id: &str) -> Result<()> {
        let agent = self
            .active
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| Error::NotRunning(agent_id.to_string()))?;

        if let Err(e) = agent.shutdown().await {
            warn!(agent_id = %agent_id, error = %e, "Agent shutdown reported an error");
        }
        self.bus.unregister_agent(agent.id()).await;

        info!(agent_id = %agent_id, "Agent stopped");
        self.state
            .broadcast(
                OutgoingMessage::new(Message::AgentStopped {
                    agent_id: agent_id.to_string(),
                })
                .priority(Priority::High),
            )
            .await;
        Ok(())
    }

    /// Stop then start; the restarted agent is a fresh factory instance.
    pub async fn restart_agent(&self, agent_id: &str) -> Result<()> {
        self.stop_agent(agent_id).await?;
        self.state.incr_metric("restarts", 1.0).await;
        self.start_agent(agent_id).await
    }

    /// Give the agent a chance to recover locally; restart it if it can't.
    pub async fn handle_agent_error(&self, agent_id: &str, error: &str) -> Result<()> {
        let agent = self
            .get_agent(agent_id)
            .await
            .ok_or_else(|| Error::NotRunning(agent_id.to_string()))?;

        warn!(agent_id = %agent_id, error = %error, "Agent error reported");
        if let Err(e) = agent.handle_error(error).await {
            warn!(agent_id = %agent_id, error = %e, "Local recovery failed, restarting agent");
            self.restart_agent(agent_id).await?;
        }
        Ok(())
    }

    /// Restart every active agent currently in `Error`. Returns how many were
    /// restarted successfully.
    pub async fn run_health_checks(&self) -> usize {
        let agents: Vec<(String, Arc<dyn Agent>)> = self
            .active
            .read()
            .await
            .iter()
            .map(|(id, agent)| (id.clone(), agent.clone()))
            .collect();

        let mut restarted = 0;
        for (id, agent) in agents {
            if agent.status().await != AgentStatus::Error {
                continue;
            }
            info!(agent_id = %id, "Health check found agent in error state, restarting");
            match self.restart_agent(&id).await {
                Ok(()) => restarted += 1,
                Err(e) => error!(agent_id = %id, error = %e, "Health check restart failed"),
            }
        }
        restarted
    }

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.health_interval.as_secs(), "Health monitor started");

        let mut interval = tokio::time::interval(self.health_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let restarted = self.run_health_checks().await;
                    if restarted > 0 {
                        info!(restarted, "Health check restarted agents");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Health monitor shutting down");
                    break;
                }
            }
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<Arc<dyn Agent>> {
        self.active.read().await.get(agent_id).cloned()
    }

    pub async fn active_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn agent_status_snapshot(&self) -> Vec<AgentSnapshot> {
        let agents: Vec<Arc<dyn Agent>> = self.active.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(agents.len());
        for agent in agents {
            snapshots.push(agent.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }
}

#[async_trait]
impl Agent for Orchestrator {
    fn state(&self) -> &AgentState {
        &self.state
    }

    async fn initialize(&self) -> Result<()> {
        self.state.set_status(AgentStatus::Idle).await;
        info!("Orchestrator initialized");
        Ok(())
    }

    async fn process_message(&self, envelope: Envelope) -> Result<()> {
        self.state.incr_metric("messages_processed", 1.0).await;
        match &envelope.payload {
            Message::StartAgent { agent_id } => {
                if let Err(e) = self.start_agent(agent_id).await {
                    warn!(agent_id = %agent_id, error = %e, "START_AGENT failed");
                }
            }
            Message::StopAgent { agent_id } => {
                if let Err(e) = self.stop_agent(agent_id).await {
                    warn!(agent_id = %agent_id, error = %e, "STOP_AGENT failed");
                }
            }
            Message::AgentError { agent_id, error } => {
                if let Err(e) = self.handle_agent_error(agent_id, error).await {
                    warn!(agent_id = %agent_id, error = %e, "AGENT_ERROR handling failed");
                }
            }
            Message::GetAgentStatus => {
                let agents = self.agent_status_snapshot().await;
                self.state
                    .outbox()
                    .reply(&envelope, Message::AgentStatusResponse { agents })
                    .await;
            }
            Message::AgentStarted { .. } | Message::AgentStopped { .. } => {}
            _ => {
                debug!(kind = %envelope.kind(), from = %envelope.sender, "Orchestrator ignoring message");
            }
        }
        self.state.touch().await;
        Ok(())
    }

    /// Stop every active agent, then leave the bus.
    async fn shutdown(&self) -> Result<()> {
        for agent_id in self.active_agents().await {
            if let Err(e) = self.stop_agent(&agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Failed to stop agent during shutdown");
            }
        }
        self.state.terminate().await;
        info!("Orchestrator shut down");
        Ok(())
    }
}
