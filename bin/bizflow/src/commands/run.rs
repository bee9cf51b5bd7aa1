use std::path::PathBuf;
use std::sync::Arc;

use bizflow_agent::{Agent, BusEvent, MessageBus, Orchestrator};
use bizflow_core::{AgentConfig, Config, Error, Message, OutgoingMessage, Paths};
use bizflow_workflow::{WorkflowAgent, WORKFLOW_AGENT_ID};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::validate::{read_workflow, workflow_files};
use crate::communications::LogCommunicationsAgent;

pub async fn run(workflows_override: Option<PathBuf>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let workflows_dir = workflows_override.unwrap_or_else(|| config.workflows_dir(&paths));

    let bus = MessageBus::from_config(&config.bus);
    let orchestrator = Arc::new(Orchestrator::from_config(bus.clone(), &config.orchestrator));
    orchestrator.start().await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let events_handle = {
        let events = bus.subscribe();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(log_bus_events(events, shutdown_rx))
    };

    let comms_id = config.workflow.communications_agent.clone();
    orchestrator
        .register_agent_type(
            &comms_id,
            LogCommunicationsAgent::factory(&comms_id),
            AgentConfig::new(),
        )
        .await;
    orchestrator
        .register_agent_type(
            WORKFLOW_AGENT_ID,
            WorkflowAgent::factory(config.workflow.clone()),
            AgentConfig::new(),
        )
        .await;

    let mut boot = vec![comms_id.clone(), WORKFLOW_AGENT_ID.to_string()];
    for id in &config.orchestrator.auto_start {
        if !boot.contains(id) {
            boot.push(id.clone());
        }
    }
    for id in &boot {
        match orchestrator.start_agent(id).await {
            Ok(()) | Err(Error::AlreadyRunning(_)) => {}
            Err(e) => error!(agent_id = %id, error = %e, "Failed to start agent"),
        }
    }

    let mut loaded = 0;
    for file in workflow_files(&workflows_dir)? {
        match read_workflow(&file) {
            Ok(workflow) => {
                info!(workflow_id = %workflow.id, file = %file.display(), "Loading workflow definition");
                bus.send_message(
                    OutgoingMessage::new(Message::CreateWorkflow {
                        workflow: Box::new(workflow),
                    })
                    .to(WORKFLOW_AGENT_ID),
                )
                .await;
                loaded += 1;
            }
            Err(e) => warn!(error = %e, "Skipping workflow definition"),
        }
    }
    bus.wait_idle().await;

    let health_handle = {
        let shutdown_rx = shutdown_tx.subscribe();
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator.run_loop(shutdown_rx).await;
        })
    };

    info!(
        agents = ?orchestrator.active_agents().await,
        workflows = loaded,
        dir = %workflows_dir.display(),
        "bizflow running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());
    let _ = health_handle.await;

    orchestrator.shutdown().await?;
    bus.wait_idle().await;
    let _ = events_handle.await;

    let stats = bus.stats().await;
    info!(
        enqueued = stats.enqueued,
        delivered = stats.delivered,
        failed = stats.failed,
        dropped = stats.dropped,
        "bizflow stopped"
    );
    Ok(())
}

async fn log_bus_events(
    mut events: broadcast::Receiver<BusEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(BusEvent::MessageError { envelope, error }) => {
                    warn!(
                        kind = %envelope.kind(),
                        from = %envelope.sender,
                        to = %envelope.recipient,
                        error = %error,
                        "Message processing failed"
                    );
                }
                Ok(BusEvent::Undeliverable { envelope }) => {
                    warn!(
                        kind = %envelope.kind(),
                        from = %envelope.sender,
                        to = %envelope.recipient,
                        "Message undeliverable"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Bus event log lagging");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.recv() => break,
        }
    }
}
