use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bizflow_core::{BusConfig, Envelope, Error, OutgoingMessage, Result, SYSTEM_SENDER};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::agent::Agent;

/// Delivery outcomes that did not reach a successful `process_message`.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The recipient returned an error (or panicked) while processing.
    MessageError { envelope: Envelope, error: String },
    /// No agent with the recipient id was registered at delivery time.
    Undeliverable { envelope: Envelope },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub queued: usize,
    pub agents: usize,
}

struct BusInner {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
    queue: Mutex<Vec<Envelope>>,
    /// `true` while a drain task owns the queue.
    draining: watch::Sender<bool>,
    events: broadcast::Sender<BusEvent>,
    batch_size: usize,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Priority-ordered, batched delivery of envelopes to registered agents.
///
/// Submitting a message only enqueues it; a single drain task per bus pulls
/// batches (highest priority first, FIFO within a priority) and delivers each
/// batch concurrently. The drain exits when it finds the queue empty and the
/// next submission starts a new one.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(batch_size: usize) -> Self {
        Self::with_event_buffer(batch_size, 256)
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::with_event_buffer(config.batch_size, config.event_buffer)
    }

    fn with_event_buffer(batch_size: usize, event_buffer: usize) -> Self {
        let (draining, _) = watch::channel(false);
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            inner: Arc::new(BusInner {
                agents: RwLock::new(HashMap::new()),
                queue: Mutex::new(Vec::new()),
                draining,
                events,
                batch_size: batch_size.max(1),
                enqueued: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> Result<()> {
        let id = agent.id().to_string();
        let mut agents = self.inner.agents.write().await;
        if agents.contains_key(&id) {
            return Err(Error::DuplicateAgent(id));
        }
        agents.insert(id.clone(), agent);
        info!(agent_id = %id, "Agent registered on bus");
        Ok(())
    }

    /// Remove an agent. Returns false when it was not registered.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.inner.agents.write().await.remove(agent_id).is_some();
        if removed {
            info!(agent_id = %agent_id, "Agent unregistered from bus");
        }
        removed
    }

    pub async fn is_registered(&self, agent_id: &str) -> bool {
        self.inner.agents.read().await.contains_key(agent_id)
    }

    pub async fn registered_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stamp and enqueue one message. Returns the completed envelope as soon
    /// as it is queued; delivery happens on the drain task.
    pub async fn send_message(&self, msg: impl Into<OutgoingMessage>) -> Envelope {
        let envelope = msg.into().complete();
        debug!(
            id = %envelope.id,
            kind = %envelope.kind(),
            from = %envelope.sender,
            to = %envelope.recipient,
            priority = ?envelope.priority,
            "Message enqueued"
        );
        self.enqueue(vec![envelope.clone()]).await;
        envelope
    }

    /// Enqueue one copy of `msg` per registered agent except the sender.
    pub async fn broadcast(&self, msg: impl Into<OutgoingMessage>) -> Vec<Envelope> {
        let msg = msg.into();
        let sender = msg
            .sender
            .clone()
            .unwrap_or_else(|| SYSTEM_SENDER.to_string());
        let recipients: Vec<String> = self
            .inner
            .agents
            .read()
            .await
            .keys()
            .filter(|id| **id != sender)
            .cloned()
            .collect();

        let envelopes: Vec<Envelope> = recipients
            .iter()
            .map(|id| msg.clone().sender(&sender).to(id).complete())
            .collect();
        debug!(
            kind = %msg.payload.kind(),
            from = %sender,
            recipients = envelopes.len(),
            "Broadcast enqueued"
        );
        if !envelopes.is_empty() {
            self.enqueue(envelopes.clone()).await;
        }
        envelopes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the queue is empty and no batch is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.draining.subscribe();
        let _ = rx.wait_for(|draining| !*draining).await;
    }

    pub async fn stats(&self) -> BusStats {
        BusStats {
            enqueued: self.inner.enqueued.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            queued: self.inner.queue.lock().await.len(),
            agents: self.inner.agents.read().await.len(),
        }
    }

    async fn enqueue(&self, envelopes: Vec<Envelope>) {
        let count = envelopes.len() as u64;
        self.inner.queue.lock().await.extend(envelopes);
        self.inner.enqueued.fetch_add(count, Ordering::Relaxed);

        let claimed = self.inner.draining.send_if_modified(|draining| {
            if *draining {
                false
            } else {
                *draining = true;
                true
            }
        });
        if claimed {
            let bus = self.clone();
            tokio::spawn(async move { bus.drain().await });
        }
    }

    async fn drain(&self) {
        loop {
            let batch: Vec<Envelope> = {
                let mut queue = self.inner.queue.lock().await;
                if queue.is_empty() {
                    self.inner.draining.send_replace(false);
                    return;
                }
                // Stable: FIFO is kept within a priority level.
                queue.sort_by(|a, b| b.priority.cmp(&a.priority));
                let take = self.inner.batch_size.min(queue.len());
                queue.drain(..take).collect()
            };
            debug!(size = batch.len(), "Dispatching batch");
            join_all(batch.into_iter().map(|envelope| self.deliver(envelope))).await;
        }
    }

    async fn deliver(&self, envelope: Envelope) {
        let agent = self
            .inner
            .agents
            .read()
            .await
            .get(&envelope.recipient)
            .cloned();

        let Some(agent) = agent else {
            error!(
                id = %envelope.id,
                kind = %envelope.kind(),
                to = %envelope.recipient,
                "Recipient not registered, message dropped"
            );
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            let _ = self.inner.events.send(BusEvent::Undeliverable { envelope });
            return;
        };

        let outcome = AssertUnwindSafe(agent.process_message(envelope.clone()))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "agent panicked while processing message".to_string(),
        };

        warn!(
            id = %envelope.id,
            kind = %envelope.kind(),
            to = %envelope.recipient,
            error = %error,
            "Message processing failed"
        );
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .inner
            .events
            .send(BusEvent::MessageError { envelope, error });
    }
}
