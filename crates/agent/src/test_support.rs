use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bizflow_core::{AgentStatus, Envelope, Error, Result};

use crate::agent::{Agent, AgentState};
use crate::bus::MessageBus;

/// Records every envelope it is handed.
pub(crate) struct ProbeAgent {
    state: AgentState,
    received: Mutex<Vec<Envelope>>,
    delay: Duration,
    fail: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
    /// Kind of each envelope with the number of deliveries completed before
    /// it arrived.
    arrivals: Mutex<Vec<(String, usize)>>,
}

impl ProbeAgent {
    fn build(id: &str, bus: &MessageBus, delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            state: AgentState::new(id, &["probe"], bus.clone()),
            received: Mutex::new(Vec::new()),
            delay,
            fail,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            arrivals: Mutex::new(Vec::new()),
        })
    }

    pub fn new(id: &str, bus: &MessageBus) -> Arc<Self> {
        Self::build(id, bus, Duration::ZERO, false)
    }

    pub fn slow(id: &str, bus: &MessageBus, delay: Duration) -> Arc<Self> {
        Self::build(id, bus, delay, false)
    }

    pub fn failing(id: &str, bus: &MessageBus) -> Arc<Self> {
        Self::build(id, bus, Duration::ZERO, true)
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

    pub fn max_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Arrivals grouped into dispatch batches. Only meaningful for a slow
    /// probe, where a whole batch arrives before any of it completes.
    pub fn batches(&self) -> Vec<Vec<String>> {
        let mut batches: Vec<(usize, Vec<String>)> = Vec::new();
        for (kind, completed_before) in self.arrivals.lock().unwrap().iter() {
            match batches.last_mut() {
                Some((mark, kinds)) if mark == completed_before => kinds.push(kind.clone()),
                _ => batches.push((*completed_before, vec![kind.clone()])),
            }
        }
        batches.into_iter().map(|(_, kinds)| kinds).collect()
    }
}

#[async_trait]
impl Agent for ProbeAgent {
    fn state(&self) -> &AgentState {
        &self.state
    }

    async fn initialize(&self) -> Result<()> {
        self.state.set_status(AgentStatus::Idle).await;
        Ok(())
    }

    async fn process_message(&self, envelope: Envelope) -> Result<()> {
        self.arrivals
            .lock()
            .unwrap()
            .push((envelope.kind().to_string(), self.completed.load(Ordering::SeqCst)));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.received.lock().unwrap().push(envelope);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Agent("probe failure".to_string()));
        }
        Ok(())
    }
}
