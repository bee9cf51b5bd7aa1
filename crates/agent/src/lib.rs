pub mod agent;
pub mod bus;
pub mod orchestrator;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{Agent, AgentContext, AgentFactory, AgentState, Outbox};
pub use bus::{BusEvent, BusStats, MessageBus};
pub use orchestrator::Orchestrator;
