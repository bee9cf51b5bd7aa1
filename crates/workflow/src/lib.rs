pub mod action;
pub mod agent;
pub mod condition;
pub mod engine;
pub mod graph;
pub mod schedule;
mod triggers;

#[cfg(test)]
pub(crate) mod test_support;

pub use action::{ActionContext, ActionFn, ActionHandler, ActionRegistry, CommunicationHandler, FunctionHandler};
pub use agent::{WorkflowAgent, WORKFLOW_AGENT_ID};
pub use condition::{ConditionEvaluator, VariableConditionEvaluator};
pub use engine::{WorkflowEngine, WorkflowEngineBuilder};
pub use schedule::Schedule;
