use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bizflow_agent::Outbox;
use bizflow_core::{ActionKind, CommunicationChannel, Error, Message, OutgoingMessage, Result, StepAction};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::debug;

/// What an action sees of the run it belongs to.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub workflow_id: String,
    pub step_id: String,
    /// Workflow variables merged with the run's variables.
    pub variables: HashMap<String, Value>,
    /// 1-based attempt number.
    pub attempt: u32,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, action: &StepAction, ctx: &ActionContext) -> Result<Value>;
}

/// Dispatches a step action to the handler registered for its kind.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ActionKind, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn has_handler(&self, kind: ActionKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub async fn execute(&self, action: &StepAction, ctx: &ActionContext) -> Result<Value> {
        let kind = action.kind();
        let handler = self
            .handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Action(format!("no handler registered for {} actions", kind)))?;
        debug!(
            workflow_id = %ctx.workflow_id,
            step_id = %ctx.step_id,
            kind = %kind,
            attempt = ctx.attempt,
            "Executing action"
        );
        handler.execute(action, ctx).await
    }
}

/// Turns `Email` and `Notification` actions into `SEND_COMMUNICATION`
/// messages for the communications agent. `{{name}}` placeholders are
/// filled from the run variables.
pub struct CommunicationHandler {
    outbox: Outbox,
    recipient: String,
}

impl CommunicationHandler {
    pub fn new(outbox: Outbox, recipient: &str) -> Self {
        Self {
            outbox,
            recipient: recipient.to_string(),
        }
    }
}

#[async_trait]
impl ActionHandler for CommunicationHandler {
    async fn execute(&self, action: &StepAction, ctx: &ActionContext) -> Result<Value> {
        let payload = match action {
            StepAction::Email { to, subject, body } => Message::SendCommunication {
                channel: CommunicationChannel::Email,
                to: render_template(to, &ctx.variables),
                subject: Some(render_template(subject, &ctx.variables)),
                body: render_template(body, &ctx.variables),
            },
            StepAction::Notification { channel, message } => Message::SendCommunication {
                channel: CommunicationChannel::Notification,
                to: render_template(channel, &ctx.variables),
                subject: None,
                body: render_template(message, &ctx.variables),
            },
            other => {
                return Err(Error::Action(format!(
                    "communication handler cannot run {} actions",
                    other.kind()
                )))
            }
        };

        let envelope = self
            .outbox
            .send(OutgoingMessage::new(payload).to(&self.recipient))
            .await;
        Ok(json!({ "messageId": envelope.id, "recipient": envelope.recipient }))
    }
}

pub type ActionFn = Arc<dyn Fn(Value, HashMap<String, Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Registry of named async functions for `Function` actions. Each function
/// receives the action's `args` and the run variables.
#[derive(Default, Clone)]
pub struct FunctionHandler {
    functions: HashMap<String, ActionFn>,
}

impl FunctionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Value, HashMap<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let f: ActionFn = Arc::new(move |args: Value, vars: HashMap<String, Value>| f(args, vars).boxed());
        self.functions.insert(name.to_string(), f);
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ActionHandler for FunctionHandler {
    async fn execute(&self, action: &StepAction, ctx: &ActionContext) -> Result<Value> {
        let StepAction::Function { name, args } = action else {
            return Err(Error::Action(format!(
                "function handler cannot run {} actions",
                action.kind()
            )));
        };
        let f = self
            .functions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Action(format!("unknown function '{}'", name)))?;
        f(args.clone(), ctx.variables.clone()).await
    }
}

/// Replace `{{name}}` with the variable's value. Unknown names are left as
/// written.
pub fn render_template(template: &str, variables: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = after[..end].trim();
        match variables.get(key) {
            Some(Value::String(s)) => out.push_str(s),
            Some(value) => out.push_str(&value.to_string()),
            None => out.push_str(&rest[start..start + end + 4]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}
