use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bizflow_core::{Error, RunTrigger, Workflow};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EngineInner, WorkflowEngine};
use crate::schedule::Schedule;

/// Spawn one timer task per `Schedule` trigger of `workflow`. Each task
/// sleeps until the next fire time and starts the workflow; the task ends
/// on its own once the engine is dropped.
pub(crate) fn arm_schedules(engine: &WorkflowEngine, workflow: &Workflow) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for expression in workflow.schedule_expressions() {
        let schedule = match Schedule::parse(expression) {
            Ok(s) => s,
            Err(e) => {
                warn!(workflow_id = %workflow.id, error = %e, "Schedule trigger not armed");
                continue;
            }
        };
        let weak = Arc::downgrade(&engine.inner);
        let workflow_id = workflow.id.clone();
        let expression = expression.to_string();
        handles.push(tokio::spawn(schedule_loop(weak, workflow_id, expression, schedule)));
    }
    handles
}

async fn schedule_loop(engine: Weak<EngineInner>, workflow_id: String, expression: String, schedule: Schedule) {
    info!(workflow_id = %workflow_id, schedule = %expression, "Schedule trigger armed");
    loop {
        let Some(wait) = schedule.delay_from(Utc::now()) else {
            info!(workflow_id = %workflow_id, schedule = %expression, "Schedule has no further fire times");
            return;
        };
        tokio::time::sleep(wait).await;

        let Some(inner) = engine.upgrade() else {
            return;
        };
        let live = WorkflowEngine { inner };
        match live
            .start_with_trigger(&workflow_id, HashMap::new(), RunTrigger::Schedule)
            .await
        {
            Ok(run_id) => debug!(workflow_id = %workflow_id, run_id = %run_id, "Scheduled run started"),
            Err(Error::AlreadyRunning(_)) => {
                info!(workflow_id = %workflow_id, "Scheduled run skipped, previous run still in progress")
            }
            Err(e) => warn!(workflow_id = %workflow_id, error = %e, "Scheduled run failed to start"),
        }
    }
}
