use std::path::{Path, PathBuf};

use bizflow_core::{Workflow, WorkflowType};
use bizflow_workflow::graph;

/// Parse a workflow definition file.
pub fn read_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let workflow: Workflow = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
    Ok(workflow)
}

/// `*.json` files directly under `dir`, sorted by name. A missing directory
/// yields nothing.
pub fn workflow_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub async fn run(file: &Path) -> anyhow::Result<()> {
    let workflow = read_workflow(file)?;
    if let Err(e) = graph::validate(&workflow) {
        println!("✗ {}", file.display());
        anyhow::bail!("{}", e);
    }

    println!("✓ {} ({})", workflow.name, workflow.id);
    println!("  Type:     {}", type_label(workflow.workflow_type));
    println!("  Steps:    {}", workflow.steps.len());
    println!("  Triggers: {}", workflow.triggers.len());

    let waves = graph::execution_waves(&workflow.steps)
        .map_err(|stuck| anyhow::anyhow!("Unresolvable steps: {}", stuck.join(", ")))?;
    if !waves.is_empty() {
        println!();
        println!("Execution plan:");
        for (i, wave) in waves.iter().enumerate() {
            println!("  {}. {}", i + 1, wave.join(", "));
        }
    }
    Ok(())
}

fn type_label(workflow_type: WorkflowType) -> &'static str {
    match workflow_type {
        WorkflowType::Manual => "manual",
        WorkflowType::Scheduled => "scheduled",
        WorkflowType::EventDriven => "event-driven",
        WorkflowType::Hybrid => "hybrid",
    }
}
