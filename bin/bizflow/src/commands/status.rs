use bizflow_core::{Config, Paths};

use super::validate::{read_workflow, workflow_files};

pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!("bizflow status");
    println!("==============");
    println!();

    let config_path = paths.config_file();
    let config_exists = config_path.exists();
    println!(
        "Config:    {} {}",
        config_path.display(),
        if config_exists { "✓" } else { "✗ (not found, using defaults)" }
    );

    let config = Config::load_or_default(&paths)?;
    let workflows_dir = config.workflows_dir(&paths);
    println!(
        "Workflows: {} {}",
        workflows_dir.display(),
        if workflows_dir.exists() { "✓" } else { "✗ (not found)" }
    );
    println!();

    println!("Bus:          batch size {}", config.bus.batch_size);
    println!(
        "Orchestrator: health check every {}s",
        config.orchestrator.health_check_interval_secs
    );
    if !config.orchestrator.auto_start.is_empty() {
        println!("              auto-start {}", config.orchestrator.auto_start.join(", "));
    }
    println!(
        "Engine:       validation {}, history {} runs, communications via '{}'",
        if config.workflow.validate_on_create { "on" } else { "off" },
        config.workflow.history_limit,
        config.workflow.communications_agent
    );
    println!();

    let files = workflow_files(&workflows_dir)?;
    if files.is_empty() {
        println!("No workflow definitions found.");
    } else {
        println!("Workflow definitions:");
        for file in files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match read_workflow(&file) {
                Ok(wf) => println!("  ✓ {:<24} {} ({} steps)", name, wf.id, wf.steps.len()),
                Err(e) => println!("  ✗ {:<24} {}", name, e),
            }
        }
    }

    if !config_exists {
        println!();
        println!("Run `bizflow config init` to create a configuration file.");
    }
    Ok(())
}
