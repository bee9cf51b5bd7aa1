use bizflow_core::{Config, Paths};

/// Show the current configuration as pretty-printed JSON.
pub async fn show() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let json = serde_json::to_value(&config)?;

    println!();
    println!("📋 Current Configuration");
    println!(
        "  File: {}{}",
        paths.config_file().display(),
        if paths.config_file().exists() { "" } else { " (not found, showing defaults)" }
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// Write the default configuration and create the workflows directory.
pub async fn init(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let written = write_defaults(&paths, force)?;
    if written {
        println!("✓ Wrote {}", paths.config_file().display());
        println!("  Workflows directory: {}", paths.workflows_dir().display());
    } else {
        println!(
            "Config already exists at {}. Use --force to overwrite.",
            paths.config_file().display()
        );
    }
    Ok(())
}

fn write_defaults(paths: &Paths, force: bool) -> anyhow::Result<bool> {
    let config_path = paths.config_file();
    if config_path.exists() && !force {
        return Ok(false);
    }
    paths.ensure_dirs()?;
    Config::default().save(&config_path)?;
    Ok(true)
}
