use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Envelopes dispatched concurrently per drain iteration.
    /// Set to 1 for strict priority ordering.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Capacity of the delivery-event broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_batch_size() -> usize {
    10
}

fn default_event_buffer() -> usize {
    256
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            event_buffer: default_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Agent type ids started when the runtime boots.
    #[serde(default)]
    pub auto_start: Vec<String>,
}

fn default_health_check_interval() -> u64 {
    60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            auto_start: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConfig {
    /// Reject workflows whose step graph is cyclic or references unknown
    /// steps. When off, such graphs fail at run time with a deadlock.
    #[serde(default = "default_validate_on_create")]
    pub validate_on_create: bool,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Agent id receiving SEND_COMMUNICATION messages for email and
    /// notification steps.
    #[serde(default = "default_communications_agent")]
    pub communications_agent: String,
    /// Directory of `*.json` workflow definitions loaded at startup.
    #[serde(default)]
    pub workflows_dir: Option<String>,
}

fn default_validate_on_create() -> bool {
    true
}

fn default_history_limit() -> usize {
    100
}

fn default_communications_agent() -> String {
    "communications".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            validate_on_create: default_validate_on_create(),
            history_limit: default_history_limit(),
            communications_agent: default_communications_agent(),
            workflows_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Workflow definition directory, falling back to `<base>/workflows`.
    pub fn workflows_dir(&self, paths: &Paths) -> PathBuf {
        match self.workflow.workflows_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => expand_home(dir),
            _ => paths.workflows_dir(),
        }
    }
}

fn expand_home(dir: &str) -> PathBuf {
    if let Some(rest) = dir.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bus.batch_size, 10);
        assert_eq!(cfg.orchestrator.health_check_interval_secs, 60);
        assert!(cfg.workflow.validate_on_create);
        assert_eq!(cfg.workflow.communications_agent, "communications");
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let raw = r#"{ "bus": { "batchSize": 1 }, "orchestrator": { "autoStart": ["workflow"] } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.bus.batch_size, 1);
        assert_eq!(cfg.bus.event_buffer, 256);
        assert_eq!(cfg.orchestrator.auto_start, vec!["workflow".to_string()]);
        assert_eq!(cfg.orchestrator.health_check_interval_secs, 60);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut cfg = Config::default();
        cfg.workflow.history_limit = 5;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.workflows_dir(&paths), dir.path().join("workflows"));
    }
}
