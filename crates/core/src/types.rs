use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of an agent instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Constructed but `initialize()` has not completed.
    Initializing,
    Idle,
    Busy,
    /// Unhandled fault; picked up by the orchestrator's health check.
    Error,
    /// Shut down and unregistered. Must not receive further messages.
    Terminated,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Initializing => write!(f, "initializing"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Point-in-time copy of an agent record, as reported in status responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: String,
    pub status: AgentStatus,
    pub last_active: DateTime<Utc>,
    pub error_count: u32,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Per-type configuration handed to an agent factory.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting(mut self, key: &str, value: serde_json::Value) -> Self {
        self.settings.insert(key.to_string(), value);
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.settings.get(key).and_then(|v| v.as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_status_serializes_as_tag() {
        let s = serde_json::to_string(&AgentStatus::Initializing).unwrap();
        assert_eq!(s, "\"INITIALIZING\"");
        assert_eq!(AgentStatus::Error.to_string(), "error");
    }

    #[test]
    fn test_agent_config_settings() {
        let config = AgentConfig::new()
            .with_setting("channel", json!("email"))
            .with_setting("limit", json!(5));
        assert_eq!(config.get_str("channel"), Some("email"));
        assert_eq!(config.get_u64("limit"), Some(5));
        assert!(config.get_str("missing").is_none());
    }
}
