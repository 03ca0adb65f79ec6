//! Daemon configuration.
//!
//! Loaded from YAML (path via `SESSIOND_CONFIG`, falling back to the
//! packaged default path), with every knob carrying a usable default so
//! the daemon also runs configless.

use coregw_proto::PolicyRule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default config path when `SESSIOND_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/coregw/coregw-sessiond.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Recognized daemon options plus the static policy catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessiondConfig {
    /// How long a termination may wait for pipeline confirmation before
    /// it is forced through.
    pub session_force_termination_timeout_ms: u64,
    /// CWF only: grace period before terminating a session created
    /// without any monitoring quota.
    pub quota_exhaustion_termination_on_init_ms: u64,
    /// Delay before retrying a failed pipeline programming call.
    pub retry_timeout_ms: u64,
    /// Fraction of a grant consumed before a partial usage report.
    pub usage_reporting_threshold: f64,
    /// Terminate CWF sessions whose wallet runs out.
    pub terminate_on_wallet_exhaust: bool,
    /// Reactor tick interval for usage polling and update collection.
    pub poll_interval_ms: u64,
    /// Static rule catalog installed into the rule store at startup.
    pub static_rules: Vec<PolicyRule>,
}

impl Default for SessiondConfig {
    fn default() -> Self {
        SessiondConfig {
            session_force_termination_timeout_ms: 5000,
            quota_exhaustion_termination_on_init_ms: 30_000,
            retry_timeout_ms: 1000,
            usage_reporting_threshold: 0.8,
            terminate_on_wallet_exhaust: true,
            poll_interval_ms: 1000,
            static_rules: Vec::new(),
        }
    }
}

impl SessiondConfig {
    /// Load from a YAML file, falling back to defaults when the file is
    /// absent.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Config file {path} not found, using defaults");
                return Ok(SessiondConfig::default());
            }
            Err(source) => return Err(ConfigError::Io { path: path.to_string(), source }),
        };
        let config: SessiondConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.usage_reporting_threshold > 0.0 && self.usage_reporting_threshold <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "usage_reporting_threshold must be in (0, 1], got {}",
                self.usage_reporting_threshold
            )));
        }
        if self.session_force_termination_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "session_force_termination_timeout_ms must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        for rule in &self.static_rules {
            if rule.id.is_empty() {
                return Err(ConfigError::Validation(
                    "static rule with empty id in catalog".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessiondConfig::default();
        assert_eq!(config.session_force_termination_timeout_ms, 5000);
        assert_eq!(config.usage_reporting_threshold, 0.8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
session_force_termination_timeout_ms: 2500
usage_reporting_threshold: 0.9
static_rules:
  - id: catalog-rule-1
    priority: 10
    rating_group: 1
    service_identifier: null
    monitoring_key: ""
    tracking_type: OnlyOcs
    qos: null
    redirect: null
    flow_list: []
"#;
        let config: SessiondConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.session_force_termination_timeout_ms, 2500);
        // unspecified options keep their defaults
        assert_eq!(config.retry_timeout_ms, 1000);
        assert_eq!(config.static_rules.len(), 1);
        assert_eq!(config.static_rules[0].id, "catalog-rule-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_threshold() {
        let mut config = SessiondConfig::default();
        config.usage_reporting_threshold = 0.0;
        assert!(config.validate().is_err());
        config.usage_reporting_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = SessiondConfig::load("/nonexistent/coregw-sessiond.yaml").unwrap();
        assert_eq!(config.poll_interval_ms, 1000);
    }
}
