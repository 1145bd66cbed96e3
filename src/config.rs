use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::SupervisorError;
use crate::types::OperationClass;

/// Health thresholds. The default set applies to every agent type that has
/// no entry in [`SupervisorConfig::type_overrides`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub degraded_response_ms: u64,
    pub degraded_error_rate: f64,
    pub stuck_consecutive_errors: u32,
    pub heartbeat_interval_secs: u64,
    pub silence_multiplier: u32,
    pub memory_critical_pct: f64,
    pub cpu_critical_pct: f64,
    pub critical_sustain_secs: u64,
    pub recovery_response_ms: u64,
    pub recovery_error_rate: f64,
    pub recovery_resource_pct: f64,
    pub recovery_snapshots: u32,
    pub error_rate_window: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            degraded_response_ms: 5000,
            degraded_error_rate: 0.05,
            stuck_consecutive_errors: 3,
            heartbeat_interval_secs: 30,
            silence_multiplier: 2,
            memory_critical_pct: 90.0,
            cpu_critical_pct: 85.0,
            critical_sustain_secs: 180,
            recovery_response_ms: 3000,
            recovery_error_rate: 0.01,
            recovery_resource_pct: 70.0,
            recovery_snapshots: 3,
            error_rate_window: 20,
        }
    }
}

impl Thresholds {
    pub fn silence_limit(&self) -> chrono::Duration {
        let secs = self.heartbeat_interval_secs * self.silence_multiplier as u64;
        chrono::Duration::seconds(secs as i64)
    }

    pub fn critical_sustain(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.critical_sustain_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub tick_secs: u64,
    pub dependency_check_secs: u64,
    pub repetition_count: usize,
    pub repetition_window_secs: u64,
    pub max_dependency_depth: usize,
    pub api_call_timeout_secs: u64,
    pub storage_op_timeout_secs: u64,
    pub computation_timeout_secs: u64,
    pub spike_sigma: f64,
    pub spike_min_samples: usize,
    pub reraise_cooldown_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            dependency_check_secs: 60,
            repetition_count: 5,
            repetition_window_secs: 300,
            max_dependency_depth: 10,
            api_call_timeout_secs: OperationClass::ApiCall.default_timeout().as_secs(),
            storage_op_timeout_secs: OperationClass::StorageOp.default_timeout().as_secs(),
            computation_timeout_secs: OperationClass::Computation.default_timeout().as_secs(),
            spike_sigma: 3.0,
            spike_min_samples: 10,
            reraise_cooldown_secs: 300,
        }
    }
}

impl DetectionConfig {
    pub fn operation_timeout(&self, class: OperationClass) -> Duration {
        let secs = match class {
            OperationClass::ApiCall => self.api_call_timeout_secs,
            OperationClass::StorageOp => self.storage_op_timeout_secs,
            OperationClass::Computation => self.computation_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_backoff_secs: 60,
            max_backoff_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    pub risk_threshold: f64,
    pub min_samples: usize,
    pub interval_secs: u64,
    pub horizon_secs: u64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            risk_threshold: 0.8,
            min_samples: 10,
            interval_secs: 30,
            horizon_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub thresholds: Thresholds,
    pub type_overrides: HashMap<String, Thresholds>,
    pub detection: DetectionConfig,
    pub breaker: BreakerConfig,
    pub predictive: PredictiveConfig,
    pub history_capacity: usize,
    pub ingress_capacity: usize,
    pub api_port: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            type_overrides: HashMap::new(),
            detection: DetectionConfig::default(),
            breaker: BreakerConfig::default(),
            predictive: PredictiveConfig::default(),
            history_capacity: 500,
            ingress_capacity: 64,
            api_port: 8080,
        }
    }
}

impl SupervisorConfig {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load from a TOML or YAML file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing YAML config {}", path.display()))?,
            _ => toml::from_str(&raw)
                .with_context(|| format!("parsing TOML config {}", path.display()))?,
        };

        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(port) = env_parse::<u16>("WARDEN_API_PORT") {
            self.api_port = port;
        }
        if let Some(tick) = env_parse::<u64>("WARDEN_TICK_SECS") {
            self.detection.tick_secs = tick;
        }
        if let Some(interval) = env_parse::<u64>("WARDEN_HEARTBEAT_SECS") {
            self.thresholds.heartbeat_interval_secs = interval;
        }
        if let Some(capacity) = env_parse::<usize>("WARDEN_HISTORY_CAPACITY") {
            self.history_capacity = capacity;
        }
        self
    }

    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        let invalid = |msg: &str| Err(SupervisorError::Config(msg.to_string()));

        if self.breaker.failure_threshold == 0 {
            return invalid("breaker.failure_threshold must be at least 1");
        }
        if self.breaker.base_backoff_secs > self.breaker.max_backoff_secs {
            return invalid("breaker.base_backoff_secs exceeds breaker.max_backoff_secs");
        }
        if self.detection.tick_secs == 0 {
            return invalid("detection.tick_secs must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.predictive.risk_threshold) {
            return invalid("predictive.risk_threshold must be within 0..=1");
        }
        let named = std::iter::once(("default", &self.thresholds))
            .chain(self.type_overrides.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, thresholds) in named {
            if thresholds.recovery_snapshots == 0 || thresholds.heartbeat_interval_secs == 0 {
                return Err(SupervisorError::Config(format!(
                    "thresholds for {} need a non-zero heartbeat interval and recovery count",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn thresholds_for(&self, agent_type: &str) -> &Thresholds {
        self.type_overrides
            .get(agent_type)
            .unwrap_or(&self.thresholds)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_policy() {
        let config = SupervisorConfig::default();
        assert_eq!(config.thresholds.degraded_response_ms, 5000);
        assert_eq!(config.thresholds.silence_limit().num_seconds(), 60);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.history_capacity, 500);
        assert_eq!(
            config.detection.operation_timeout(OperationClass::StorageOp),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_type_override_lookup() {
        let mut config = SupervisorConfig::default();
        let slow = Thresholds {
            degraded_response_ms: 20_000,
            ..Thresholds::default()
        };
        config.type_overrides.insert("content_generator".to_string(), slow);

        assert_eq!(
            config.thresholds_for("content_generator").degraded_response_ms,
            20_000
        );
        assert_eq!(config.thresholds_for("code_writer").degraded_response_ms, 5000);
    }

    #[test]
    fn test_load_toml_partial() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "api_port = 9090\n[breaker]\nfailure_threshold = 7\n[type_overrides.batch]\nheartbeat_interval_secs = 120"
        )
        .unwrap();

        let config = SupervisorConfig::load(file.path()).unwrap();
        assert_eq!(config.api_port, 9090);
        assert_eq!(config.breaker.failure_threshold, 7);
        assert_eq!(config.breaker.base_backoff_secs, 60);
        assert_eq!(
            config.thresholds_for("batch").heartbeat_interval_secs,
            120
        );
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "detection:\n  tick_secs: 5\npredictive:\n  risk_threshold: 0.9").unwrap();

        let config = SupervisorConfig::load(file.path()).unwrap();
        assert_eq!(config.detection.tick_secs, 5);
        assert_eq!(config.predictive.risk_threshold, 0.9);
        assert_eq!(config.detection.repetition_count, 5);
    }

    #[test]
    fn test_validate() {
        assert!(SupervisorConfig::default().validate().is_ok());

        let mut config = SupervisorConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = SupervisorConfig::default();
        config.type_overrides.insert(
            "batch".to_string(),
            Thresholds {
                recovery_snapshots: 0,
                ..Thresholds::default()
            },
        );
        assert!(matches!(config.validate(), Err(SupervisorError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = SupervisorConfig::load(Path::new("/nonexistent/warden.toml"));
        assert!(result.is_err());
    }
}
