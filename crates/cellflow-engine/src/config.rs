//! Engine configuration.
//!
//! [`EngineConfig::from_env`] reads `CELLFLOW_*` variables over the
//! defaults. An unset variable keeps the default; a set but unparsable one
//! is a configuration error.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cellflow_sql::CteStrategy;

use crate::error::EngineError;

pub const ENV_DB_PATH: &str = "CELLFLOW_DB_PATH";
pub const ENV_PROPAGATION_MODE: &str = "CELLFLOW_PROPAGATION_MODE";
pub const ENV_OUTBOX_BATCH: &str = "CELLFLOW_OUTBOX_BATCH";
pub const ENV_OUTBOX_POLL_MS: &str = "CELLFLOW_OUTBOX_POLL_MS";
pub const ENV_OUTBOX_MAX_ATTEMPTS: &str = "CELLFLOW_OUTBOX_MAX_ATTEMPTS";
pub const ENV_OUTBOX_STALE_SECS: &str = "CELLFLOW_OUTBOX_STALE_SECS";
pub const ENV_CTE_STRATEGY: &str = "CELLFLOW_CTE_STRATEGY";

/// When computed values are brought up to date after a record write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropagationMode {
    /// Within the mutating call.
    #[default]
    Sync,
    /// Later, by an outbox worker.
    Outbox,
}

impl fmt::Display for PropagationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PropagationMode::Sync => "sync",
            PropagationMode::Outbox => "outbox",
        })
    }
}

impl FromStr for PropagationMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(PropagationMode::Sync),
            "outbox" => Ok(PropagationMode::Outbox),
            other => Err(EngineError::Config(format!(
                "unknown propagation mode '{other}', expected 'sync' or 'outbox'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub db_path: String,
    pub propagation_mode: PropagationMode,
    /// Tasks claimed per worker batch.
    pub outbox_batch_size: usize,
    /// Sleep between polls when the queue is empty.
    pub outbox_poll_interval: Duration,
    /// Failed attempts after which a task is marked failed.
    pub outbox_max_attempts: u32,
    /// Age after which a claimed task is presumed abandoned.
    pub outbox_stale_after: Duration,
    pub cte_strategy: CteStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            db_path: "cellflow.db".to_string(),
            propagation_mode: PropagationMode::Sync,
            outbox_batch_size: 50,
            outbox_poll_interval: Duration::from_millis(500),
            outbox_max_attempts: 5,
            outbox_stale_after: Duration::from_secs(300),
            cte_strategy: CteStrategy::Join,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = EngineConfig::default();
        if let Some(path) = lookup(ENV_DB_PATH) {
            config.db_path = path;
        }
        if let Some(mode) = lookup(ENV_PROPAGATION_MODE) {
            config.propagation_mode = mode.parse()?;
        }
        if let Some(batch) = lookup(ENV_OUTBOX_BATCH) {
            config.outbox_batch_size = parse_number(ENV_OUTBOX_BATCH, &batch)?;
            if config.outbox_batch_size == 0 {
                return Err(EngineError::Config(format!("{ENV_OUTBOX_BATCH} must be positive")));
            }
        }
        if let Some(ms) = lookup(ENV_OUTBOX_POLL_MS) {
            config.outbox_poll_interval = Duration::from_millis(parse_number(ENV_OUTBOX_POLL_MS, &ms)?);
        }
        if let Some(attempts) = lookup(ENV_OUTBOX_MAX_ATTEMPTS) {
            config.outbox_max_attempts = parse_number(ENV_OUTBOX_MAX_ATTEMPTS, &attempts)?;
            if config.outbox_max_attempts == 0 {
                return Err(EngineError::Config(format!(
                    "{ENV_OUTBOX_MAX_ATTEMPTS} must be positive"
                )));
            }
        }
        if let Some(secs) = lookup(ENV_OUTBOX_STALE_SECS) {
            config.outbox_stale_after = Duration::from_secs(parse_number(ENV_OUTBOX_STALE_SECS, &secs)?);
        }
        if let Some(strategy) = lookup(ENV_CTE_STRATEGY) {
            config.cte_strategy = strategy
                .parse()
                .map_err(|e| EngineError::Config(format!("{ENV_CTE_STRATEGY}: {e}")))?;
        }
        Ok(config)
    }

    /// In-memory configuration used by tests and one-off tools.
    pub fn in_memory() -> Self {
        EngineConfig {
            db_path: ":memory:".to_string(),
            ..EngineConfig::default()
        }
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, EngineError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| EngineError::Config(format!("{key}='{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_DB_PATH, "/tmp/cf.db"),
            (ENV_PROPAGATION_MODE, "Outbox"),
            (ENV_OUTBOX_BATCH, "7"),
            (ENV_OUTBOX_POLL_MS, "20"),
            (ENV_OUTBOX_MAX_ATTEMPTS, "2"),
            (ENV_OUTBOX_STALE_SECS, "9"),
            (ENV_CTE_STRATEGY, "correlated"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, "/tmp/cf.db");
        assert_eq!(config.propagation_mode, PropagationMode::Outbox);
        assert_eq!(config.outbox_batch_size, 7);
        assert_eq!(config.outbox_poll_interval, Duration::from_millis(20));
        assert_eq!(config.outbox_max_attempts, 2);
        assert_eq!(config.outbox_stale_after, Duration::from_secs(9));
        assert_eq!(config.cte_strategy, CteStrategy::Correlated);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        for vars in [
            [(ENV_PROPAGATION_MODE, "eventually")],
            [(ENV_OUTBOX_BATCH, "lots")],
            [(ENV_OUTBOX_BATCH, "0")],
            [(ENV_CTE_STRATEGY, "lateral")],
        ] {
            let err = EngineConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, EngineError::Config(_)), "{vars:?} gave {err}");
        }
    }
}
