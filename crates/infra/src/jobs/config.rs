//! Job manager configuration.

use thiserror::Error;

pub const ENV_WORKERS: &str = "COURIER_JOB_WORKERS";
pub const ENV_CONDITIONS: &str = "COURIER_JOB_CONDITIONS";
pub const ENV_NAME: &str = "COURIER_JOB_NAME";
pub const ENV_RETAINED_STATUSES: &str = "COURIER_JOB_RETAINED_STATUSES";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Job manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobManagerConfig {
    /// Name used for thread names and logging
    pub name: String,
    /// Size of the worker pool; upper bound on concurrently running jobs
    pub workers: usize,
    /// Conditions reported satisfied at startup
    pub initial_conditions: Vec<String>,
    /// How many finished jobs keep a queryable status
    pub retained_statuses: usize,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            name: "job-manager".to_string(),
            workers: 4,
            initial_conditions: Vec::new(),
            retained_statuses: 10_000,
        }
    }
}

impl JobManagerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Zero is raised to one.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retained_statuses(mut self, retained: usize) -> Self {
        self.retained_statuses = retained;
        self
    }

    /// Worker pool size actually started. The field is public, so zero is
    /// still possible here and is raised to one.
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.initial_conditions.push(condition.into());
        self
    }

    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults plus whatever `lookup` returns for the
    /// `COURIER_JOB_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_NAME).filter(|n| !n.trim().is_empty()) {
            config.name = name.trim().to_string();
        }

        if let Some(raw) = lookup(ENV_WORKERS) {
            config.workers = match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_WORKERS,
                        value: raw,
                    });
                }
            };
        }

        if let Some(raw) = lookup(ENV_RETAINED_STATUSES) {
            config.retained_statuses =
                raw.trim()
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: ENV_RETAINED_STATUSES,
                        value: raw.clone(),
                    })?;
        }

        if let Some(raw) = lookup(ENV_CONDITIONS) {
            config.initial_conditions = raw
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }
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
    fn defaults_without_overrides() {
        let config = JobManagerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, JobManagerConfig::default());
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn reads_all_keys() {
        let config = JobManagerConfig::from_lookup(lookup(&[
            (ENV_NAME, "outbox"),
            (ENV_WORKERS, " 2 "),
            (ENV_CONDITIONS, "network, charging,,"),
            (ENV_RETAINED_STATUSES, "500"),
        ]))
        .unwrap();

        assert_eq!(config.name, "outbox");
        assert_eq!(config.workers, 2);
        assert_eq!(config.retained_statuses, 500);
        assert_eq!(config.initial_conditions, vec!["network", "charging"]);
    }

    #[test]
    fn rejects_bad_worker_count() {
        for bad in ["0", "-1", "many"] {
            let err = JobManagerConfig::from_lookup(lookup(&[(ENV_WORKERS, bad)])).unwrap_err();
            assert_eq!(
                err,
                ConfigError::InvalidValue {
                    key: ENV_WORKERS,
                    value: bad.to_string()
                }
            );
        }
    }

    #[test]
    fn builder_clamps_workers() {
        let config = JobManagerConfig::default()
            .with_workers(0)
            .with_condition("network");
        assert_eq!(config.workers, 1);
        assert_eq!(config.initial_conditions, vec!["network"]);
    }

    #[test]
    fn worker_count_is_never_zero() {
        let config = JobManagerConfig {
            workers: 0,
            ..JobManagerConfig::default()
        };
        assert_eq!(config.worker_count(), 1);
        assert_eq!(JobManagerConfig::default().with_workers(3).worker_count(), 3);
    }

    #[test]
    fn rejects_bad_retained_statuses() {
        let err =
            JobManagerConfig::from_lookup(lookup(&[(ENV_RETAINED_STATUSES, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: ENV_RETAINED_STATUSES,
                value: "lots".to_string()
            }
        );
    }
}
