//! Engine configuration.
//!
//! Defaults are usable as-is; [`EngineConfig::from_env`] overlays the
//! `BATCHGATE_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::gate::{FailedChunkPolicy, GatePolicy, ZeroChunkStepPolicy};
use crate::retry::RetryPolicy;
use crate::store::DEFAULT_PAGE_SIZE;

pub const POLL_INTERVAL_ENV: &str = "BATCHGATE_POLL_INTERVAL_MS";
pub const MAX_CONCURRENT_INSTANCES_ENV: &str = "BATCHGATE_MAX_CONCURRENT_INSTANCES";
pub const PAGE_SIZE_ENV: &str = "BATCHGATE_PAGE_SIZE";
pub const RETRY_MAX_ATTEMPTS_ENV: &str = "BATCHGATE_RETRY_MAX_ATTEMPTS";
pub const RETRY_BASE_DELAY_ENV: &str = "BATCHGATE_RETRY_BASE_DELAY_MS";
pub const ZERO_CHUNK_STEPS_ENV: &str = "BATCHGATE_ZERO_CHUNK_STEPS";
pub const FAILED_CHUNKS_ENV: &str = "BATCHGATE_FAILED_CHUNKS";

/// Maintenance service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Delay between sweeps over the active instances
    pub poll_interval: Duration,
    /// Instances maintained in parallel within one sweep
    pub max_concurrent_instances: usize,
    /// Chunks fetched per page when snapshotting an instance
    pub page_size: usize,
    /// Name for logging and the service thread
    pub name: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            max_concurrent_instances: 4,
            page_size: DEFAULT_PAGE_SIZE,
            name: "batchgate-maintenance".to_string(),
        }
    }
}

impl MaintenanceConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrent_instances(mut self, max: usize) -> Self {
        self.max_concurrent_instances = max.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub gate: GatePolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn with_maintenance(mut self, maintenance: MaintenanceConfig) -> Self {
        self.maintenance = maintenance;
        self
    }

    pub fn with_gate(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, POLL_INTERVAL_ENV)? {
            config.maintenance.poll_interval = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, MAX_CONCURRENT_INSTANCES_ENV)? {
            if max == 0 {
                return Err(EngineError::config(format!(
                    "{MAX_CONCURRENT_INSTANCES_ENV} must be at least 1"
                )));
            }
            config.maintenance.max_concurrent_instances = max;
        }
        if let Some(size) = parse_var::<usize, _>(&lookup, PAGE_SIZE_ENV)? {
            if size == 0 {
                return Err(EngineError::config(format!("{PAGE_SIZE_ENV} must be at least 1")));
            }
            config.maintenance.page_size = size;
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, RETRY_MAX_ATTEMPTS_ENV)? {
            config.retry.max_requeues = attempts;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, RETRY_BASE_DELAY_ENV)? {
            config.retry.base_delay = Duration::from_millis(ms);
            config.retry.max_delay = config.retry.max_delay.max(config.retry.base_delay);
        }
        if let Some(raw) = lookup(ZERO_CHUNK_STEPS_ENV) {
            config.gate.zero_chunk_steps = match raw.trim().to_ascii_lowercase().as_str() {
                "require_sealed" => ZeroChunkStepPolicy::RequireSealed,
                "vacuously_complete" => ZeroChunkStepPolicy::VacuouslyComplete,
                "block" => ZeroChunkStepPolicy::Block,
                other => {
                    return Err(EngineError::config(format!(
                        "{ZERO_CHUNK_STEPS_ENV}: unknown policy {other:?}"
                    )));
                }
            };
        }
        if let Some(raw) = lookup(FAILED_CHUNKS_ENV) {
            config.gate.failed_chunks = match raw.trim().to_ascii_lowercase().as_str() {
                "count_as_done" => FailedChunkPolicy::CountAsDone,
                "block_gate" => FailedChunkPolicy::BlockGate,
                other => {
                    return Err(EngineError::config(format!(
                        "{FAILED_CHUNKS_ENV}: unknown policy {other:?}"
                    )));
                }
            };
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> EngineResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: core::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| EngineError::config(format!("{key}={raw:?}: {e}"))),
        None => Ok(None),
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
    fn empty_environment_yields_defaults() {
        assert_eq!(EngineConfig::from_lookup(lookup(&[])).unwrap(), EngineConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (POLL_INTERVAL_ENV, "250"),
            (MAX_CONCURRENT_INSTANCES_ENV, "8"),
            (PAGE_SIZE_ENV, "50"),
            (RETRY_MAX_ATTEMPTS_ENV, "2"),
            (ZERO_CHUNK_STEPS_ENV, "vacuously_complete"),
            (FAILED_CHUNKS_ENV, "BLOCK_GATE"),
        ]))
        .unwrap();

        assert_eq!(config.maintenance.poll_interval, Duration::from_millis(250));
        assert_eq!(config.maintenance.max_concurrent_instances, 8);
        assert_eq!(config.maintenance.page_size, 50);
        assert_eq!(config.retry.max_requeues, 2);
        assert_eq!(config.gate.zero_chunk_steps, ZeroChunkStepPolicy::VacuouslyComplete);
        assert_eq!(config.gate.failed_chunks, FailedChunkPolicy::BlockGate);
    }

    #[test]
    fn malformed_values_are_rejected() {
        for vars in [
            [(POLL_INTERVAL_ENV, "soon")],
            [(MAX_CONCURRENT_INSTANCES_ENV, "0")],
            [(ZERO_CHUNK_STEPS_ENV, "maybe")],
        ] {
            let err = EngineConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(matches!(err, EngineError::Config(_)), "{vars:?}");
        }
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = EngineConfig::default()
            .with_gate(GatePolicy::default().with_failed_chunks(FailedChunkPolicy::BlockGate));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<EngineConfig>(&json).unwrap(), config);
    }
}
