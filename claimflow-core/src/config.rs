//! Sink configuration. Defaults match what a single ingestion process needs; every value can be
//! overridden from the environment.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};

const DEFAULT_PARTITIONS: usize = 1;
const DEFAULT_BATCH_SIZE: usize = 100;
/// Two consecutive idle checks flush a partition, so the effective idle flush latency is twice
/// this value.
const DEFAULT_IDLE_CHECK_INTERVAL_MILLIS: u64 = 2_500;
const DEFAULT_CHECKPOINT_INTERVAL_MILLIS: u64 = 100;
const DEFAULT_ADMISSION_MULTIPLIER: usize = 4;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 120;

const ENV_PARTITIONS: &str = "CLAIMFLOW_SINK_PARTITIONS";
const ENV_BATCH_SIZE: &str = "CLAIMFLOW_SINK_BATCH_SIZE";
const ENV_IDLE_CHECK_INTERVAL_MS: &str = "CLAIMFLOW_SINK_IDLE_CHECK_INTERVAL_MS";
const ENV_CHECKPOINT_INTERVAL_MS: &str = "CLAIMFLOW_SINK_CHECKPOINT_INTERVAL_MS";
const ENV_ADMISSION_MULTIPLIER: &str = "CLAIMFLOW_SINK_ADMISSION_MULTIPLIER";
const ENV_SHUTDOWN_TIMEOUT_SECS: &str = "CLAIMFLOW_SINK_SHUTDOWN_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq)]
pub struct SinkConfig {
    /// Number of partition writers, each with its own claims store instance.
    pub partitions: usize,
    /// Unique claims per partition that force a write.
    pub batch_size: usize,
    pub idle_check_interval: Duration,
    /// How often the watermark is persisted. Must be shorter than the idle check interval.
    pub checkpoint_interval: Duration,
    /// Admission capacity is `admission_multiplier * partitions * batch_size`.
    pub admission_multiplier: usize,
    /// Used by [crate::ClaimSink::close].
    pub shutdown_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            partitions: DEFAULT_PARTITIONS,
            batch_size: DEFAULT_BATCH_SIZE,
            idle_check_interval: Duration::from_millis(DEFAULT_IDLE_CHECK_INTERVAL_MILLIS),
            checkpoint_interval: Duration::from_millis(DEFAULT_CHECKPOINT_INTERVAL_MILLIS),
            admission_multiplier: DEFAULT_ADMISSION_MULTIPLIER,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl SinkConfig {
    /// Loads the config from the given environment variables, unset variables keep their
    /// defaults.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| key.starts_with("CLAIMFLOW_SINK_"))
            .collect();

        let get_number = |var: &str| -> Result<Option<u64>> {
            env_vars
                .get(var)
                .map(|val| {
                    val.trim().parse::<u64>().map_err(|e| {
                        Error::Config(format!("Invalid value {val:?} for {var}: {e}"))
                    })
                })
                .transpose()
        };

        let defaults = SinkConfig::default();
        let config = SinkConfig {
            partitions: get_number(ENV_PARTITIONS)?
                .map_or(defaults.partitions, |v| v as usize),
            batch_size: get_number(ENV_BATCH_SIZE)?.map_or(defaults.batch_size, |v| v as usize),
            idle_check_interval: get_number(ENV_IDLE_CHECK_INTERVAL_MS)?
                .map_or(defaults.idle_check_interval, Duration::from_millis),
            checkpoint_interval: get_number(ENV_CHECKPOINT_INTERVAL_MS)?
                .map_or(defaults.checkpoint_interval, Duration::from_millis),
            admission_multiplier: get_number(ENV_ADMISSION_MULTIPLIER)?
                .map_or(defaults.admission_multiplier, |v| v as usize),
            shutdown_timeout: get_number(ENV_SHUTDOWN_TIMEOUT_SECS)?
                .map_or(defaults.shutdown_timeout, Duration::from_secs),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::Config("partitions must be greater than 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch size must be greater than 0".to_string()));
        }
        if self.admission_multiplier == 0 {
            return Err(Error::Config(
                "admission multiplier must be greater than 0".to_string(),
            ));
        }
        if self.checkpoint_interval >= self.idle_check_interval {
            return Err(Error::Config(format!(
                "checkpoint interval {:?} must be shorter than idle check interval {:?}",
                self.checkpoint_interval, self.idle_check_interval
            )));
        }
        match self.checked_admission_capacity() {
            Some(capacity) if capacity <= Semaphore::MAX_PERMITS => Ok(()),
            _ => Err(Error::Config(format!(
                "admission capacity {} * {} * {} exceeds {}",
                self.admission_multiplier,
                self.partitions,
                self.batch_size,
                Semaphore::MAX_PERMITS
            ))),
        }
    }

    /// Maximum number of admitted but not yet written messages. Saturates for a config that does
    /// not pass [SinkConfig::validate].
    pub fn admission_capacity(&self) -> usize {
        self.checked_admission_capacity().unwrap_or(usize::MAX)
    }

    fn checked_admission_capacity(&self) -> Option<usize> {
        self.admission_multiplier
            .checked_mul(self.partitions)?
            .checked_mul(self.batch_size)
    }
}
