use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use pit_reconcile::{DEFAULT_CALL_TIMEOUT, DEFAULT_TICK_INTERVAL};

use crate::scheduler::SchedulerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub fleet_file: PathBuf,
    pub state_db: PathBuf,
    pub scripts_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub jobs_dir: PathBuf,
    pub tick_interval: Duration,
    pub gateway_timeout: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str, default: &str| PathBuf::from(lookup(key).unwrap_or_else(|| default.to_string()));

        let tick_interval = match lookup("PIT_TICK_INTERVAL_MS") {
            Some(v) => Duration::from_millis(
                v.parse()
                    .with_context(|| format!("invalid PIT_TICK_INTERVAL_MS '{v}'"))?,
            ),
            None => DEFAULT_TICK_INTERVAL,
        };

        let gateway_timeout = match lookup("PIT_GATEWAY_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("invalid PIT_GATEWAY_TIMEOUT_SECS '{v}'"))?,
            ),
            None => DEFAULT_CALL_TIMEOUT,
        };

        let log_level = lookup("PIT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            fleet_file: path("PIT_FLEET_FILE", "data/fleet.json"),
            state_db: path("PIT_STATE_DB", "data/state.db"),
            scripts_dir: path("PIT_SCRIPTS_DIR", "scripts"),
            cache_dir: path("PIT_CACHE_DIR", "data/cache"),
            jobs_dir: path("PIT_JOBS_DIR", "data/jobs"),
            tick_interval,
            gateway_timeout,
            log_level,
        })
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings::new(&self.cache_dir, &self.jobs_dir)
    }
}
