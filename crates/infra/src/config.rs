//! Engine configuration from `HOOKRELAY_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use hookrelay_core::LeaseConfig;

use crate::dispatcher::DispatcherConfig;
use crate::monitor::MonitorConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Everything a running instance needs to know.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    /// `None` runs on in-memory stores
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub lease: LeaseConfig,
    pub dispatcher: DispatcherConfig,
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            database_max_connections: 10,
            lease: LeaseConfig::default(),
            dispatcher: DispatcherConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let heartbeat_interval = env.millis("HOOKRELAY_HEARTBEAT_INTERVAL_MS")?;
        let lease_window = env.millis("HOOKRELAY_LEASE_WINDOW_MS")?;
        let mut lease = LeaseConfig {
            service_name: env
                .string("HOOKRELAY_SERVICE_NAME")
                .unwrap_or(defaults.lease.service_name),
            ..defaults.lease
        };
        if let Some(interval) = heartbeat_interval {
            lease.heartbeat_interval = chrono_duration("HOOKRELAY_HEARTBEAT_INTERVAL_MS", interval)?;
            // the window follows the heartbeat unless set explicitly
            lease.lease_window = lease.heartbeat_interval * 5;
        }
        if let Some(window) = lease_window {
            lease.lease_window = chrono_duration("HOOKRELAY_LEASE_WINDOW_MS", window)?;
        }

        let d = defaults.dispatcher;
        let dispatcher = DispatcherConfig {
            dispatch_timeout: env
                .millis("HOOKRELAY_DISPATCH_TIMEOUT_MS")?
                .unwrap_or(d.dispatch_timeout),
            recovery_interval: env
                .millis("HOOKRELAY_RECOVERY_INTERVAL_MS")?
                .unwrap_or(d.recovery_interval),
            recovery_batch_size: env
                .parse("HOOKRELAY_RECOVERY_BATCH_SIZE")?
                .unwrap_or(d.recovery_batch_size),
            high_lane_workers: env
                .parse("HOOKRELAY_HIGH_LANE_WORKERS")?
                .unwrap_or(d.high_lane_workers),
            standard_lane_workers: env
                .parse("HOOKRELAY_STANDARD_LANE_WORKERS")?
                .unwrap_or(d.standard_lane_workers),
        };

        let m = defaults.monitor;
        let monitor = MonitorConfig {
            interval: env
                .millis("HOOKRELAY_MONITOR_INTERVAL_MS")?
                .unwrap_or(m.interval),
            window: env
                .parse::<u64>("HOOKRELAY_MONITOR_WINDOW_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(m.window),
            failure_threshold: env
                .parse("HOOKRELAY_MONITOR_FAILURE_THRESHOLD")?
                .unwrap_or(m.failure_threshold),
        };

        Ok(Self {
            bind_addr: env
                .parse("HOOKRELAY_BIND_ADDR")?
                .unwrap_or(defaults.bind_addr),
            database_url: env.string("DATABASE_URL"),
            database_max_connections: env
                .parse("HOOKRELAY_DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database_max_connections),
            lease,
            dispatcher,
            monitor,
        })
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        self.string(key)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|_| ConfigError::Invalid { key, value })
            })
            .transpose()
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        match self.parse::<u64>(key)? {
            Some(0) => Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
            }),
            other => Ok(other.map(Duration::from_millis)),
        }
    }
}

fn chrono_duration(key: &'static str, value: Duration) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::from_std(value).map_err(|_| ConfigError::Invalid {
        key,
        value: value.as_millis().to_string(),
    })
}
