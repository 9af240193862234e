//! Periodic failure-rate check with an alarm hook.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, trace};

use hookrelay_core::FailureReason;

use crate::jobs::{JobStore, JobStoreError};
use crate::leader::LeaderElection;
use crate::workers::{TaskHandle, spawn_periodic};

/// Where alarms go. Fire-and-forget.
#[async_trait]
pub trait AlarmSink: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Alarm sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlarmSink;

#[async_trait]
impl AlarmSink for LogAlarmSink {
    async fn notify(&self, message: &str) {
        error!(alarm = message, "ALARM TRIGGERED");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// How far back each check looks
    pub window: Duration,
    /// Alarm when the unavailable share is strictly above this
    pub failure_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            window: Duration::from_secs(300),
            failure_threshold: 0.5,
        }
    }
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    pub total: u64,
    pub unavailable: u64,
    pub failure_rate: f64,
    pub alarmed: bool,
}

pub struct SystemMonitor {
    store: Arc<dyn JobStore>,
    leader: Arc<LeaderElection>,
    alarm: Arc<dyn AlarmSink>,
    config: MonitorConfig,
}

impl SystemMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        leader: Arc<LeaderElection>,
        alarm: Arc<dyn AlarmSink>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            leader,
            alarm,
            config,
        }
    }

    /// One check over the configured window. `None` when not leader.
    pub async fn check_once(&self) -> Result<Option<HealthReport>, JobStoreError> {
        if !self.leader.is_leader().await {
            trace!("not leader, skipping health check");
            return Ok(None);
        }

        let window = chrono::Duration::from_std(self.config.window)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let since = Utc::now() - window;

        let total = self.store.count_updated_since(since).await?;
        if total == 0 {
            trace!("no recent traffic");
            return Ok(Some(HealthReport {
                total,
                unavailable: 0,
                failure_rate: 0.0,
                alarmed: false,
            }));
        }

        let unavailable = self
            .store
            .count_with_failure_reason_since(FailureReason::ExternalServiceUnavailable, since)
            .await?;
        let failure_rate = unavailable as f64 / total as f64;
        let alarmed = failure_rate > self.config.failure_threshold;

        if alarmed {
            let message = format!(
                "High failure rate: {:.2}% of jobs failed with EXTERNAL_SERVICE_UNAVAILABLE in the last {}s ({unavailable}/{total})",
                failure_rate * 100.0,
                self.config.window.as_secs(),
            );
            self.alarm.notify(&message).await;
        } else {
            info!(failure_rate, unavailable, total, "system health OK");
        }

        Ok(Some(HealthReport {
            total,
            unavailable,
            failure_rate,
            alarmed,
        }))
    }

    pub fn spawn(self: Arc<Self>) -> TaskHandle {
        let period = self.config.interval;
        spawn_periodic("health-monitor", period, move || {
            let monitor = Arc::clone(&self);
            async move {
                if let Err(err) = monitor.check_once().await {
                    error!(error = %err, "health check failed");
                }
            }
        })
    }
}
