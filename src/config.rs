use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use std::path::Path;
use std::time::Duration;

/// Durations are written as integer milliseconds.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub enable_auto_reconnect: bool,
    /// Report success from the first `connect()` on a retryable failure and
    /// keep trying in the background. Needs `enable_auto_reconnect`.
    pub initial_auto_reconnect: bool,
    /// When set, a 515 stream error emits `ManualLoginReconnect` instead of reconnecting.
    pub disable_login_auto_reconnect: bool,

    pub handler_queue_size: usize,
    pub spillover_workers: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub stall_check_interval: Duration,
    pub stall_max_checks: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub slow_handler_warning: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_request_timeout: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub keepalive_interval_min: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub keepalive_interval_max: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub keepalive_response_deadline: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub keepalive_max_fail_time: Duration,

    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_backoff_step: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enable_auto_reconnect: true,
            initial_auto_reconnect: true,
            disable_login_auto_reconnect: false,
            handler_queue_size: 2048,
            spillover_workers: 256,
            stall_check_interval: Duration::from_secs(30),
            stall_max_checks: 10,
            slow_handler_warning: Duration::from_secs(5),
            default_request_timeout: Duration::from_secs(75),
            keepalive_interval_min: Duration::from_secs(20),
            keepalive_interval_max: Duration::from_secs(30),
            keepalive_response_deadline: Duration::from_secs(20),
            keepalive_max_fail_time: Duration::from_secs(180),
            reconnect_backoff_step: Duration::from_secs(2),
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::from_json(&raw)?)
    }
}
