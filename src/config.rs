//! Runtime configuration, loaded from environment variables.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Action queue poll interval.
    pub poll_interval: Duration,
    /// Default engine loop interval.
    pub loop_interval: Duration,
    /// Message fan-out poll interval.
    pub fanout_interval: Duration,
    /// Rehydration sweep interval.
    pub rehydrate_interval: Duration,
    /// How long destroy waits for a cooperative exit before aborting.
    pub destroy_grace: Duration,
    /// Shared deadline for one intent's tool calls.
    pub tool_timeout: Duration,
    /// Capacity of the fan-out dedup window.
    pub dedup_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            loop_interval: Duration::from_secs(3),
            fanout_interval: Duration::from_secs(2),
            rehydrate_interval: Duration::from_secs(30),
            destroy_grace: Duration::from_secs(5),
            tool_timeout: Duration::from_secs(12),
            dedup_capacity: 512,
        }
    }
}

impl RuntimeConfig {
    /// Build from `DYNA_*` environment variables, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_secs("DYNA_POLL_INTERVAL_SECS", defaults.poll_interval),
            loop_interval: env_secs("DYNA_LOOP_INTERVAL_SECS", defaults.loop_interval),
            fanout_interval: env_secs("DYNA_FANOUT_INTERVAL_SECS", defaults.fanout_interval),
            rehydrate_interval: env_secs(
                "DYNA_REHYDRATE_INTERVAL_SECS",
                defaults.rehydrate_interval,
            ),
            destroy_grace: env_secs("DYNA_DESTROY_GRACE_SECS", defaults.destroy_grace),
            tool_timeout: env_secs("DYNA_TOOL_TIMEOUT_SECS", defaults.tool_timeout),
            dedup_capacity: std::env::var("DYNA_DEDUP_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.dedup_capacity),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}
