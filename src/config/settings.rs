// Configuration structs

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::constants::*;
use crate::pubsub::{BackpressurePolicy, BrokerOptions, DEFAULT_BLOCK_TIMEOUT, DEFAULT_BUFFER_SIZE};
use crate::scheduler::SchedulerConfig;

/// Top-level configuration (`~/.agent-core/config.toml`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerSettings,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub permissions: PermissionsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Events buffered per subscriber
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default)]
    pub policy: BackpressurePolicy,

    /// Only used by the `block_publisher` policy
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            policy: BackpressurePolicy::default(),
            block_timeout_ms: default_block_timeout_ms(),
        }
    }
}

impl BrokerSettings {
    pub fn to_options(&self) -> BrokerOptions {
        BrokerOptions::default()
            .with_buffer_size(self.buffer_size)
            .with_policy(self.policy)
            .with_block_timeout(Duration::from_millis(self.block_timeout_ms))
    }
}

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Cancel the rest of a batch as soon as one task fails
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: DEFAULT_JITTER,
            fail_fast: false,
        }
    }
}

impl SchedulerSettings {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent,
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            fail_fast: self.fail_fast,
        }
    }
}

/// Tool approval settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Tools that never need approval
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Sessions where every tool is approved
    #[serde(default)]
    pub auto_approve_sessions: Vec<String>,

    /// Skip approval for everything
    /// ⚠️  Use with caution - tools can modify files
    #[serde(default)]
    pub skip: bool,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset (e.g. "info", "agent_core=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Reject settings the runtime cannot honor
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker.buffer_size == 0 {
            anyhow::bail!("broker.buffer_size must be at least 1");
        }

        let scheduler = &self.scheduler;
        if scheduler.max_concurrent == 0 {
            anyhow::bail!("scheduler.max_concurrent must be at least 1");
        }
        if scheduler.max_attempts == 0 {
            anyhow::bail!("scheduler.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&scheduler.jitter) {
            anyhow::bail!(
                "scheduler.jitter must be between 0 and 1 (got {})",
                scheduler.jitter
            );
        }
        if scheduler.base_delay_ms > scheduler.max_delay_ms {
            anyhow::bail!(
                "scheduler.base_delay_ms ({}) exceeds scheduler.max_delay_ms ({})",
                scheduler.base_delay_ms,
                scheduler.max_delay_ms
            );
        }

        if self.logging.level.trim().is_empty() {
            anyhow::bail!("logging.level must not be empty");
        }

        Ok(())
    }
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_block_timeout_ms() -> u64 {
    DEFAULT_BLOCK_TIMEOUT.as_millis() as u64
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_jitter() -> f64 {
    DEFAULT_JITTER
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
