// Project-wide constants
//
// Defaults shared by the config file and the runtime types. Import via
// `use crate::config::constants::*;`.

/// Config directory under the user's home.
pub const CONFIG_DIR: &str = ".agent-core";

/// Config file name inside `CONFIG_DIR`.
pub const CONFIG_FILE: &str = "config.toml";

/// Tool calls executed at once per batch.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Attempts per task, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;

pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;

/// Fractional jitter applied to every backoff delay (0.25 = ±25%).
pub const DEFAULT_JITTER: f64 = 0.25;

pub const DEFAULT_LOG_LEVEL: &str = "info";
