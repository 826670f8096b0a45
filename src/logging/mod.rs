// Tracing setup
//
// Installs the global subscriber once per process. Library code only emits
// through `tracing` macros; embedding applications may install their own
// subscriber instead of calling this.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a stderr fmt subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Returns false when a
/// global subscriber was already set, in which case nothing changes.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.is_ok()
}
