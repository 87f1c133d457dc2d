//! Tracing subscriber installation.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ConfigError, LoggingConfig};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. Returns `Ok(false)`
/// when a global subscriber was already installed, so repeated calls (tests,
/// embedded use) are harmless.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidLogFilter`] if `RUST_LOG` is unset and
/// `config.filter` does not parse.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool, ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.env_filter()?,
    };

    let json = config.json.then(|| fmt::layer().json().with_target(true));
    let plain = (!config.json).then(|| fmt::layer().with_target(true));

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
        .is_ok())
}
