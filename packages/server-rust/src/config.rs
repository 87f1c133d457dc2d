//! Bus configuration.

use std::time::Duration;

use phasewire_core::UnknownPhasePolicy;
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Errors raised while loading or validating a [`BusConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("bus_id must not be empty")]
    EmptyBusId,

    #[error("suspend_timeout_ms must be greater than zero")]
    ZeroSuspendTimeout,

    #[error("invalid log filter {filter:?}: {reason}")]
    InvalidLogFilter { filter: String, reason: String },
}

/// Configuration of one bus and everything dispatched through it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Name used in log events of this bus.
    pub bus_id: String,
    /// When true, an interceptor declaring an unknown phase fails chain
    /// assembly. When false it is logged and left out.
    pub strict_phases: bool,
    /// Reuse sorted chains per scope while the provider lists are unchanged.
    pub chain_cache: bool,
    /// How long a parked continuation waits to be resumed before the
    /// registry aborts it, in milliseconds.
    pub suspend_timeout_ms: u64,
    pub logging: LoggingConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bus_id: "phasewire".to_string(),
            strict_phases: true,
            chain_cache: true,
            suspend_timeout_ms: 30_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl BusConfig {
    /// Parses and validates a JSON document. Missing fields take their
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown fields and
    /// any error of [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that the type system cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus_id.trim().is_empty() {
            return Err(ConfigError::EmptyBusId);
        }
        if self.suspend_timeout_ms == 0 {
            return Err(ConfigError::ZeroSuspendTimeout);
        }
        self.logging.validate()
    }

    #[must_use]
    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }

    /// The chain-assembly policy selected by `strict_phases`.
    #[must_use]
    pub fn unknown_phase_policy(&self) -> UnknownPhasePolicy {
        if self.strict_phases {
            UnknownPhasePolicy::Reject
        } else {
            UnknownPhasePolicy::Skip
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` overrides it.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidLogFilter`] if `filter` does not parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.env_filter().map(|_| ())
    }

    pub(crate) fn env_filter(&self) -> Result<EnvFilter, ConfigError> {
        EnvFilter::try_new(&self.filter).map_err(|err| ConfigError::InvalidLogFilter {
            filter: self.filter.clone(),
            reason: err.to_string(),
        })
    }
}
