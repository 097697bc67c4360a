//! Runtime configuration
//!
//! Compile-time defaults come from `build.rs` (optionally merged with the
//! file named by `COFIBER_CONFIG_RS`). Environment variables override them
//! at startup.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Environment variables (runtime)
//! 2. `COFIBER_CONFIG_RS` overrides (compile-time)
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use cofiber_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .stack_size(256 * 1024)
//!     .connect_timeout_ms(2_000);
//! config.validate()?;
//! ```

use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use cofiber_core::{SchedError, SchedResult};

/// Generated library defaults
pub mod defaults {
    include!(concat!(env!("OUT_DIR"), "/cofiber_defaults.rs"));
}

/// Sentinel for "no timeout" in millisecond fields
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Tunables shared by fibers, schedulers, the reactor and the hook layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Stack size for fibers created with size 0
    pub stack_size: usize,
    /// Default `connect` timeout for hooked sockets (`tcp.connect.timeout`)
    pub connect_timeout_ms: u64,
    /// Upper bound on a single `epoll_wait`
    pub max_wait_ms: u64,
    /// Events drained per `epoll_wait`
    pub max_events: usize,
    /// Backward clock jump that invalidates all timer deadlines
    pub rollback_ms: u64,
    /// How long an idle worker of a plain scheduler parks before rechecking
    pub park_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Library defaults, no environment lookups
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            max_wait_ms: defaults::MAX_WAIT_MS,
            max_events: defaults::MAX_EVENTS,
            rollback_ms: defaults::ROLLBACK_MS,
            park_timeout: Duration::from_millis(defaults::PARK_TIMEOUT_MS),
        }
    }

    /// Defaults with environment overrides applied.
    ///
    /// Environment variables (all optional):
    /// - `COFIBER_STACK_SIZE` - fiber stack size in bytes
    /// - `COFIBER_CONNECT_TIMEOUT_MS` - hooked connect timeout
    /// - `COFIBER_MAX_WAIT_MS` - reactor wait ceiling
    /// - `COFIBER_MAX_EVENTS` - events per reactor wait
    /// - `COFIBER_ROLLBACK_MS` - clock rollback threshold
    /// - `COFIBER_PARK_TIMEOUT_MS` - idle park timeout of plain schedulers
    pub fn from_env() -> Self {
        Self {
            stack_size: env_or("COFIBER_STACK_SIZE", defaults::STACK_SIZE),
            connect_timeout_ms: env_or("COFIBER_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            max_wait_ms: env_or("COFIBER_MAX_WAIT_MS", defaults::MAX_WAIT_MS),
            max_events: env_or("COFIBER_MAX_EVENTS", defaults::MAX_EVENTS),
            rollback_ms: env_or("COFIBER_ROLLBACK_MS", defaults::ROLLBACK_MS),
            park_timeout: Duration::from_millis(env_or(
                "COFIBER_PARK_TIMEOUT_MS",
                defaults::PARK_TIMEOUT_MS,
            )),
        }
    }

    /// Process-wide configuration, read from the environment once.
    ///
    /// An invalid environment falls back to the library defaults.
    pub fn global() -> &'static RuntimeConfig {
        static GLOBAL: OnceLock<RuntimeConfig> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = RuntimeConfig::from_env();
            match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring environment configuration");
                    RuntimeConfig::new()
                }
            }
        })
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = ms;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn rollback_ms(mut self, ms: u64) -> Self {
        self.rollback_ms = ms;
        self
    }

    pub fn park_timeout(mut self, d: Duration) -> Self {
        self.park_timeout = d;
        self
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> SchedResult<()> {
        if self.stack_size < defaults::MIN_STACK_SIZE {
            return Err(SchedError::Config("stack_size is below MIN_STACK_SIZE"));
        }
        if self.max_events == 0 {
            return Err(SchedError::Config("max_events must be > 0"));
        }
        if self.max_wait_ms == 0 || self.max_wait_ms > i32::MAX as u64 {
            return Err(SchedError::Config("max_wait_ms must be in 1..=i32::MAX"));
        }
        if self.park_timeout.is_zero() {
            return Err(SchedError::Config("park_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Parse `key` from the environment, falling back to `default` when unset
/// or unparsable
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().replace('_', "").parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparsable value, using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout_ms, 5000);
        assert_eq!(config.max_wait_ms, 5000);
        assert_eq!(config.max_events, 256);
        assert_eq!(config.rollback_ms, 3_600_000);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .stack_size(256 * 1024)
            .connect_timeout_ms(250)
            .park_timeout(Duration::from_millis(3));
        assert_eq!(config.stack_size, 256 * 1024);
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.park_timeout, Duration::from_millis(3));
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().stack_size(1024).validate().is_err());
        assert!(RuntimeConfig::new().max_events(0).validate().is_err());
        assert!(RuntimeConfig::new().max_wait_ms(0).validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("COFIBER_TEST_ENV_OR", "64_000");
        assert_eq!(env_or("COFIBER_TEST_ENV_OR", 1usize), 64_000);
        std::env::set_var("COFIBER_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("COFIBER_TEST_ENV_OR", 7u64), 7);
        std::env::remove_var("COFIBER_TEST_ENV_OR");
        assert_eq!(env_or("COFIBER_TEST_ENV_OR", 9u64), 9);
    }
}
