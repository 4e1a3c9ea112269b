//! Configuration for the remote session and subscription engines
//!
//! Settings that a host application may persist and hand to
//! [`RemoteHub::new`](crate::hub::RemoteHub::new) at startup. Everything has
//! a sensible default so `RemoteConfig::default()` is a working setup.

use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Default per-request response timeout in milliseconds
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 =
    crate::protocol::REQUEST_TIMEOUT.as_millis() as u64;

/// Default effective poll rate for the expression monitor, in Hz
pub const DEFAULT_WATCH_POLL_RATE_HZ: u32 = 10;

/// Default sample rate for plot/scope series, in Hz
pub const DEFAULT_SCOPE_RATE_HZ: f64 = 20.0;

/// Default number of resampled output values per scope series
pub const DEFAULT_SCOPE_SAMPLE_COUNT: usize = 128;

/// Configuration for a remote session and its subscription engines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Timeout for establishing the TCP connection, in milliseconds
    pub connect_timeout_ms: u64,

    /// Per-request response timeout, in milliseconds
    pub request_timeout_ms: u64,

    /// Effective evaluation rate for subscribed expressions, in Hz
    ///
    /// The scan tick is fixed; this bounds how often evaluations are
    /// actually issued.
    pub watch_poll_rate_hz: u32,

    /// Sample rate used for plot series subscribed without an explicit rate
    pub scope_rate_hz: f64,

    /// Resampled output length used for plot series subscribed without an
    /// explicit sample count
    pub scope_sample_count: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            watch_poll_rate_hz: DEFAULT_WATCH_POLL_RATE_HZ,
            scope_rate_hz: DEFAULT_SCOPE_RATE_HZ,
            scope_sample_count: DEFAULT_SCOPE_SAMPLE_COUNT,
        }
    }
}

impl RemoteConfig {
    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-request timeout as a [`Duration`]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&text).map_err(|e| RemoteError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text =
            toml::to_string_pretty(self).map_err(|e| RemoteError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }
}
