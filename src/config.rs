//! Parser and receiver configuration
//!
//! Options can be built in code or loaded from a JSON document, missing keys fall back to their
//! defaults:
//!
//! ```
//! use subresults::config::ParserOptions;
//!
//! let options: ParserOptions = serde_json::from_str(r#"{"report_test_logs": false}"#).unwrap();
//!
//! assert!(!options.report_test_logs);
//! assert_eq!(options.bind_host, "127.0.0.1");
//! ```
//!

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Failure reason reported for runs the stream left open
pub const UNEXPECTED_TERMINATION: &str = "unexpected termination";

/// Options of a `ResultParser` and its socket receiver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserOptions {
    /// Host the receiver binds to, the port is always chosen by the OS
    pub bind_host: String,

    /// Interval in milliseconds at which a blocked receiver checks for cancellation
    pub poll_interval_ms: u64,

    /// Whether `TEST_LOG` events are forwarded to the listener
    pub report_test_logs: bool,

    /// Whether a terminal test event without an open test gets a synthesized `test_started`
    pub synthesize_test_start: bool,

    /// Failure reason used when the stream ends with a run still open
    pub termination_reason: String,
}

impl Default for ParserOptions {
    fn default() -> Self {
        ParserOptions {
            bind_host: "127.0.0.1".to_string(),
            poll_interval_ms: 50,
            report_test_logs: true,
            synthesize_test_start: true,
            termination_reason: UNEXPECTED_TERMINATION.to_string(),
        }
    }
}

impl ParserOptions {
    /// Load options from a JSON file
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let options: ParserOptions = serde_json::from_slice(&bytes)?;
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::ConfigError(
                "poll_interval_ms must be positive".to_string(),
            ));
        }

        if self.bind_host.trim().is_empty() {
            return Err(Error::ConfigError("bind_host must not be empty".to_string()));
        }

        Ok(())
    }

    /// Poll interval as duration, at least one millisecond
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Set the host the receiver binds to
    pub fn bind_host<T: Into<String>>(mut self, host: T) -> Self {
        self.bind_host = host.into();
        self
    }

    /// Set the poll interval in milliseconds
    pub fn poll_interval_ms(mut self, interval: u64) -> Self {
        self.poll_interval_ms = interval;
        self
    }

    /// Enable or disable reporting of `TEST_LOG` events
    pub fn report_test_logs(mut self, report: bool) -> Self {
        self.report_test_logs = report;
        self
    }

    /// Enable or disable synthesized test starts
    pub fn synthesize_test_start(mut self, synthesize: bool) -> Self {
        self.synthesize_test_start = synthesize;
        self
    }

    /// Set the failure reason for runs left open
    pub fn termination_reason<T: Into<String>>(mut self, reason: T) -> Self {
        self.termination_reason = reason.into();
        self
    }
}
