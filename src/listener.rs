//! Receiving ends of a test result stream
//!
//! A `ResultListener` gets one callback per lifecycle step of an invocation: runs, tests and
//! modules starting and ending, failures, and logs. All callbacks are optional. Listeners that
//! can associate already uploaded logs additionally implement `LogSaverListener` and expose it via
//! `ResultListener::as_log_saver`.
//!

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::{LogDataType, LogFile, ModuleContext};
use crate::Timestamp;

/// Metrics reported along with a test or a run
pub type Metrics = BTreeMap<String, String>;

/// Identity of a single test case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestDescription {
    /// Fully qualified class name
    pub class_name: String,
    /// Test method name
    pub test_name: String,
}

impl TestDescription {
    /// Create a test description
    pub fn new<C: Into<String>, T: Into<String>>(class_name: C, test_name: T) -> Self {
        TestDescription {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }
}

impl fmt::Display for TestDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

/// Receives test lifecycle callbacks
pub trait ResultListener: Send {
    /// The invocation failed as a whole
    fn invocation_failed(&mut self, _cause: &str) {}

    /// A test run named `name` with `test_count` expected tests started
    fn test_run_started(&mut self, _name: &str, _test_count: usize, _attempt: u32) {}

    /// The current run failed, a `test_run_ended` follows
    fn test_run_failed(&mut self, _reason: &str) {}

    /// The current run ended
    fn test_run_ended(&mut self, _elapsed: Duration, _metrics: &Metrics) {}

    /// A test started
    fn test_started(&mut self, _test: &TestDescription, _start: Timestamp) {}

    /// The current test failed with `trace`
    fn test_failed(&mut self, _test: &TestDescription, _trace: &str) {}

    /// An assumption of the current test did not hold
    fn test_assumption_failure(&mut self, _test: &TestDescription, _trace: &str) {}

    /// The current test was ignored
    fn test_ignored(&mut self, _test: &TestDescription) {}

    /// A test ended
    fn test_ended(&mut self, _test: &TestDescription, _end: Timestamp, _metrics: &Metrics) {}

    /// A module started
    fn test_module_started(&mut self, _context: &ModuleContext) {}

    /// The current module ended
    fn test_module_ended(&mut self) {}

    /// Raw log data
    fn test_log(&mut self, _data_name: &str, _data_type: LogDataType, _data: &[u8]) {}

    /// Access the log saving capability if the listener has one
    fn as_log_saver(&mut self) -> Option<&mut dyn LogSaverListener> {
        None
    }
}

/// A listener that can associate logs which were saved elsewhere already
pub trait LogSaverListener: ResultListener {
    /// Associate a saved log file with the current test or run
    fn log_association(&mut self, data_name: &str, log_file: &LogFile);
}

impl<'a> ResultListener for Box<dyn ResultListener + 'a> {
    fn invocation_failed(&mut self, cause: &str) {
        self.as_mut().invocation_failed(cause)
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.as_mut().test_run_started(name, test_count, attempt)
    }

    fn test_run_failed(&mut self, reason: &str) {
        self.as_mut().test_run_failed(reason)
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        self.as_mut().test_run_ended(elapsed, metrics)
    }

    fn test_started(&mut self, test: &TestDescription, start: Timestamp) {
        self.as_mut().test_started(test, start)
    }

    fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        self.as_mut().test_failed(test, trace)
    }

    fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        self.as_mut().test_assumption_failure(test, trace)
    }

    fn test_ignored(&mut self, test: &TestDescription) {
        self.as_mut().test_ignored(test)
    }

    fn test_ended(&mut self, test: &TestDescription, end: Timestamp, metrics: &Metrics) {
        self.as_mut().test_ended(test, end, metrics)
    }

    fn test_module_started(&mut self, context: &ModuleContext) {
        self.as_mut().test_module_started(context)
    }

    fn test_module_ended(&mut self) {
        self.as_mut().test_module_ended()
    }

    fn test_log(&mut self, data_name: &str, data_type: LogDataType, data: &[u8]) {
        self.as_mut().test_log(data_name, data_type, data)
    }

    fn as_log_saver(&mut self) -> Option<&mut dyn LogSaverListener> {
        self.as_mut().as_log_saver()
    }
}
