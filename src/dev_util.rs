//! Useful functions for developing subresults that may panic.
//!

// standard library
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

// third party
use zip::write::{FileOptions, ZipWriter};

// local
use crate::listener::{LogSaverListener, Metrics, ResultListener, TestDescription};
use crate::store::{LogDataType, LogFile, ModuleContext};
use crate::Timestamp;

/// Access assets
///
/// Event streams used in tests are located in `/static`. This function takes a list of relative
/// location descriptors and expands them to an absolute path.
///
pub fn expand_static(path: &[&str]) -> PathBuf {
    let mut exp = Path::new(env!("CARGO_MANIFEST_DIR")).join("static");

    for p in path.iter() {
        exp = exp.join(p);
    }

    exp
}

/// Open a file as `io::BufReader`
pub fn open_buffered(path: &Path) -> io::BufReader<fs::File> {
    io::BufReader::new(fs::File::open(&path).unwrap_or_else(|_| panic!("No such file {:?}", &path)))
}

/// Enable log output for tests, repeated calls are fine
pub fn init_logging() {
    simple_logger::SimpleLogger::new()
        .with_level(logging::LevelFilter::Debug)
        .init()
        .ok();
}

/// Write a zip archive holding the given entries
pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    let file = fs::File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);

    for (name, data) in entries {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }

    writer.finish().unwrap();
}

/// A single recorded listener callback
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    InvocationFailed(String),
    RunStarted(String, usize, u32),
    RunFailed(String),
    RunEnded(Duration, Metrics),
    TestStarted(String),
    TestFailed(String, String),
    AssumptionFailure(String, String),
    TestIgnored(String),
    TestEnded(String, Metrics),
    ModuleStarted(String),
    ModuleEnded,
    TestLog(String, LogDataType, Vec<u8>),
    LogAssociation(String, Option<String>),
}

impl Call {
    pub fn kind(&self) -> &'static str {
        match self {
            Call::InvocationFailed(..) => "invocationFailed",
            Call::RunStarted(..) => "testRunStarted",
            Call::RunFailed(..) => "testRunFailed",
            Call::RunEnded(..) => "testRunEnded",
            Call::TestStarted(..) => "testStarted",
            Call::TestFailed(..) => "testFailed",
            Call::AssumptionFailure(..) => "testAssumptionFailure",
            Call::TestIgnored(..) => "testIgnored",
            Call::TestEnded(..) => "testEnded",
            Call::ModuleStarted(..) => "testModuleStarted",
            Call::ModuleEnded => "testModuleEnded",
            Call::TestLog(..) => "testLog",
            Call::LogAssociation(..) => "logAssociation",
        }
    }
}

/// Listener that records every callback
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub calls: Vec<Call>,
    pub starts: Vec<Timestamp>,
    pub ends: Vec<Timestamp>,
    saves_logs: bool,
}

impl RecordingListener {
    /// A recording listener that also associates saved logs
    pub fn log_saver() -> Self {
        RecordingListener {
            saves_logs: true,
            ..Default::default()
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.calls.iter().map(Call::kind).collect()
    }
}

impl ResultListener for RecordingListener {
    fn invocation_failed(&mut self, cause: &str) {
        self.calls.push(Call::InvocationFailed(cause.to_string()));
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.calls
            .push(Call::RunStarted(name.to_string(), test_count, attempt));
    }

    fn test_run_failed(&mut self, reason: &str) {
        self.calls.push(Call::RunFailed(reason.to_string()));
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        self.calls.push(Call::RunEnded(elapsed, metrics.clone()));
    }

    fn test_started(&mut self, test: &TestDescription, start: Timestamp) {
        self.starts.push(start);
        self.calls.push(Call::TestStarted(test.to_string()));
    }

    fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        self.calls
            .push(Call::TestFailed(test.to_string(), trace.to_string()));
    }

    fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        self.calls
            .push(Call::AssumptionFailure(test.to_string(), trace.to_string()));
    }

    fn test_ignored(&mut self, test: &TestDescription) {
        self.calls.push(Call::TestIgnored(test.to_string()));
    }

    fn test_ended(&mut self, test: &TestDescription, end: Timestamp, metrics: &Metrics) {
        self.ends.push(end);
        self.calls
            .push(Call::TestEnded(test.to_string(), metrics.clone()));
    }

    fn test_module_started(&mut self, context: &ModuleContext) {
        self.calls.push(Call::ModuleStarted(context.id.clone()));
    }

    fn test_module_ended(&mut self) {
        self.calls.push(Call::ModuleEnded);
    }

    fn test_log(&mut self, data_name: &str, data_type: LogDataType, data: &[u8]) {
        self.calls
            .push(Call::TestLog(data_name.to_string(), data_type, data.to_vec()));
    }

    fn as_log_saver(&mut self) -> Option<&mut dyn LogSaverListener> {
        if self.saves_logs {
            Some(self)
        } else {
            None
        }
    }
}

impl LogSaverListener for RecordingListener {
    fn log_association(&mut self, data_name: &str, log_file: &LogFile) {
        self.calls.push(Call::LogAssociation(
            data_name.to_string(),
            log_file.url.clone(),
        ));
    }
}
