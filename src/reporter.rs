//! Forwarding listener callbacks as an event stream
//!
//! `StreamReporter` is the producing side of the protocol a `ResultParser` consumes: every
//! callback it receives becomes one event line. Objects that don't travel inline (module
//! contexts, log data and log file descriptors) are written to a work directory first and
//! referenced by path, so the work directory has to be readable by the parsing process.
//!
//! ```text
//! child: test runner > StreamReporter > file | socket
//! parent: file | socket > ResultParser > ResultListener
//! ```
//!
//! Write failures never propagate into the test runner. They are logged and counted.
//!

// standard library
use std::fs;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

// local
use crate::context::InvocationContext;
use crate::error::Result;
use crate::event::{keys, EventName, EventRecord};
use crate::listener::{LogSaverListener, Metrics, ResultListener, TestDescription};
use crate::store::{JsonStore, LogDataType, LogFile, ModuleContext};
use crate::Timestamp;

/// Replace everything but `[A-Za-z0-9._-]` so that a data name can be used as file name
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}

fn with_metrics(mut record: EventRecord, metrics: &Metrics) -> EventRecord {
    for (key, value) in metrics.iter() {
        record = record.with(key.as_str(), value.as_str());
    }
    record
}

fn with_test(record: EventRecord, test: &TestDescription) -> EventRecord {
    record
        .with(keys::CLASS_NAME, test.class_name.as_str())
        .with(keys::TEST_NAME, test.test_name.as_str())
}

/// Encodes listener callbacks as event lines
pub struct StreamReporter<W: Write + Send> {
    writer: W,
    work_dir: PathBuf,
    store: JsonStore,
    saved: usize,
    errors: usize,
}

impl<W: Write + Send> StreamReporter<W> {
    /// Report to `writer`, saving referenced objects in `work_dir`
    pub fn new<P: Into<PathBuf>>(writer: W, work_dir: P) -> Self {
        StreamReporter {
            writer,
            work_dir: work_dir.into(),
            store: JsonStore::default(),
            saved: 0,
            errors: 0,
        }
    }

    /// Directory referenced objects are saved in
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Number of events that could not be reported
    pub fn errors(&self) -> usize {
        self.errors
    }

    /// Flush the writer
    pub fn flush(&mut self) -> Result<()> {
        Ok(self.writer.flush()?)
    }

    /// Release the writer
    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Report the start of the invocation along with its test tag
    pub fn invocation_started(&mut self, context: &InvocationContext, start: Timestamp) {
        let mut record = EventRecord::new(EventName::InvocationStarted)
            .with(keys::START_TIME, start.timestamp_millis());

        if let Some(tag) = context.test_tag() {
            record = record.with(keys::TEST_TAG, tag);
        }

        self.emit(record);
    }

    /// Report the end of the invocation along with the build attributes
    pub fn invocation_ended(&mut self, context: &InvocationContext) {
        let mut record = EventRecord::new(EventName::InvocationEnded);

        for (key, value) in context.build_attributes().iter() {
            record = record.with(key.as_str(), value.as_str());
        }

        self.emit(record);
    }

    /// Write one event line
    pub fn report(&mut self, record: &EventRecord) -> Result<()> {
        let mut line = record.encode();
        line.push('\n');

        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    fn emit(&mut self, record: EventRecord) {
        if let Err(error) = self.report(&record) {
            self.errors += 1;
            error!("cannot report {}: {}", record.name(), error);
        }
    }

    /// Reserve a fresh path in the work directory
    fn next_path(&mut self, stem: &str, extension: &str) -> PathBuf {
        self.saved += 1;
        self.work_dir
            .join(format!("{}-{}.{}", file_stem(stem), self.saved, extension))
    }

    fn save_failed(&mut self, what: &str, error: impl std::fmt::Display) {
        self.errors += 1;
        error!("cannot save {}: {}", what, error);
    }
}

impl StreamReporter<io::BufWriter<fs::File>> {
    /// Report into a file
    pub fn create<P: Into<PathBuf>>(path: &Path, work_dir: P) -> Result<Self> {
        let file = fs::File::create(path)?;
        Ok(StreamReporter::new(io::BufWriter::new(file), work_dir))
    }
}

impl StreamReporter<TcpStream> {
    /// Report to a listening `Receiver`
    pub fn connect<A: ToSocketAddrs, P: Into<PathBuf>>(address: A, work_dir: P) -> Result<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        Ok(StreamReporter::new(stream, work_dir))
    }
}

impl<W: Write + Send> ResultListener for StreamReporter<W> {
    fn invocation_failed(&mut self, cause: &str) {
        self.emit(EventRecord::new(EventName::InvocationFailed).with(keys::CAUSE, cause));
    }

    fn test_run_started(&mut self, name: &str, test_count: usize, attempt: u32) {
        self.emit(
            EventRecord::new(EventName::TestRunStarted)
                .with(keys::RUN_NAME, name)
                .with(keys::TEST_COUNT, test_count as u64)
                .with(keys::ATTEMPT_NUMBER, attempt),
        );
    }

    fn test_run_failed(&mut self, reason: &str) {
        self.emit(EventRecord::new(EventName::TestRunFailed).with(keys::REASON, reason));
    }

    fn test_run_ended(&mut self, elapsed: Duration, metrics: &Metrics) {
        let record = with_metrics(EventRecord::new(EventName::TestRunEnded), metrics)
            .with(keys::ELAPSED_TIME, elapsed.as_millis() as u64);
        self.emit(record);
    }

    fn test_started(&mut self, test: &TestDescription, start: Timestamp) {
        let record = with_test(EventRecord::new(EventName::TestStarted), test)
            .with(keys::START_TIME, start.timestamp_millis());
        self.emit(record);
    }

    fn test_failed(&mut self, test: &TestDescription, trace: &str) {
        let record =
            with_test(EventRecord::new(EventName::TestFailed), test).with(keys::TRACE, trace);
        self.emit(record);
    }

    fn test_assumption_failure(&mut self, test: &TestDescription, trace: &str) {
        let record = with_test(EventRecord::new(EventName::TestAssumptionFailure), test)
            .with(keys::TRACE, trace);
        self.emit(record);
    }

    fn test_ignored(&mut self, test: &TestDescription) {
        self.emit(with_test(EventRecord::new(EventName::TestIgnored), test));
    }

    fn test_ended(&mut self, test: &TestDescription, end: Timestamp, metrics: &Metrics) {
        let record = with_metrics(EventRecord::new(EventName::TestEnded), metrics);
        let record = with_test(record, test).with(keys::END_TIME, end.timestamp_millis());
        self.emit(record);
    }

    fn test_module_started(&mut self, context: &ModuleContext) {
        let path = self.next_path("module", "json");

        if let Err(error) = self.store.save_module_context(context, &path) {
            self.save_failed(&context.id, error);
            return;
        }

        self.emit(
            EventRecord::new(EventName::TestModuleStarted)
                .with(keys::MODULE_CONTEXT, path.display().to_string()),
        );
    }

    fn test_module_ended(&mut self) {
        self.emit(EventRecord::new(EventName::TestModuleEnded));
    }

    fn test_log(&mut self, data_name: &str, data_type: LogDataType, data: &[u8]) {
        let path = self.next_path(data_name, "log");

        if let Err(error) = fs::write(&path, data) {
            self.save_failed(data_name, error);
            return;
        }

        self.emit(
            EventRecord::new(EventName::TestLog)
                .with(keys::DATA_NAME, data_name)
                .with(keys::DATA_TYPE, data_type.as_str())
                .with(keys::DATA_FILE, path.display().to_string()),
        );
    }

    fn as_log_saver(&mut self) -> Option<&mut dyn LogSaverListener> {
        Some(self)
    }
}

impl<W: Write + Send> LogSaverListener for StreamReporter<W> {
    fn log_association(&mut self, data_name: &str, log_file: &LogFile) {
        let path = self.next_path(data_name, "json");

        if let Err(error) = self.store.save_log_file(log_file, &path) {
            self.save_failed(data_name, error);
            return;
        }

        self.emit(
            EventRecord::new(EventName::LogAssociation)
                .with(keys::LOGGED_FILE, path.display().to_string())
                .with(keys::DATA_NAME, data_name),
        );
    }
}
