//! Replaying a subprocess result stream against a listener
//!
//! The `ResultParser` consumes event lines in order, keeps track of what is currently open and
//! calls the matching listener callbacks. It never reorders events. Producers are not always well
//! behaved, so the parser recovers from structural inconsistencies with corrective callbacks
//! instead of failing:
//! - a terminal test event (ended, failed, assumption failure, ignored) without an open test opens
//!   one first, including a synthesized `test_started`
//! - a test started while another one is open ends the open one
//! - a run started while another one is open ends the open one
//! - a stream that ends with a run still open fails and ends that run
//!
//! Errors come in two flavours. Missing or mistyped fields fail the affected event only, it is
//! logged and skipped. A recognized event with an undecodable payload, or a reference to an
//! object that can't be loaded, is fatal: processing stops, open scopes are closed with the error
//! as failure reason and the listener receives `invocation_failed`.
//!
//! # Example
//! ```
//! use std::io;
//! use subresults::context::{InvocationContext, SharedContext};
//! use subresults::listener::ResultListener;
//! use subresults::parser::ResultParser;
//!
//! #[derive(Default)]
//! struct RunNames(Vec<String>);
//!
//! impl ResultListener for RunNames {
//!     fn test_run_started(&mut self, name: &str, _test_count: usize, _attempt: u32) {
//!         self.0.push(name.to_string());
//!     }
//! }
//!
//! let context = SharedContext::new(InvocationContext::new());
//! let mut parser = ResultParser::new(RunNames::default(), context.clone());
//!
//! let stream = "TEST_TAG subprocess\nTEST_RUN_STARTED {\"runName\":\"X\",\"testCount\":4}\n";
//! parser.parse(io::Cursor::new(stream)).unwrap();
//!
//! assert_eq!(parser.listener().0, vec!["X".to_string()]);
//! assert_eq!(context.read().test_tag(), Some("subprocess"));
//! ```
//!

// standard library
use std::collections::HashSet;
use std::convert::TryFrom;
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

// third party
use chrono::{TimeZone, Utc};

// local
use crate::config::ParserOptions;
use crate::context::SharedContext;
use crate::error::{Error, Result};
use crate::event::{decode, keys, EventName, EventRecord};
use crate::listener::{Metrics, ResultListener, TestDescription};
use crate::source::socket::Receiver;
use crate::source::{FileSource, LineSource};
use crate::state::{DispatchState, RunState};
use crate::store::{JsonStore, LogDataType, ObjectStore};
use crate::Timestamp;

/// Convert an optional millisecond timestamp, falling back to the current time
fn timestamp(millis: Option<i64>) -> Timestamp {
    millis
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or_else(Utc::now)
}

fn description(record: &EventRecord) -> Result<TestDescription> {
    Ok(TestDescription::new(
        record.get_str(keys::CLASS_NAME)?,
        record.get_str(keys::TEST_NAME)?,
    ))
}

fn non_negative<T: TryFrom<i64>>(record: &EventRecord, key: &str, value: i64) -> Result<T> {
    T::try_from(value).map_err(|_| {
        Error::FieldError(format!(
            "{:?} in {} is out of range: {}",
            key,
            record.name(),
            value
        ))
    })
}

/// Read an optional number, unusable values count as absent
fn optional<T: TryFrom<i64>>(record: &EventRecord, key: &str) -> Option<T> {
    let value = match record.opt_int(key) {
        Ok(value) => value?,
        Err(error) => {
            warn!("ignoring {}", error);
            return None;
        }
    };

    match T::try_from(value) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("ignoring {:?} in {}, out of range: {}", key, record.name(), value);
            None
        }
    }
}

/// Decodes an event stream and dispatches it to a listener
pub struct ResultParser<L: ResultListener> {
    listener: L,
    context: SharedContext,
    store: Box<dyn ObjectStore>,
    options: ParserOptions,
    state: DispatchState,
    reported_logs: HashSet<PathBuf>,
    start_time: Option<Timestamp>,
    invocation_failed: bool,
    failure: Option<Error>,
}

impl<L: ResultListener> ResultParser<L> {
    /// Create a parser reporting to `listener` and updating `context`
    pub fn new(listener: L, context: SharedContext) -> Self {
        ResultParser {
            listener,
            context,
            store: Box::new(JsonStore::default()),
            options: ParserOptions::default(),
            state: DispatchState::default(),
            reported_logs: HashSet::new(),
            start_time: None,
            invocation_failed: false,
            failure: None,
        }
    }

    /// Replace the default options
    pub fn with_options(mut self, options: ParserOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a different store for module contexts and log file descriptors
    pub fn with_store<S: ObjectStore + 'static>(mut self, store: S) -> Self {
        self.store = Box::new(store);
        self
    }

    /// Options in use
    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    /// Borrow the listener
    pub fn listener(&self) -> &L {
        &self.listener
    }

    /// Mutably borrow the listener
    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    /// Release the listener
    pub fn into_listener(self) -> L {
        self.listener
    }

    /// Context updated by the stream
    pub fn context(&self) -> &SharedContext {
        &self.context
    }

    /// What is currently open
    pub fn state(&self) -> &DispatchState {
        &self.state
    }

    /// Start of the invocation as reported by the child process
    pub fn start_time(&self) -> Option<Timestamp> {
        self.start_time
    }

    /// Whether an invocation failure reached the listener
    pub fn reported_invocation_failed(&self) -> bool {
        self.invocation_failed
    }

    /// The fatal error that ended the last parse session, if any
    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    /// Parse a file the child process has written completely
    pub fn parse_file(&mut self, path: &Path) -> Result<()> {
        match FileSource::open(path) {
            Ok(mut source) => self.consume(&mut source),
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    /// Parse a buffered reader to its end
    pub fn parse<R: BufRead + Send>(&mut self, reader: R) -> Result<()> {
        self.consume(&mut FileSource::from(reader))
    }

    /// Start receiving the stream on a local socket
    ///
    /// The parser moves to a background thread, `Receiver::close` hands it back.
    ///
    pub fn start_receiver(self) -> Result<Receiver<L>>
    where
        L: 'static,
    {
        Receiver::start(self)
    }

    /// Process a line source to its end
    ///
    /// Whatever happens, the listener observes all scopes closed afterwards.
    ///
    pub fn consume(&mut self, source: &mut dyn LineSource) -> Result<()> {
        self.failure = None;

        match self.drain(source) {
            Ok(()) => {
                self.finish(None);
                Ok(())
            }
            Err(error) => {
                self.fail(&error);
                Err(error)
            }
        }
    }

    fn drain(&mut self, source: &mut dyn LineSource) -> Result<()> {
        while let Some(line) = source.next_line()? {
            self.process_line(&line)?;
        }
        Ok(())
    }

    /// Decode and dispatch a single line
    ///
    /// Lines without an event are ignored. Only fatal errors are returned, per-event errors are
    /// logged and swallowed.
    ///
    pub fn process_line(&mut self, line: &str) -> Result<()> {
        let record = match decode(line)? {
            Some(record) => record,
            None => return Ok(()),
        };

        match self.dispatch(&record) {
            Err(error) if !error.is_fatal() => {
                error!("skipping {} event: {}", record.name(), error);
                Ok(())
            }
            other => other,
        }
    }

    /// Dispatch one event to the listener
    pub fn dispatch(&mut self, record: &EventRecord) -> Result<()> {
        debug!("dispatching {}", record);

        match record.name() {
            EventName::TestRunStarted => self.on_run_started(record),
            EventName::TestRunFailed => self.on_run_failed(record),
            EventName::TestRunEnded => self.on_run_ended(record),
            EventName::TestStarted => self.on_test_started(record),
            EventName::TestFailed => self.on_test_failed(record, false),
            EventName::TestAssumptionFailure => self.on_test_failed(record, true),
            EventName::TestIgnored => self.on_test_ignored(record),
            EventName::TestEnded => self.on_test_ended(record),
            EventName::TestModuleStarted => self.on_module_started(record),
            EventName::TestModuleEnded => self.on_module_ended(),
            EventName::LogAssociation => self.on_log_association(record),
            EventName::TestLog => self.on_test_log(record),
            EventName::InvocationStarted => self.on_invocation_started(record),
            EventName::InvocationEnded => self.on_invocation_ended(record),
            EventName::InvocationFailed => self.on_invocation_failed(record),
            EventName::TestTag => self.on_test_tag(record),
        }
    }

    /// Close everything the stream left open
    ///
    /// An open test is failed and ended, an open run is failed (unless a failure was reported for
    /// it already) and ended, an open module is ended. `reason` defaults to the configured
    /// termination reason.
    ///
    pub fn finish(&mut self, reason: Option<&str>) {
        let reason = reason
            .unwrap_or(&self.options.termination_reason)
            .to_string();

        if let Some(test) = self.state.close_test() {
            warn!("stream ended while {} was running", test);
            self.listener.test_failed(&test, &reason);
            self.listener.test_ended(&test, Utc::now(), &Metrics::new());
        }

        if let Some(run) = self.state.close_run() {
            warn!("stream ended while run {:?} was open", run.name);
            if !run.failure_reported {
                self.listener.test_run_failed(&reason);
            }
            self.listener.test_run_ended(Duration::from_millis(0), &Metrics::new());
        }

        if let Some(module) = self.state.close_module() {
            warn!("stream ended while module {:?} was open", module.id);
            self.listener.test_module_ended();
        }

        self.state.reset();
    }

    /// Close everything with `error` as reason and report the invocation as failed
    pub(crate) fn fail(&mut self, error: &Error) {
        error!("result stream failed: {}", error);

        let cause = error.to_string();
        self.finish(Some(&cause));
        self.listener.invocation_failed(&cause);
        self.invocation_failed = true;
        self.failure = Some(error.clone());
    }

    /// Implicitly end the open test, if any
    fn end_open_test(&mut self, reason: &str) {
        if let Some(test) = self.state.close_test() {
            warn!("ending {} implicitly: {}", test, reason);
            self.listener.test_ended(&test, Utc::now(), &Metrics::new());
        }
    }

    /// Make sure a test is open and return the identity callbacks have to use
    ///
    /// Reports of a test other than the open one are attributed to the open one.
    ///
    fn ensure_test(&mut self, test: TestDescription) -> TestDescription {
        match self.state.test() {
            Some(open) if *open == test => test,
            Some(open) => {
                warn!("event for {} while {} is running, using the latter", test, open);
                open.clone()
            }
            None => {
                warn!("event for {} without TEST_STARTED", test);
                self.state.open_test(test.clone());
                if self.options.synthesize_test_start {
                    self.listener.test_started(&test, Utc::now());
                }
                test
            }
        }
    }

    fn on_run_started(&mut self, record: &EventRecord) -> Result<()> {
        let name = record.get_str(keys::RUN_NAME)?;
        let test_count = record.get_int(keys::TEST_COUNT)?;
        let test_count: usize = non_negative(record, keys::TEST_COUNT, test_count)?;
        let attempt: u32 = optional(record, keys::ATTEMPT_NUMBER).unwrap_or(0);

        if let Some(previous) = self.state.run().map(|run| run.name.clone()) {
            warn!("run {:?} started while {:?} is open, ending it", name, previous);
            self.end_open_test("a new run started");
            self.state.close_run();
            self.listener
                .test_run_ended(Duration::from_millis(0), &Metrics::new());
        }

        self.state
            .open_run(RunState::new(name, test_count, attempt));
        self.listener.test_run_started(name, test_count, attempt);
        Ok(())
    }

    fn on_run_failed(&mut self, record: &EventRecord) -> Result<()> {
        let reason = record.get_str(keys::REASON)?;

        if let Some(test) = self.state.close_test() {
            self.listener.test_failed(&test, reason);
            self.listener.test_ended(&test, Utc::now(), &Metrics::new());
        }

        self.state.mark_run_failed();
        self.listener.test_run_failed(reason);
        Ok(())
    }

    fn on_run_ended(&mut self, record: &EventRecord) -> Result<()> {
        let elapsed: u64 = optional(record, keys::ELAPSED_TIME).unwrap_or(0);
        let metrics = record.extras(&[keys::ELAPSED_TIME]);

        self.end_open_test("its run ended");

        match self.state.close_run() {
            Some(run) if run.tests_started < run.test_count => warn!(
                "run {:?} ended after {} of {} expected tests",
                run.name, run.tests_started, run.test_count
            ),
            Some(_) => (),
            None => warn!("TEST_RUN_ENDED without an open run"),
        }

        self.listener
            .test_run_ended(Duration::from_millis(elapsed), &metrics);
        Ok(())
    }

    fn on_test_started(&mut self, record: &EventRecord) -> Result<()> {
        let test = description(record)?;
        let start = timestamp(optional(record, keys::START_TIME));

        self.end_open_test("the next test started");
        self.state.open_test(test.clone());
        self.listener.test_started(&test, start);
        Ok(())
    }

    fn on_test_failed(&mut self, record: &EventRecord, assumption: bool) -> Result<()> {
        let test = description(record)?;
        let trace = record.get_str(keys::TRACE)?;
        let test = self.ensure_test(test);

        if assumption {
            self.listener.test_assumption_failure(&test, trace);
        } else {
            self.listener.test_failed(&test, trace);
        }
        Ok(())
    }

    fn on_test_ignored(&mut self, record: &EventRecord) -> Result<()> {
        let test = description(record)?;
        let test = self.ensure_test(test);

        self.listener.test_ignored(&test);
        Ok(())
    }

    fn on_test_ended(&mut self, record: &EventRecord) -> Result<()> {
        let test = description(record)?;
        let end = timestamp(optional(record, keys::END_TIME));
        let metrics = record.extras(&[keys::CLASS_NAME, keys::TEST_NAME, keys::END_TIME]);
        let test = self.ensure_test(test);

        self.state.close_test();
        self.listener.test_ended(&test, end, &metrics);
        Ok(())
    }

    fn on_module_started(&mut self, record: &EventRecord) -> Result<()> {
        let path = record.get_str(keys::MODULE_CONTEXT)?;
        let module = self.store.load_module_context(Path::new(path))?;

        if let Some(previous) = self.state.close_module() {
            warn!("module {:?} started while {:?} is open", module.id, previous.id);
            self.listener.test_module_ended();
        }

        self.listener.test_module_started(&module);
        self.state.open_module(module);
        Ok(())
    }

    fn on_module_ended(&mut self) -> Result<()> {
        if self.state.close_module().is_none() {
            warn!("TEST_MODULE_ENDED without an open module, ignored");
            return Ok(());
        }

        self.listener.test_module_ended();
        Ok(())
    }

    fn on_log_association(&mut self, record: &EventRecord) -> Result<()> {
        let descriptor = record.get_str(keys::LOGGED_FILE)?;
        let data_name = record.get_str(keys::DATA_NAME)?;
        let log_file = self.store.load_log_file(Path::new(descriptor))?;

        if self.reported_logs.contains(&log_file.path) {
            debug!("{:?} was reported already, skipping association", log_file.path);
            return Ok(());
        }

        if log_file.has_url() {
            if let Some(saver) = self.listener.as_log_saver() {
                saver.log_association(data_name, &log_file);
                self.reported_logs.insert(log_file.path);
                return Ok(());
            }
        }

        let data = log_file.read_data()?;
        self.listener.test_log(data_name, log_file.data_type, &data);
        self.reported_logs.insert(log_file.path);
        Ok(())
    }

    fn on_test_log(&mut self, record: &EventRecord) -> Result<()> {
        let data_name = record.get_str(keys::DATA_NAME)?;
        let data_type: LogDataType = record.get_str(keys::DATA_TYPE)?.parse()?;
        let path = PathBuf::from(record.get_str(keys::DATA_FILE)?);

        if !self.options.report_test_logs {
            debug!("reporting of test logs is disabled, skipping {:?}", data_name);
            return Ok(());
        }

        if !path.is_file() {
            return Err(Error::FieldError(format!(
                "log file {:?} of {:?} does not exist",
                path, data_name
            )));
        }

        let data = fs::read(&path)?;
        self.listener.test_log(data_name, data_type, &data);
        self.reported_logs.insert(path);
        Ok(())
    }

    fn on_invocation_started(&mut self, record: &EventRecord) -> Result<()> {
        let tag = record.opt_str(keys::TEST_TAG)?;
        let start: Option<i64> = optional(record, keys::START_TIME);

        if let Some(tag) = tag {
            self.offer_test_tag(tag);
        }

        if start.is_some() {
            self.start_time = Some(timestamp(start));
        }
        Ok(())
    }

    fn on_invocation_ended(&mut self, record: &EventRecord) -> Result<()> {
        let rejected = self
            .context
            .write()
            .merge_build_attributes(record.extras(&[]));

        for key in rejected {
            debug!("build attribute {:?} is set locally already, keeping it", key);
        }
        Ok(())
    }

    fn on_invocation_failed(&mut self, record: &EventRecord) -> Result<()> {
        let cause = record.get_str(keys::CAUSE)?;

        self.invocation_failed = true;
        self.listener.invocation_failed(cause);
        Ok(())
    }

    fn on_test_tag(&mut self, record: &EventRecord) -> Result<()> {
        let tag = record.get_str(keys::TEST_TAG)?;
        self.offer_test_tag(tag);
        Ok(())
    }

    fn offer_test_tag(&mut self, tag: &str) {
        if tag.is_empty() {
            return;
        }

        let mut context = self.context.write();
        if !context.offer_test_tag(tag) {
            debug!(
                "keeping test tag {:?} over reported {:?}",
                context.test_tag(),
                tag
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::context::InvocationContext;
    use crate::dev_util::{expand_static, init_logging, write_zip, Call, RecordingListener};
    use crate::store::{LogFile, ModuleContext};

    fn parser(listener: RecordingListener) -> ResultParser<RecordingListener> {
        init_logging();
        ResultParser::new(listener, SharedContext::default())
    }

    fn parse_str(parser: &mut ResultParser<RecordingListener>, stream: &str) -> Result<()> {
        parser.parse(io::Cursor::new(stream.to_string()))
    }

    #[test]
    fn test_complete_run() {
        let mut parser = parser(RecordingListener::default());
        parser
            .parse_file(&expand_static(&["events", "run_complete.txt"]))
            .unwrap();

        let listener = parser.listener();
        assert_eq!(
            listener.kinds(),
            vec![
                "testRunStarted",
                "testStarted",
                "testEnded",
                "testStarted",
                "testFailed",
                "testEnded",
                "testStarted",
                "testIgnored",
                "testEnded",
                "testStarted",
                "testAssumptionFailure",
                "testEnded",
                "testRunEnded",
            ]
        );
        assert_eq!(
            listener.calls[0],
            Call::RunStarted("android.security.cts".into(), 4, 0)
        );
        assert_eq!(
            listener.calls[4],
            Call::TestFailed(
                "android.security.cts.StagefrightTest#testStagefright_cve_2016_3913".into(),
                "java.lang.AssertionError: device is vulnerable".into()
            )
        );

        let mut metrics = Metrics::new();
        metrics.insert("tests_passed".into(), "2".into());
        assert_eq!(
            listener.calls[12],
            Call::RunEnded(Duration::from_millis(3456), metrics)
        );

        // start time taken from the stream
        assert_eq!(listener.starts[0].timestamp_millis(), 1_600_000_000_000);
        assert!(parser.failure().is_none());
        assert!(parser.state().is_idle());
        assert_eq!(
            parser.start_time().map(|t| t.timestamp_millis()),
            Some(1_599_999_999_000)
        );
    }

    #[test]
    fn test_end_without_start() {
        let mut parser = parser(RecordingListener::default());
        parser
            .parse_file(&expand_static(&["events", "orphan_test_ended.txt"]))
            .unwrap();

        let listener = parser.listener();
        assert_eq!(
            listener.calls[0],
            Call::RunStarted("X".into(), 4, 0)
        );
        assert_eq!(listener.calls[1], Call::TestStarted("C#m".into()));
        assert_eq!(
            listener.calls[2],
            Call::TestEnded("C#m".into(), Metrics::new())
        );
        assert!(!parser.reported_invocation_failed());
    }

    #[test]
    fn test_end_without_start_bare() {
        let mut parser = parser(RecordingListener::default())
            .with_options(ParserOptions::default().synthesize_test_start(false));
        parse_str(
            &mut parser,
            "TEST_RUN_STARTED {\"testCount\":4,\"runName\":\"X\"}\n\
             TEST_ENDED {\"className\":\"C\",\"testName\":\"m\"}\n",
        )
        .unwrap();

        assert_eq!(
            parser.listener().kinds(),
            vec!["testRunStarted", "testEnded", "testRunFailed", "testRunEnded"]
        );
    }

    #[test]
    fn test_failure_without_start() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_RUN_STARTED {\"testCount\":1,\"runName\":\"r\"}\n\
             TEST_FAILED {\"className\":\"C\",\"testName\":\"m\",\"trace\":\"boom\"}\n\
             TEST_ENDED {\"className\":\"C\",\"testName\":\"m\"}\n\
             TEST_RUN_ENDED {}\n",
        )
        .unwrap();

        assert_eq!(
            parser.listener().kinds(),
            vec![
                "testRunStarted",
                "testStarted",
                "testFailed",
                "testEnded",
                "testRunEnded"
            ]
        );
    }

    #[test]
    fn test_truncated_stream() {
        let mut parser = parser(RecordingListener::default());
        parser
            .parse_file(&expand_static(&["events", "run_truncated.txt"]))
            .unwrap();

        let listener = parser.listener();
        assert_eq!(
            listener.kinds(),
            vec![
                "testModuleStarted",
                "testRunStarted",
                "testStarted",
                "testFailed",
                "testEnded",
                "testRunFailed",
                "testRunEnded",
                "testModuleEnded",
            ]
        );
        assert_eq!(
            listener.calls[5],
            Call::RunFailed(crate::config::UNEXPECTED_TERMINATION.into())
        );
        assert!(!parser.reported_invocation_failed());
    }

    #[test]
    fn test_run_failure_is_not_repeated() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_RUN_STARTED {\"testCount\":2,\"runName\":\"r\"}\n\
             TEST_STARTED {\"className\":\"C\",\"testName\":\"m\"}\n\
             TEST_RUN_FAILED {\"reason\":\"instrumentation crashed\"}\n",
        )
        .unwrap();

        let listener = parser.listener();
        assert_eq!(
            listener.kinds(),
            vec![
                "testRunStarted",
                "testStarted",
                "testFailed",
                "testEnded",
                "testRunFailed",
                "testRunEnded"
            ]
        );
        assert_eq!(
            listener.calls[2],
            Call::TestFailed("C#m".into(), "instrumentation crashed".into())
        );
    }

    #[test]
    fn test_malformed_event_is_fatal() {
        let mut parser = parser(RecordingListener::default());
        let result = parser.parse_file(&expand_static(&["events", "malformed.txt"]));

        assert!(matches!(result, Err(Error::MalformedEvent { .. })));
        assert!(parser.reported_invocation_failed());
        assert!(matches!(
            parser.failure(),
            Some(Error::MalformedEvent { .. })
        ));

        let listener = parser.listener();
        assert_eq!(
            listener.kinds(),
            vec!["testRunStarted", "testRunFailed", "testRunEnded", "invocationFailed"]
        );
        match listener.calls.last() {
            Some(Call::InvocationFailed(cause)) => assert!(cause.contains("TEST_STARTED")),
            other => panic!("expected invocation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_field_skips_event() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_RUN_STARTED {\"runName\":\"r\"}\n\
             TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":-1}\n\
             TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":\"2\",\"attemptNumber\":1}\n\
             TEST_STARTED {\"className\":\"C\"}\n\
             TEST_RUN_ENDED {\"time\":5}\n",
        )
        .unwrap();

        let listener = parser.listener();
        assert_eq!(listener.kinds(), vec!["testRunStarted", "testRunEnded"]);
        assert_eq!(listener.calls[0], Call::RunStarted("r".into(), 2, 1));
        assert!(parser.failure().is_none());
    }

    #[test]
    fn test_unusable_optional_numbers() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":1,\"attemptNumber\":-2}\n\
             TEST_STARTED {\"className\":\"C\",\"testName\":\"m\",\"start_time\":\"soon\"}\n\
             TEST_ENDED {\"className\":\"C\",\"testName\":\"m\",\"end_time\":1600000000000.5}\n\
             TEST_RUN_ENDED {\"time\":12.5}\n\
             TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":0}\n\
             TEST_RUN_ENDED {\"time\":-3}\n",
        )
        .unwrap();

        let listener = parser.listener();
        assert_eq!(
            listener.calls,
            vec![
                Call::RunStarted("r".into(), 1, 0),
                Call::TestStarted("C#m".into()),
                Call::TestEnded("C#m".into(), Metrics::new()),
                Call::RunEnded(Duration::from_millis(0), Metrics::new()),
                Call::RunStarted("r".into(), 0, 0),
                Call::RunEnded(Duration::from_millis(0), Metrics::new()),
            ]
        );
        assert!(parser.failure().is_none());
    }

    #[test]
    fn test_orphan_assumption_failure_and_ignore() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_ASSUMPTION_FAILURE {\"className\":\"C\",\"testName\":\"a\",\"trace\":\"skip\"}\n\
             TEST_ENDED {\"className\":\"C\",\"testName\":\"a\"}\n\
             TEST_IGNORED {\"className\":\"C\",\"testName\":\"b\"}\n\
             TEST_ENDED {\"className\":\"C\",\"testName\":\"b\"}\n",
        )
        .unwrap();

        assert_eq!(
            parser.listener().calls,
            vec![
                Call::TestStarted("C#a".into()),
                Call::AssumptionFailure("C#a".into(), "skip".into()),
                Call::TestEnded("C#a".into(), Metrics::new()),
                Call::TestStarted("C#b".into()),
                Call::TestIgnored("C#b".into()),
                Call::TestEnded("C#b".into(), Metrics::new()),
            ]
        );
    }

    #[test]
    fn test_events_attributed_to_open_test() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_STARTED {\"className\":\"C\",\"testName\":\"open\"}\n\
             TEST_FAILED {\"className\":\"C\",\"testName\":\"other\",\"trace\":\"boom\"}\n\
             TEST_ENDED {\"className\":\"D\",\"testName\":\"other\"}\n",
        )
        .unwrap();

        assert_eq!(
            parser.listener().calls,
            vec![
                Call::TestStarted("C#open".into()),
                Call::TestFailed("C#open".into(), "boom".into()),
                Call::TestEnded("C#open".into(), Metrics::new()),
            ]
        );
        assert!(parser.state().is_idle());
    }

    #[test]
    fn test_run_ended_without_run() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_RUN_ENDED {\"time\":7}\n\
             TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":3}\n\
             TEST_STARTED {\"className\":\"C\",\"testName\":\"m\"}\n\
             TEST_RUN_ENDED {}\n",
        )
        .unwrap();

        // ending short of the expected test count changes nothing for the listener
        assert_eq!(
            parser.listener().calls,
            vec![
                Call::RunEnded(Duration::from_millis(7), Metrics::new()),
                Call::RunStarted("r".into(), 3, 0),
                Call::TestStarted("C#m".into()),
                Call::TestEnded("C#m".into(), Metrics::new()),
                Call::RunEnded(Duration::from_millis(0), Metrics::new()),
            ]
        );
        assert!(parser.failure().is_none());
    }

    #[test]
    fn test_started_while_open() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_STARTED {\"className\":\"C\",\"testName\":\"a\"}\n\
             TEST_STARTED {\"className\":\"C\",\"testName\":\"b\"}\n\
             TEST_ENDED {\"className\":\"C\",\"testName\":\"b\",\"end_time\":42}\n",
        )
        .unwrap();

        let listener = parser.listener();
        assert_eq!(
            listener.calls,
            vec![
                Call::TestStarted("C#a".into()),
                Call::TestEnded("C#a".into(), Metrics::new()),
                Call::TestStarted("C#b".into()),
                Call::TestEnded("C#b".into(), Metrics::new()),
            ]
        );
        assert_eq!(listener.ends[1].timestamp_millis(), 42);
    }

    #[test]
    fn test_second_run_closes_first() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":1}\n\
             TEST_STARTED {\"className\":\"C\",\"testName\":\"a\"}\n\
             TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":1,\"attemptNumber\":1}\n\
             TEST_RUN_ENDED {}\n",
        )
        .unwrap();

        assert_eq!(
            parser.listener().kinds(),
            vec![
                "testRunStarted",
                "testStarted",
                "testEnded",
                "testRunEnded",
                "testRunStarted",
                "testRunEnded"
            ]
        );
        assert_eq!(parser.listener().calls[4], Call::RunStarted("r".into(), 1, 1));
    }

    #[test]
    fn test_test_tag_first_writer_wins() {
        let mut context = InvocationContext::new();
        context.set_test_tag("parent");
        let context = SharedContext::new(context);

        let mut parser = ResultParser::new(RecordingListener::default(), context.clone());
        parse_str(
            &mut parser,
            "TEST_TAG subprocess\nINVOCATION_STARTED {\"testTag\":\"other\"}\n",
        )
        .unwrap();
        assert_eq!(context.read().test_tag(), Some("parent"));

        let context = SharedContext::default();
        let mut parser = ResultParser::new(RecordingListener::default(), context.clone());
        parse_str(
            &mut parser,
            "INVOCATION_STARTED {\"testTag\":\"subprocess\",\"start_time\":1000}\nTEST_TAG late\n",
        )
        .unwrap();
        assert_eq!(context.read().test_tag(), Some("subprocess"));
        assert_eq!(parser.start_time().map(|t| t.timestamp_millis()), Some(1000));
    }

    #[test]
    fn test_build_attributes_merge() {
        let mut context = InvocationContext::new();
        context.add_build_attribute("baz", "qux");
        let context = SharedContext::new(context);

        let mut parser = ResultParser::new(RecordingListener::default(), context.clone());
        parse_str(
            &mut parser,
            "INVOCATION_ENDED {\"foo\":\"bar\",\"baz\":\"wrong\"}\n",
        )
        .unwrap();

        let context = context.snapshot();
        assert_eq!(context.build_attribute("foo"), Some("bar"));
        assert_eq!(context.build_attribute("baz"), Some("qux"));
        assert!(parser.listener().calls.is_empty());
    }

    #[test]
    fn test_invocation_failed() {
        let mut parser = parser(RecordingListener::default());
        parse_str(
            &mut parser,
            "INVOCATION_FAILED {\"cause\":\"device went offline\"}\n\
             TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":0}\n\
             TEST_RUN_ENDED {}\n",
        )
        .unwrap();

        assert_eq!(
            parser.listener().calls[0],
            Call::InvocationFailed("device went offline".into())
        );
        assert_eq!(parser.listener().calls.len(), 3);
        assert!(parser.reported_invocation_failed());
        assert!(parser.failure().is_none());
    }

    #[test]
    fn test_modules() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::default();

        let mut module = ModuleContext::new("arm64-v8a CtsSecurityTestCases");
        module.add_attribute("module-abi", "arm64-v8a");
        let module_path = dir.path().join("module.json");
        store.save_module_context(&module, &module_path).unwrap();

        let stream = format!(
            "TEST_MODULE_STARTED {{\"moduleContextFileName\":{:?}}}\n\
             TEST_MODULE_ENDED {{}}\n\
             TEST_MODULE_ENDED {{}}\n",
            module_path.display().to_string()
        );

        let mut parser = parser(RecordingListener::default());
        parse_str(&mut parser, &stream).unwrap();

        assert_eq!(
            parser.listener().calls,
            vec![
                Call::ModuleStarted("arm64-v8a CtsSecurityTestCases".into()),
                Call::ModuleEnded
            ]
        );
    }

    #[test]
    fn test_module_started_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for id in ["first", "second"].iter() {
            let path = dir.path().join(format!("{}.json", id));
            JsonStore
                .save_module_context(&ModuleContext::new(*id), &path)
                .unwrap();
            paths.push(path.display().to_string());
        }

        let stream = format!(
            "TEST_MODULE_STARTED {{\"moduleContextFileName\":{:?}}}\n\
             TEST_MODULE_STARTED {{\"moduleContextFileName\":{:?}}}\n\
             TEST_MODULE_ENDED {{}}\n",
            paths[0], paths[1]
        );

        let mut parser = parser(RecordingListener::default());
        parse_str(&mut parser, &stream).unwrap();

        assert_eq!(
            parser.listener().calls,
            vec![
                Call::ModuleStarted("first".into()),
                Call::ModuleEnded,
                Call::ModuleStarted("second".into()),
                Call::ModuleEnded
            ]
        );
    }

    #[test]
    fn test_dangling_module_reference_is_fatal() {
        let mut parser = parser(RecordingListener::default());
        let result = parse_str(
            &mut parser,
            "TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":1}\n\
             TEST_MODULE_STARTED {\"moduleContextFileName\":\"/nonexistent/module.json\"}\n\
             TEST_RUN_ENDED {}\n",
        );

        assert!(matches!(result, Err(Error::DeserializationError { .. })));
        assert_eq!(
            parser.listener().kinds(),
            vec!["testRunStarted", "testRunFailed", "testRunEnded", "invocationFailed"]
        );
    }

    fn save_log_file(dir: &Path, name: &str, log_file: &LogFile) -> PathBuf {
        let path = dir.join(name);
        JsonStore.save_log_file(log_file, &path).unwrap();
        path
    }

    #[test]
    fn test_log_association() {
        let dir = tempfile::tempdir().unwrap();

        let uploaded_path = dir.path().join("uploaded.txt");
        fs::write(&uploaded_path, "uploaded").unwrap();
        let mut uploaded = LogFile::new(&uploaded_path, LogDataType::Text);
        uploaded.url = Some("https://storage/uploaded.txt".into());

        let local_path = dir.path().join("local.txt");
        fs::write(&local_path, "local bytes").unwrap();
        let local = LogFile::new(&local_path, LogDataType::Logcat);

        let zipped_path = dir.path().join("bugreport.zip");
        write_zip(&zipped_path, &[("bugreport.txt", b"unpacked")]);
        let mut zipped = LogFile::new(&zipped_path, LogDataType::Bugreport);
        zipped.compressed = true;

        let stream = format!(
            "LOG_ASSOCIATION {{\"loggedFile\":{:?},\"dataName\":\"uploaded\"}}\n\
             LOG_ASSOCIATION {{\"loggedFile\":{:?},\"dataName\":\"local\"}}\n\
             LOG_ASSOCIATION {{\"loggedFile\":{:?},\"dataName\":\"bugreport\"}}\n",
            save_log_file(dir.path(), "uploaded.json", &uploaded)
                .display()
                .to_string(),
            save_log_file(dir.path(), "local.json", &local)
                .display()
                .to_string(),
            save_log_file(dir.path(), "zipped.json", &zipped)
                .display()
                .to_string(),
        );

        // a log saver gets associations for uploaded logs
        let mut saver = parser(RecordingListener::log_saver());
        parse_str(&mut saver, &stream).unwrap();
        assert_eq!(
            saver.listener().calls,
            vec![
                Call::LogAssociation(
                    "uploaded".into(),
                    Some("https://storage/uploaded.txt".into())
                ),
                Call::TestLog("local".into(), LogDataType::Logcat, b"local bytes".to_vec()),
                Call::TestLog("bugreport".into(), LogDataType::Bugreport, b"unpacked".to_vec()),
            ]
        );

        // a plain listener gets the raw bytes for everything
        let mut plain = parser(RecordingListener::default());
        parse_str(&mut plain, &stream).unwrap();
        assert_eq!(
            plain.listener().calls[0],
            Call::TestLog("uploaded".into(), LogDataType::Text, b"uploaded".to_vec())
        );
    }

    #[test]
    fn test_log_deduplication() {
        let dir = tempfile::tempdir().unwrap();

        let data_path = dir.path().join("host_log.txt");
        fs::write(&data_path, "host log").unwrap();
        let descriptor = save_log_file(
            dir.path(),
            "host_log.json",
            &LogFile::new(&data_path, LogDataType::Text),
        );

        let stream = format!(
            "TEST_LOG {{\"dataName\":\"host_log\",\"dataType\":\"TEXT\",\"dataFile\":{:?}}}\n\
             LOG_ASSOCIATION {{\"loggedFile\":{:?},\"dataName\":\"host_log\"}}\n\
             TEST_LOG {{\"dataName\":\"gone\",\"dataType\":\"TEXT\",\"dataFile\":\"/nonexistent\"}}\n",
            data_path.display().to_string(),
            descriptor.display().to_string(),
        );

        let mut parser = parser(RecordingListener::log_saver());
        parse_str(&mut parser, &stream).unwrap();

        assert_eq!(
            parser.listener().calls,
            vec![Call::TestLog(
                "host_log".into(),
                LogDataType::Text,
                b"host log".to_vec()
            )]
        );

        // disabled test logs don't count as reported
        let mut parser = parser_with_disabled_logs();
        parse_str(&mut parser, &stream).unwrap();
        assert_eq!(parser.listener().kinds(), vec!["testLog"]);
    }

    fn parser_with_disabled_logs() -> ResultParser<RecordingListener> {
        parser(RecordingListener::default())
            .with_options(ParserOptions::default().report_test_logs(false))
    }

    #[test]
    fn test_order_preserved() {
        let mut parser = parser(RecordingListener::default());
        let mut stream = String::from("TEST_RUN_STARTED {\"runName\":\"r\",\"testCount\":50}\n");
        for i in 0..50 {
            stream.push_str(&format!(
                "TEST_STARTED {{\"className\":\"C\",\"testName\":\"t{0}\"}}\n\
                 noise {0}\n\
                 TEST_ENDED {{\"className\":\"C\",\"testName\":\"t{0}\"}}\n",
                i
            ));
        }
        stream.push_str("TEST_RUN_ENDED {}\n");
        parse_str(&mut parser, &stream).unwrap();

        let tests: Vec<String> = parser
            .listener()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::TestStarted(test) => Some(test.clone()),
                _ => None,
            })
            .collect();
        let expected: Vec<String> = (0..50).map(|i| format!("C#t{}", i)).collect();

        assert_eq!(tests, expected);
        assert_eq!(parser.listener().calls.len(), 102);
    }
}
