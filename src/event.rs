//! Event records and the line decoder
//!
//! A child process reports its progress as one event per line:
//!
//! ```text
//! <EVENT_NAME> <JSON object>
//! ```
//!
//! Lines may carry a decorative prefix (e.g. a logcat header like
//! `05-14 10:12:01.123  1234  1250 I Tradefed:`) in front of the event marker, and the stream may
//! interleave arbitrary log output that contains no event at all. The decoder therefore searches
//! each line for the leftmost known event marker and skips lines without one.
//!
//! `TEST_TAG` is the only event with a legacy, non JSON payload: the rest of the line is the tag.
//!
//! # Example
//! ```
//! use subresults::event::{decode, EventName};
//!
//! let line = r#"05-14 10:12:01.123 I/Tradefed: TEST_STARTED {"className":"C","testName":"m"}"#;
//! let record = decode(line).unwrap().unwrap();
//!
//! assert_eq!(record.name(), EventName::TestStarted);
//! assert_eq!(record.get_str("className").unwrap(), "C");
//! assert!(decode("some unrelated log output").unwrap().is_none());
//! ```
//!

// standard library
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// third party
use regex::Regex;
use serde_json::{Map, Value};

// local
use crate::error::{Error, Result};

/// Field keys of the wire format
pub mod keys {
    /// Name of a test run
    pub const RUN_NAME: &str = "runName";
    /// Number of tests a run expects
    pub const TEST_COUNT: &str = "testCount";
    /// Retry attempt of a run, starting at 0
    pub const ATTEMPT_NUMBER: &str = "attemptNumber";
    /// Class of a test
    pub const CLASS_NAME: &str = "className";
    /// Method of a test
    pub const TEST_NAME: &str = "testName";
    /// Failure trace
    pub const TRACE: &str = "trace";
    /// Start in milliseconds since the epoch
    pub const START_TIME: &str = "start_time";
    /// End in milliseconds since the epoch
    pub const END_TIME: &str = "end_time";
    /// Run duration in milliseconds
    pub const ELAPSED_TIME: &str = "time";
    /// Run failure reason
    pub const REASON: &str = "reason";
    /// Invocation failure cause
    pub const CAUSE: &str = "cause";
    /// Path of a saved module context
    pub const MODULE_CONTEXT: &str = "moduleContextFileName";
    /// Path of a saved log file descriptor
    pub const LOGGED_FILE: &str = "loggedFile";
    /// Name of logged data
    pub const DATA_NAME: &str = "dataName";
    /// Kind of logged data
    pub const DATA_TYPE: &str = "dataType";
    /// Path of logged data
    pub const DATA_FILE: &str = "dataFile";
    /// Test tag of the invocation
    pub const TEST_TAG: &str = "testTag";
}

/// The fixed set of events a child process may report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventName {
    /// `TEST_RUN_STARTED`
    TestRunStarted,
    /// `TEST_RUN_ENDED`
    TestRunEnded,
    /// `TEST_RUN_FAILED`
    TestRunFailed,
    /// `TEST_STARTED`
    TestStarted,
    /// `TEST_ENDED`
    TestEnded,
    /// `TEST_FAILED`
    TestFailed,
    /// `TEST_IGNORED`
    TestIgnored,
    /// `TEST_ASSUMPTION_FAILURE`
    TestAssumptionFailure,
    /// `TEST_MODULE_STARTED`
    TestModuleStarted,
    /// `TEST_MODULE_ENDED`
    TestModuleEnded,
    /// `LOG_ASSOCIATION`
    LogAssociation,
    /// `TEST_LOG`
    TestLog,
    /// `INVOCATION_STARTED`
    InvocationStarted,
    /// `INVOCATION_ENDED`
    InvocationEnded,
    /// `INVOCATION_FAILED`
    InvocationFailed,
    /// `TEST_TAG`, the only event with a bare string payload
    TestTag,
}

impl EventName {
    /// All event names in declaration order
    pub const ALL: [EventName; 16] = [
        EventName::TestRunStarted,
        EventName::TestRunEnded,
        EventName::TestRunFailed,
        EventName::TestStarted,
        EventName::TestEnded,
        EventName::TestFailed,
        EventName::TestIgnored,
        EventName::TestAssumptionFailure,
        EventName::TestModuleStarted,
        EventName::TestModuleEnded,
        EventName::LogAssociation,
        EventName::TestLog,
        EventName::InvocationStarted,
        EventName::InvocationEnded,
        EventName::InvocationFailed,
        EventName::TestTag,
    ];

    /// Marker token as it appears on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::TestRunStarted => "TEST_RUN_STARTED",
            EventName::TestRunEnded => "TEST_RUN_ENDED",
            EventName::TestRunFailed => "TEST_RUN_FAILED",
            EventName::TestStarted => "TEST_STARTED",
            EventName::TestEnded => "TEST_ENDED",
            EventName::TestFailed => "TEST_FAILED",
            EventName::TestIgnored => "TEST_IGNORED",
            EventName::TestAssumptionFailure => "TEST_ASSUMPTION_FAILURE",
            EventName::TestModuleStarted => "TEST_MODULE_STARTED",
            EventName::TestModuleEnded => "TEST_MODULE_ENDED",
            EventName::LogAssociation => "LOG_ASSOCIATION",
            EventName::TestLog => "TEST_LOG",
            EventName::InvocationStarted => "INVOCATION_STARTED",
            EventName::InvocationEnded => "INVOCATION_ENDED",
            EventName::InvocationFailed => "INVOCATION_FAILED",
            EventName::TestTag => "TEST_TAG",
        }
    }

    /// Whether the payload is a bare string rather than a JSON object
    pub fn is_legacy(self) -> bool {
        self == EventName::TestTag
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventName::ALL
            .iter()
            .find(|name| name.as_str() == s)
            .copied()
            .ok_or_else(|| Error::KeyError(format!("event {:?}", s)))
    }
}

lazy_static! {
    static ref CRE_EVENT: Regex = {
        let names: Vec<&str> = EventName::ALL.iter().map(|name| name.as_str()).collect();
        Regex::new(&format!(r"(?:^|[^A-Za-z0-9_])({}) (.*)$", names.join("|"))).unwrap()
    };
}

/// One decoded event: its name and a flat key-value payload
///
/// Accessors come in a required (`get_*`) and an optional (`opt_*`) flavour. Both fail with a
/// non-fatal error when a value has the wrong type.
///
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    name: EventName,
    fields: Map<String, Value>,
}

impl EventRecord {
    /// Create an event without payload
    pub fn new(name: EventName) -> Self {
        EventRecord {
            name,
            fields: Map::new(),
        }
    }

    /// Create an event from an existing payload
    pub fn from_fields(name: EventName, fields: Map<String, Value>) -> Self {
        EventRecord { name, fields }
    }

    /// Add a field (builder style)
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Event name
    pub fn name(&self) -> EventName {
        self.name
    }

    /// Raw payload
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    fn missing(&self, key: &str) -> Error {
        Error::KeyError(format!("{:?} in {}", key, self.name))
    }

    /// Get a required string field
    pub fn get_str(&self, key: &str) -> Result<&str> {
        self.opt_str(key)?.ok_or_else(|| self.missing(key))
    }

    /// Get an optional string field
    pub fn opt_str(&self, key: &str) -> Result<Option<&str>> {
        match self.fields.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(Error::FieldError(format!(
                "{:?} in {} is no string: {}",
                key, self.name, other
            ))),
        }
    }

    /// Get a required integer field
    pub fn get_int(&self, key: &str) -> Result<i64> {
        self.opt_int(key)?.ok_or_else(|| self.missing(key))
    }

    /// Get an optional integer field
    ///
    /// Numeric strings are accepted as well since some producers quote every value.
    ///
    pub fn opt_int(&self, key: &str) -> Result<Option<i64>> {
        let invalid = |other: &Value| {
            Error::FieldError(format!(
                "{:?} in {} is no integer: {}",
                key, self.name, other
            ))
        };

        let value = match self.fields.get(key) {
            None | Some(Value::Null) => return Ok(None),
            Some(value) => value,
        };

        match value {
            Value::Number(n) => n.as_i64().map(Some).ok_or_else(|| invalid(value)),
            Value::String(s) => s.trim().parse::<i64>().map(Some).map_err(|_| invalid(value)),
            other => Err(invalid(other)),
        }
    }

    /// Collect all fields except the given ones as strings
    ///
    /// Used for metric maps and attribute maps that travel flat next to the well-known keys.
    ///
    pub fn extras(&self, known: &[&str]) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .filter(|(key, _)| !known.contains(&key.as_str()))
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }

    /// Render the event as a wire line (without line terminator)
    pub fn encode(&self) -> String {
        if self.name.is_legacy() {
            let tag = self
                .fields
                .get(keys::TEST_TAG)
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("{} {}", self.name, tag)
        } else {
            format!("{} {}", self.name, Value::Object(self.fields.clone()))
        }
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Decode a single line
///
/// Returns `Ok(None)` for lines that carry no event marker. A recognized marker with a payload
/// that is not a JSON object yields `Error::MalformedEvent`.
///
pub fn decode(line: &str) -> Result<Option<EventRecord>> {
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');

    let captures = match CRE_EVENT.captures(line) {
        Some(captures) => captures,
        None => return Ok(None),
    };

    let name: EventName = captures[1].parse()?;
    let payload = captures[2].trim();

    if name.is_legacy() {
        return Ok(Some(EventRecord::new(name).with(keys::TEST_TAG, payload)));
    }

    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(fields)) => Ok(Some(EventRecord::from_fields(name, fields))),
        Ok(other) => Err(Error::MalformedEvent {
            event: name.to_string(),
            message: format!("expected a JSON object but got {}", other),
        }),
        Err(error) => Err(Error::MalformedEvent {
            event: name.to_string(),
            message: format!("{}", error),
        }),
    }
}
