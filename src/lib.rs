//! Collecting test results from a child process.
//!
//! A test harness that delegates part of its work to a subprocess needs that subprocess's results
//! as if it had produced them itself. The child writes its lifecycle events (runs, tests,
//! modules, logs) as a line oriented stream, either into a file or through a local socket, and
//! the parent replays that stream against its own listener.
//!
//! # Application Scenarios
//!
//! ## replaying a result file
//! ```text
//! result file > FileSource > ResultParser > ResultListener
//! ```
//!
//! ## receiving results while the child runs
//! ```text
//! child: StreamReporter > socket
//! parent: socket > Receiver(SocketSource > ResultParser) > ResultListener
//! ```
//!
//! ## sharing invocation state
//! ```text
//! ResultParser > SharedContext (test tag, build attributes) < caller
//! ```
//!
//! The wire format is one event per line, `<EVENT_NAME> <JSON object>`, with arbitrary unrelated
//! output allowed in between. See the `event` module for details.
//!

#![warn(missing_docs)]

#[macro_use]
extern crate log as logging;
#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod listener;
pub mod parser;
pub mod reporter;
pub mod source;
pub mod state;
pub mod store;

#[cfg(test)]
mod dev_util;

pub use error::{Error, Result};

/// Version of subresults
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Point in time of a reported test event
pub type Timestamp = chrono::DateTime<chrono::Utc>;
