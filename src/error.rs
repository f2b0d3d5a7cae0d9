//! Common subresults error type
//!

use std::fmt::Debug;

use thiserror::Error;

/// A common error type for subresults
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Operation not possible in the current state
    #[error("{0}")]
    StateError(String),

    /// Recognized event with an undecodable payload
    #[error("malformed {event} event: {message}")]
    MalformedEvent {
        /// Event name
        event: String,
        /// Decoder message
        message: String,
    },

    /// Required field missing
    #[error("key error, {0} not found")]
    KeyError(String),

    /// Field present but unusable
    #[error("field error: {0}")]
    FieldError(String),

    /// I/O failure
    #[error("{0}")]
    IOError(String),

    /// JSON (de)serialization failure
    #[error("{0}")]
    JSONError(String),

    /// Referenced object could not be loaded
    #[error("cannot deserialize {path}: {message}")]
    DeserializationError {
        /// Path of the object
        path: String,
        /// Decoder message
        message: String,
    },

    /// Broken or empty log archive
    #[error("{0}")]
    ArchiveError(String),

    /// Invalid options
    #[error("{0}")]
    ConfigError(String),
}

impl Error {
    /// Whether the error ends the parse session
    ///
    /// Missing or mistyped fields fail a single event only, everything else indicates a broken
    /// producer or a dangling reference and stops processing of the whole input.
    ///
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::KeyError(_) | Error::FieldError(_))
    }
}

// Manual conversion as io errors don't support cloning
impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IOError(format!("{}", error))
    }
}

// Manual conversion as serde_json errors don't support cloning
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::JSONError(format!("{}", error))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(error: zip::result::ZipError) -> Self {
        Error::ArchiveError(format!("{:?}", error))
    }
}

/// Result type of subresults
pub type Result<T> = std::result::Result<T, Error>;
