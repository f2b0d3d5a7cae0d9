//! Sources of raw event lines
//!
//! A line source yields one line at a time until its input is exhausted, much like an iterator
//! whose items may fail. Two sources exist:
//! - `FileSource` reads any buffered reader (usually a file written by the child process) to
//!   completion
//! - `socket::SocketSource` reads a TCP connection whose peer pushes bytes asynchronously, until
//!   the peer closes the connection or the source is cancelled
//!
//! Bytes are decoded lossily as UTF-8 and line terminators (`\n`, `\r\n`) are stripped.
//!

pub mod socket;

// standard library
use std::fs;
use std::io::{self, BufRead};
use std::path::Path;

// local
use crate::error::Result;

/// Yields raw text lines
pub trait LineSource: Send {
    /// Return the next line, `None` once the input is exhausted
    fn next_line(&mut self) -> Result<Option<String>>;

    /// Turn source instance into trait object
    fn into_boxed<'a>(self) -> Box<dyn LineSource + 'a>
    where
        Self: Sized + 'a,
    {
        Box::new(self)
    }
}

impl<'a> LineSource for Box<dyn LineSource + 'a> {
    fn next_line(&mut self) -> Result<Option<String>> {
        self.as_mut().next_line()
    }
}

/// Convert a raw line into text without its terminator
pub(crate) fn to_line(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    while end > 0 && (bytes[end - 1] == b'\n' || bytes[end - 1] == b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reads lines from a finite, buffered input
pub struct FileSource<R: BufRead> {
    reader: R,
    buffer: Vec<u8>,
    lines: usize,
}

impl<R: BufRead> FileSource<R> {
    /// Read lines from `reader`
    pub fn new(reader: R) -> Self {
        FileSource {
            reader,
            buffer: Vec::new(),
            lines: 0,
        }
    }

    /// Number of lines read so far
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Release the inner reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl FileSource<io::BufReader<fs::File>> {
    /// Open a file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(FileSource::new(io::BufReader::new(file)))
    }
}

impl<R: BufRead> From<R> for FileSource<R> {
    fn from(reader: R) -> Self {
        FileSource::new(reader)
    }
}

impl<R: BufRead + Send> LineSource for FileSource<R> {
    fn next_line(&mut self) -> Result<Option<String>> {
        self.buffer.clear();

        if self.reader.read_until(b'\n', &mut self.buffer)? == 0 {
            return Ok(None);
        }

        self.lines += 1;
        Ok(Some(to_line(&self.buffer)))
    }
}
