//! Receiving an event stream over a local TCP connection
//!
//! The parent process starts a `Receiver`, hands `Receiver::port` to the child process and later
//! waits for the child to finish reporting. The receiver accepts exactly one connection and feeds
//! the bytes it receives into its parser on a background thread. All decoding and dispatching
//! happens on that thread, so listener callbacks never run concurrently.
//!
//! Blocking calls on the background thread (accept, read) return at least once per poll interval
//! so that a cancelled receiver releases its socket in bounded time.
//!
//! ```no_run
//! use std::time::Duration;
//! use subresults::context::SharedContext;
//! use subresults::listener::ResultListener;
//! use subresults::parser::ResultParser;
//!
//! struct Quiet;
//! impl ResultListener for Quiet {}
//!
//! let parser = ResultParser::new(Quiet, SharedContext::default());
//! let mut receiver = parser.start_receiver().unwrap();
//!
//! println!("child should report to port {}", receiver.port());
//!
//! if !receiver.join(Duration::from_secs(60)) {
//!     eprintln!("child did not finish reporting in time");
//! }
//! let parser = receiver.close().unwrap();
//! ```
//!

// standard library
use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// local
use crate::error::{Error, Result};
use crate::listener::ResultListener;
use crate::parser::ResultParser;
use crate::source::{to_line, LineSource};

const CHUNK_SIZE: usize = 4096;

/// Unterminated input beyond this length is yielded as a line of its own
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Reads lines from a connected socket
///
/// Bytes are appended to an internal buffer in arrival order and split into lines in that order.
/// An unterminated last line is yielded once the peer closes the connection.
///
pub struct SocketSource {
    stream: TcpStream,
    cancelled: Arc<AtomicBool>,
    buffer: Vec<u8>,
    scanned: usize,
    closed: bool,
}

impl SocketSource {
    /// Wrap a connected stream, blocking reads wake up once per `poll_interval`
    pub fn new(
        stream: TcpStream,
        cancelled: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(poll_interval))?;

        Ok(SocketSource {
            stream,
            cancelled,
            buffer: Vec::new(),
            scanned: 0,
            closed: false,
        })
    }

    /// Take the first complete line, bytes before `scanned` are known to hold no terminator
    fn split_line(&mut self) -> Option<String> {
        let position = match self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => self.scanned + offset,
            None if self.buffer.len() >= MAX_LINE_LENGTH => {
                warn!("splitting a line longer than {} bytes", MAX_LINE_LENGTH);
                self.buffer.len() - 1
            }
            None => {
                self.scanned = self.buffer.len();
                return None;
            }
        };

        let line = to_line(&self.buffer[..=position]);
        self.buffer.drain(..=position);
        self.scanned = 0;
        Some(line)
    }
}

impl LineSource for SocketSource {
    fn next_line(&mut self) -> Result<Option<String>> {
        let mut chunk = [0u8; CHUNK_SIZE];

        loop {
            if let Some(line) = self.split_line() {
                return Ok(Some(line));
            }

            if self.closed {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = to_line(&self.buffer);
                self.buffer.clear();
                self.scanned = 0;
                return Ok(Some(line));
            }

            if self.cancelled.load(Ordering::SeqCst) {
                debug!("socket source cancelled, dropping {} bytes", self.buffer.len());
                self.buffer.clear();
                self.scanned = 0;
                self.closed = true;
                continue;
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => self.closed = true,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(ref e) if is_timeout(e) => (),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Outcome of the background thread
type Outcome<L> = (ResultParser<L>, Result<()>);

/// Handle of a socket receiver running on a background thread
///
/// Dropping the handle cancels the receiver and releases its socket.
///
pub struct Receiver<L: ResultListener + 'static> {
    port: u16,
    connected: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    abandoned: Arc<AtomicBool>,
    done: mpsc::Receiver<()>,
    finished: bool,
    handle: Option<thread::JoinHandle<Outcome<L>>>,
}

impl<L: ResultListener + 'static> Receiver<L> {
    /// Bind an ephemeral port and start receiving on a background thread
    pub fn start(parser: ResultParser<L>) -> Result<Self> {
        let listener = TcpListener::bind((parser.options().bind_host.as_str(), 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let poll_interval = parser.options().poll_interval();

        let connected = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        let abandoned = Arc::new(AtomicBool::new(false));
        let (signal, done) = mpsc::channel();

        let handle = {
            let connected = connected.clone();
            let cancelled = cancelled.clone();
            let abandoned = abandoned.clone();

            thread::Builder::new()
                .name(format!("subresults-receiver-{}", port))
                .spawn(move || {
                    let outcome = receive(
                        parser,
                        listener,
                        &connected,
                        &cancelled,
                        &abandoned,
                        poll_interval,
                    );
                    // the handle may be gone already, nobody to notify then
                    let _ = signal.send(());
                    outcome
                })?
        };

        debug!("receiver listening on port {}", port);

        Ok(Receiver {
            port,
            connected,
            cancelled,
            abandoned,
            done,
            finished: false,
            handle: Some(handle),
        })
    }

    /// Port the child process has to connect to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether a child process ever connected
    pub fn was_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the background thread is done
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Ask the background thread to stop
    ///
    /// Stops waiting for a connection or, if connected, stops reading from it. Events that have
    /// been received but not yet dispatched are dropped.
    ///
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for the receiver to finish
    ///
    /// Returns false if the receiver is still running after the timeout.
    ///
    pub fn join(&mut self, timeout: Duration) -> bool {
        self.join_receiver(timeout, true)
    }

    /// Wait up to `timeout` for the receiver to finish
    ///
    /// Without `wait_for_connection`, a receiver that has no connection yet stops accepting. A
    /// connection that is already pending is still taken and read to its end, otherwise the call
    /// returns true right away: a child that never connected has nothing left to report. A child
    /// that connected but is slow is waited for either way.
    ///
    pub fn join_receiver(&mut self, timeout: Duration, wait_for_connection: bool) -> bool {
        if self.finished {
            return true;
        }

        if !wait_for_connection && !self.was_connected() {
            debug!("no connection on port {}, stop waiting", self.port);
            self.abandoned.store(true, Ordering::SeqCst);
        }

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                if !wait_for_connection && !self.was_connected() {
                    // abandoned above, the thread is merely slow to notice
                    warn!("receiver on port {} did not stop within {:?}", self.port, timeout);
                }
                false
            }
        }
    }

    /// Stop the receiver and hand back its parser
    ///
    /// A receiver that is still running is cancelled first. Errors of the parse session have been
    /// reported to the listener already and are available via `ResultParser::failure`.
    ///
    pub fn close(mut self) -> Result<ResultParser<L>> {
        self.cancel();

        let handle = self
            .handle
            .take()
            .ok_or_else(|| Error::StateError("receiver was closed already".to_string()))?;
        let (parser, result) = handle
            .join()
            .map_err(|_| Error::StateError("receiver thread panicked".to_string()))?;

        self.finished = true;

        if let Err(error) = result {
            debug!("receiver on port {} ended with: {}", self.port, error);
        }

        Ok(parser)
    }
}

impl<L: ResultListener + 'static> Drop for Receiver<L> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cancel();
            if handle.join().is_err() {
                error!("receiver thread on port {} panicked", self.port);
            }
        }
    }
}

/// Poll for the single connection
///
/// Once abandoned, a connection that is pending already is still taken.
///
fn accept(
    listener: &TcpListener,
    cancelled: &AtomicBool,
    abandoned: &AtomicBool,
    poll_interval: Duration,
) -> Result<Option<TcpStream>> {
    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let last_attempt = abandoned.load(Ordering::SeqCst);

        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                return Ok(Some(stream));
            }
            Err(ref e) if is_timeout(e) && last_attempt => return Ok(None),
            Err(ref e) if is_timeout(e) => thread::sleep(poll_interval),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e.into()),
        }
    }
}

fn receive<L: ResultListener>(
    mut parser: ResultParser<L>,
    listener: TcpListener,
    connected: &AtomicBool,
    cancelled: &Arc<AtomicBool>,
    abandoned: &AtomicBool,
    poll_interval: Duration,
) -> Outcome<L> {
    let stream = match accept(&listener, cancelled, abandoned, poll_interval) {
        Ok(Some(stream)) => stream,
        Ok(None) => {
            debug!("receiver stopped before any connection");
            return (parser, Ok(()));
        }
        Err(error) => {
            parser.fail(&error);
            return (parser, Err(error));
        }
    };

    // exactly one connection per receiver
    drop(listener);
    connected.store(true, Ordering::SeqCst);

    let result = match SocketSource::new(stream, cancelled.clone(), poll_interval) {
        Ok(mut source) => parser.consume(&mut source),
        Err(error) => {
            parser.fail(&error);
            Err(error)
        }
    };

    (parser, result)
}
