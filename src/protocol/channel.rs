//! Ordered request/response channel between two processes.
//!
//! A [`Transport`] moves whole [`Frame`]s. [`MessageChannel`] adds the
//! turn-taking state machine:
//!
//! ```text
//!            request()                    await_response(tag)
//!   Idle ───────────────▶ AwaitingResponse ───────────────────▶ Idle
//!     │                         │
//!     │ receive_unsolicited()   │ second request / wrong tag
//!     │ reply()                 ▼
//!     └──────▶ Idle          Poisoned  (every later call fails)
//! ```
//!
//! Any violation poisons the channel: once the two sides disagree about
//! whose turn it is, nothing further on the channel can be trusted.

use std::io::{BufRead, BufReader, Stdin, Stdout, Write};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use super::Frame;
use crate::error::{ComposeError, ComposeResult};

/// Errors raised by a transport below the protocol layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Moves frames to and from a peer, blocking until each call completes.
pub trait Transport: Send {
    /// Write one frame.
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError>;
    /// Block for the next frame.
    fn recv_frame(&mut self) -> Result<Frame, TransportError>;
}

// =============================================================================
// Line-delimited JSON transport
// =============================================================================

/// Newline-delimited JSON frames over a reader/writer pair.
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
    line: String,
}

impl<R: BufRead + Send, W: Write + Send> LineTransport<R, W> {
    /// Frames are read from `reader` and written to `writer`.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            line: String::new(),
        }
    }
}

impl LineTransport<BufReader<Stdin>, Stdout> {
    /// The process's own stdin/stdout, as seen by a child of the parent.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<R: BufRead + Send, W: Write + Send> Transport for LineTransport<R, W> {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let mut encoded =
            serde_json::to_vec(frame).map_err(|e| TransportError::Malformed(e.to_string()))?;
        encoded.push(b'\n');
        self.writer.write_all(&encoded).map_err(closed_on_pipe)?;
        self.writer.flush().map_err(closed_on_pipe)?;
        Ok(())
    }

    fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Err(TransportError::Closed);
            }
            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }
            return serde_json::from_str(text)
                .map_err(|e| TransportError::Malformed(format!("{}: {:?}", e, text)));
        }
    }
}

fn closed_on_pipe(e: std::io::Error) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => TransportError::Closed,
        _ => TransportError::Io(e),
    }
}

// =============================================================================
// In-process transport
// =============================================================================

/// One end of an in-process transport pair.
///
/// Uses blocking calls on unbounded tokio channels, so it must not be driven
/// from inside an async task.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryTransport {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

impl Transport for MemoryTransport {
    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.tx
            .send(frame.clone())
            .map_err(|_| TransportError::Closed)
    }

    fn recv_frame(&mut self) -> Result<Frame, TransportError> {
        self.rx.blocking_recv().ok_or(TransportError::Closed)
    }
}

// =============================================================================
// Turn-taking channel
// =============================================================================

/// Where a channel is in its request/response cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// A request with this tag is outstanding
    AwaitingResponse(String),
    /// A violation happened; the channel is unusable
    Poisoned,
}

/// A transport plus the turn-taking rules.
pub struct MessageChannel<T> {
    name: &'static str,
    transport: T,
    state: LinkState,
}

impl<T: Transport> MessageChannel<T> {
    /// `name` identifies the peer in logs and errors.
    pub fn new(name: &'static str, transport: T) -> Self {
        Self {
            name,
            transport,
            state: LinkState::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Where the channel is in its request/response cycle.
    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Send a request; the channel then awaits exactly one response.
    pub fn request(&mut self, tag: &str, payload: Value) -> ComposeResult<()> {
        match &self.state {
            LinkState::Idle => {}
            LinkState::AwaitingResponse(outstanding) => {
                let detail = format!(
                    "request '{}' issued while '{}' is still awaiting its response",
                    tag, outstanding
                );
                return Err(self.poison(detail));
            }
            LinkState::Poisoned => return Err(self.refuse()),
        }
        self.send(Frame::new(tag, payload))?;
        self.state = LinkState::AwaitingResponse(tag.to_string());
        Ok(())
    }

    /// Block for the response to the outstanding request.
    ///
    /// Any tag other than `expected` is a protocol violation.
    pub fn await_response(&mut self, expected: &str) -> ComposeResult<Value> {
        match &self.state {
            LinkState::AwaitingResponse(_) => {}
            LinkState::Idle => {
                let detail = format!("waited for '{}' with no request outstanding", expected);
                return Err(self.poison(detail));
            }
            LinkState::Poisoned => return Err(self.refuse()),
        }
        let frame = self.recv()?;
        if frame.tag() != expected {
            let detail = format!(
                "expected '{}', received '{}' with payload {}",
                expected,
                frame.tag(),
                frame.payload()
            );
            return Err(self.poison(detail));
        }
        self.state = LinkState::Idle;
        Ok(frame.1)
    }

    /// Block for a message the peer sends on its own initiative.
    pub fn receive_unsolicited(&mut self) -> ComposeResult<Frame> {
        match &self.state {
            LinkState::Idle => self.recv(),
            LinkState::AwaitingResponse(outstanding) => {
                let detail = format!(
                    "listened for commands while '{}' is awaiting its response",
                    outstanding
                );
                Err(self.poison(detail))
            }
            LinkState::Poisoned => Err(self.refuse()),
        }
    }

    /// Answer a message received through [`receive_unsolicited`](Self::receive_unsolicited).
    pub fn reply(&mut self, tag: &str, payload: Value) -> ComposeResult<()> {
        match &self.state {
            LinkState::Idle => self.send(Frame::new(tag, payload)),
            LinkState::AwaitingResponse(outstanding) => {
                let detail = format!(
                    "reply '{}' sent while '{}' is awaiting its response",
                    tag, outstanding
                );
                Err(self.poison(detail))
            }
            LinkState::Poisoned => Err(self.refuse()),
        }
    }

    /// Mark the channel unusable and build the matching violation.
    pub fn poison(&mut self, detail: String) -> ComposeError {
        error!(channel = self.name, %detail, "protocol violation");
        self.state = LinkState::Poisoned;
        ComposeError::protocol(self.name, detail)
    }

    fn refuse(&self) -> ComposeError {
        ComposeError::protocol(self.name, "channel is poisoned by an earlier violation")
    }

    fn send(&mut self, frame: Frame) -> ComposeResult<()> {
        trace!(channel = self.name, tag = frame.tag(), "send");
        self.transport
            .send_frame(&frame)
            .map_err(|e| self.transport_failure(e))
    }

    fn recv(&mut self) -> ComposeResult<Frame> {
        let frame = self
            .transport
            .recv_frame()
            .map_err(|e| self.transport_failure(e))?;
        debug!(channel = self.name, tag = frame.tag(), "received");
        Ok(frame)
    }

    fn transport_failure(&mut self, e: TransportError) -> ComposeError {
        match e {
            TransportError::Malformed(detail) => self.poison(detail),
            TransportError::Closed => {
                self.state = LinkState::Poisoned;
                ComposeError::ChannelClosed(self.name.to_string())
            }
            TransportError::Io(io) => {
                error!(channel = self.name, error = %io, "transport failed");
                self.state = LinkState::Poisoned;
                ComposeError::ChannelClosed(self.name.to_string())
            }
        }
    }
}
