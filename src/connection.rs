//! Framed, sequence-counted stream connection
//!
//! A [`Connection`] turns a byte stream with no message boundaries into
//! "send one frame" / "receive one frame" operations that tolerate
//! non-blocking partial reads.
//!
//! # Receive state machine
//!
//! ```text
//!            read == wanted
//!   ┌──────┐ ─────────────► done
//!   │ Idle │
//!   └──┬───┘ partial read: copy into carry-over
//!      ▼
//!   ┌──────────────┐  would block: keep carry-over, report "not yet"
//!   │ Accumulating │ ◄──┐
//!   └──────┬───────┘ ───┘
//!          │ carry-over full: copy out, back to Idle
//!          ▼
//!         done
//! ```
//!
//! A frame is received in two such steps, header then payload. When the
//! payload step stalls, the decoded header is parked in `pending_header` so
//! the next attempt resumes with the payload.
//!
//! # Counters
//!
//! Every sent frame embeds the connection's 8-bit send counter, which then
//! wraps forward. Every received frame must carry exactly the expected
//! receive counter. A mismatch is a fatal desync; loss or reordering never
//! happens on a healthy local socket, so it is detected rather than tolerated.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use bytes::BytesMut;

use crate::buffer::ByteBuffer;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Frame, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_LEN};

/// How [`Connection::send_frame`] treats a full outbound socket buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Keep writing until the whole frame is out
    Blocking,
    /// Exactly one write; report [`SendOutcome::WouldBlock`] if nothing was accepted
    NonBlocking,
}

/// Result of a send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame fully written; wire bytes
    Sent(usize),
    /// Nothing written, try again later
    WouldBlock,
}

/// Largest carry-over growth per read
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Idle,
    Accumulating { wanted: usize },
}

/// One framed stream endpoint
#[derive(Debug)]
pub struct Connection<S = UnixStream> {
    stream: S,
    send_buf: ByteBuffer,
    carry: BytesMut,
    state: RecvState,
    pending_header: Option<FrameHeader>,
    send_counter: u8,
    recv_counter: u8,
    max_payload: usize,
}

impl<S: Read + Write> Connection<S> {
    /// Wrap a stream accepting payloads up to the protocol maximum
    pub fn new(stream: S) -> Self {
        Self::with_max_payload(stream, MAX_PAYLOAD_LEN)
    }

    /// Wrap a stream with a tighter receive limit
    pub fn with_max_payload(stream: S, max_payload: usize) -> Self {
        let max_payload = max_payload.min(MAX_PAYLOAD_LEN);
        Self {
            stream,
            send_buf: ByteBuffer::with_capacity(4096, HEADER_SIZE + MAX_PAYLOAD_LEN),
            carry: BytesMut::new(),
            state: RecvState::Idle,
            pending_header: None,
            send_counter: 0,
            recv_counter: 0,
            max_payload,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Counter the next sent frame will carry
    pub fn send_counter(&self) -> u8 {
        self.send_counter
    }

    /// Counter the next received frame must carry
    pub fn recv_counter(&self) -> u8 {
        self.recv_counter
    }

    /// Whether a frame is partially received
    pub fn has_partial(&self) -> bool {
        self.state != RecvState::Idle || self.pending_header.is_some()
    }

    /// Serialize and write one frame.
    ///
    /// The send counter only advances when the frame was fully written.
    pub fn send_frame(&mut self, frame: &Frame, mode: SendMode) -> Result<SendOutcome> {
        frame.encode_into(self.send_counter, &mut self.send_buf)?;
        let len = self.send_buf.len();

        let outcome = match mode {
            SendMode::Blocking => {
                self.write_all_blocking()?;
                SendOutcome::Sent(len)
            }
            SendMode::NonBlocking => match write_once(&mut self.stream, self.send_buf.as_slice())? {
                None | Some(0) => SendOutcome::WouldBlock,
                Some(n) if n == len => SendOutcome::Sent(len),
                Some(n) => {
                    return Err(ProtocolError::PartialWrite {
                        written: n,
                        expected: len,
                    }
                    .into())
                }
            },
        };

        if let SendOutcome::Sent(_) = outcome {
            self.send_counter = self.send_counter.wrapping_add(1);
        }
        Ok(outcome)
    }

    fn write_all_blocking(&mut self) -> Result<()> {
        let mut written = 0;
        let buf = self.send_buf.as_slice();
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // A blocking socket only reports this when its write timeout expired
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, e).into())
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Try to fill `target` completely.
    ///
    /// Returns `Ok(false)` when the stream would block before `target` is
    /// full; buffered bytes are kept for the next call, which must ask for
    /// the same length.
    pub fn recv_exact(&mut self, target: &mut [u8]) -> Result<bool> {
        let wanted = target.len();
        if wanted == 0 {
            return Ok(true);
        }

        if self.state == RecvState::Idle {
            match read_once(&mut self.stream, target)? {
                None => return Ok(false),
                Some(0) => return Err(Error::Disconnected),
                Some(n) if n == wanted => return Ok(true),
                Some(n) => {
                    self.carry.clear();
                    self.carry.extend_from_slice(&target[..n]);
                    self.state = RecvState::Accumulating { wanted };
                }
            }
        }

        if !self.accumulate(wanted)? {
            return Ok(false);
        }
        target.copy_from_slice(&self.carry[..wanted]);
        self.carry.clear();
        self.state = RecvState::Idle;
        Ok(true)
    }

    /// Read into the carry-over until it holds `wanted` bytes
    fn accumulate(&mut self, wanted: usize) -> Result<bool> {
        if let RecvState::Accumulating { wanted: expected } = self.state {
            debug_assert_eq!(expected, wanted, "resumed receive with a different length");
        }

        while self.carry.len() < wanted {
            let start = self.carry.len();
            // Grow by bounded steps so a stalled large payload is not re-zeroed per wake
            self.carry.resize(wanted.min(start + READ_CHUNK), 0);
            let result = read_once(&mut self.stream, &mut self.carry[start..]);
            match result {
                Ok(Some(n)) if n > 0 => self.carry.truncate(start + n),
                Ok(Some(_)) => {
                    self.carry.truncate(start);
                    return Err(Error::Disconnected);
                }
                Ok(None) => {
                    self.carry.truncate(start);
                    return Ok(false);
                }
                Err(e) => {
                    self.carry.truncate(start);
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    /// Receive one frame if a complete one is available.
    ///
    /// `Ok(None)` means the stream would block; call again when readable.
    pub fn recv_frame(&mut self) -> Result<Option<Frame>> {
        let header = match self.pending_header.take() {
            Some(header) => header,
            None => {
                let mut raw = [0u8; HEADER_SIZE];
                if !self.recv_exact(&mut raw)? {
                    return Ok(None);
                }
                let header = FrameHeader::decode(&raw);
                header.validate(self.max_payload)?;
                if header.counter != self.recv_counter {
                    return Err(ProtocolError::CounterMismatch {
                        expected: self.recv_counter,
                        received: header.counter,
                    }
                    .into());
                }
                header
            }
        };

        let payload = match self.state {
            RecvState::Idle => {
                let mut payload = BytesMut::zeroed(header.payload_len);
                if !self.recv_exact(&mut payload)? {
                    self.pending_header = Some(header);
                    return Ok(None);
                }
                payload.freeze()
            }
            // A stalled payload completes in the carry-over and is handed out as is
            RecvState::Accumulating { .. } => {
                if !self.accumulate(header.payload_len)? {
                    self.pending_header = Some(header);
                    return Ok(None);
                }
                self.state = RecvState::Idle;
                self.carry.split().freeze()
            }
        };

        self.recv_counter = self.recv_counter.wrapping_add(1);
        Ok(Some(Frame::from_parts(header, payload)))
    }
}

impl Connection<UnixStream> {
    /// Switch the socket between blocking and non-blocking I/O
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.stream.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Bound blocking reads (used for the auth handshake)
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Bound blocking sends; `None` blocks for as long as the peer stalls
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Block until a whole frame has arrived
    pub fn recv_frame_blocking(&mut self) -> Result<Frame> {
        loop {
            match self.recv_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {
                    // A blocking socket only reports "would block" once its read timeout fired
                    return Err(io::Error::from(io::ErrorKind::TimedOut).into());
                }
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<S: AsRawFd> AsRawFd for Connection<S> {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// One read; `None` when the stream would block
fn read_once<S: Read>(stream: &mut S, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        match stream.read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

/// One write; `None` when the stream would block
fn write_once<S: Write>(stream: &mut S, buf: &[u8]) -> Result<Option<usize>> {
    loop {
        match stream.write(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}
