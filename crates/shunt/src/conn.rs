use std::time::Instant;

use mio::{Interest, net::TcpStream};

use crate::{buffer::Buffer, http::Request, pool::ConnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Backend,
}

/// Connection lifecycle. Transitions are driven exclusively by handlers on
/// the event-loop thread; `Closing` and `RequestComplete` are transient
/// within a single handler invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Closed,
    Connecting,
    Connected,
    /// HTTP client accumulating its request head (no peer yet).
    ReadingRequest,
    /// Head accepted, backend dial underway.
    RequestComplete,
    /// HTTP client streaming the response (and any remaining body bytes).
    WritingResponse,
    Closing,
}

/// One pool slot: an owned socket, its pairing, two buffers, and the
/// HTTP-mode bookkeeping. Buffers are allocated once per slot and survive
/// reuse.
pub struct Conn {
    pub stream: Option<TcpStream>,
    pub role: Role,
    pub state: State,
    pub peer: Option<ConnId>,
    pub read_buf: Buffer,
    pub write_buf: Buffer,
    pub last_active: Instant,
    /// Mask currently registered with the poller; `None` before the first
    /// registration of this slot use.
    pub interest: Option<Interest>,
    pub request: Request,
    pub keep_alive: bool,
    pub requests_handled: u32,
    /// Request body bytes still expected from the client after dispatch.
    /// `u64::MAX` while streaming an unframed (chunked) body.
    pub body_remaining: u64,
}

impl Conn {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            stream: None,
            role: Role::Client,
            state: State::Closed,
            peer: None,
            read_buf: Buffer::with_capacity(buffer_size),
            write_buf: Buffer::with_capacity(buffer_size),
            last_active: Instant::now(),
            interest: None,
            request: Request::default(),
            keep_alive: false,
            requests_handled: 0,
            body_remaining: 0,
        }
    }

    /// Returns a reused slot to its initial shape. The caller assigns role,
    /// state and stream afterwards.
    pub fn reset(&mut self) {
        debug_assert!(self.stream.is_none());
        self.peer = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.last_active = Instant::now();
        self.interest = None;
        self.request.reset();
        self.keep_alive = false;
        self.requests_handled = 0;
        self.body_remaining = 0;
    }

    #[inline]
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Whether the loop should keep READABLE interest armed. `peer_full`
    /// reports the paired side's write buffer; it is the backpressure
    /// signal that lets the kernel receive window fill and slow the remote
    /// sender.
    pub fn wants_read(&self, peer_full: bool) -> bool {
        match self.state {
            State::ReadingRequest => !self.read_buf.is_full(),
            State::Connected => self.peer.is_some() && !peer_full,
            State::WritingResponse => {
                self.role == Role::Client
                    && self.peer.is_some()
                    && self.body_remaining > 0
                    && !peer_full
            }
            _ => false,
        }
    }

    /// WRITABLE interest: connect completion is observed as writability,
    /// and queued bytes need the next writable edge.
    #[inline]
    pub fn wants_write(&self) -> bool {
        self.state == State::Connecting || !self.write_buf.is_empty()
    }

    /// Cap on bytes forward() may move out of this connection's read
    /// buffer. Unlimited except for a client streaming a framed body.
    pub fn forward_limit(&self) -> usize {
        if self.role == Role::Client && self.state == State::WritingResponse {
            usize::try_from(self.body_remaining).unwrap_or(usize::MAX)
        } else {
            usize::MAX
        }
    }

    pub fn note_forwarded(&mut self, n: usize) {
        if self.role == Role::Client
            && self.state == State::WritingResponse
            && self.body_remaining != u64::MAX
        {
            self.body_remaining = self.body_remaining.saturating_sub(n as u64);
        }
    }
}
