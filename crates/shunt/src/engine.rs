//! Readiness-driven forwarding engine: the accept loop, the per-event
//! handlers, the `forward` copy primitive and the event-mask discipline.
//!
//! Edge-triggered contract: a readable handler drains its socket until
//! WouldBlock (or backpressure parks it), a writable handler drains the
//! write buffer until empty or WouldBlock. Anything less deadlocks the
//! pair, because no further edge fires until the remote sends more.

use std::{
    io::{self, Write},
    net::{SocketAddr, SocketAddrV4},
    time::{Duration, Instant},
};

use mio::{
    Events, Interest,
    event::Event,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, error, warn};

use crate::{
    buffer::{ReadOutcome, WriteOutcome},
    config::{
        CONNECT_TIMEOUT, IDLE_TIMEOUT, MAX_REQUESTS_PER_CONN, MAX_REQUEST_SIZE, Mode, ProxyConfig,
    },
    conn::{Role, State},
    error::ProxyError,
    http::{self, ParseStatus},
    poller::{LISTENER, Poller},
    pool::{ConnId, Pool},
    sock::{self, DialState},
    stats::Stats,
};

/// Compact a destination buffer before forwarding into it when its tail
/// slack drops below this and bytes are reclaimable at the head.
const COMPACT_SLACK: usize = 1024;

enum Flush {
    Drained,
    Blocked,
    Error,
}

enum DialIssue {
    PoolExhausted,
    Failed,
}

enum Step {
    NeedMore,
    Handled,
}

pub struct Engine {
    mode: Mode,
    backend_addr: SocketAddrV4,
    poller: Poller,
    listener: TcpListener,
    pool: Pool,
    stats: Stats,
}

impl Engine {
    pub fn new(cfg: &ProxyConfig) -> Result<Self, ProxyError> {
        let poller = Poller::new().map_err(ProxyError::Poller)?;
        let mut listener =
            sock::listen(cfg.listen).map_err(|err| ProxyError::Bind { addr: cfg.listen, err })?;
        poller
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ProxyError::RegisterListener)?;
        Ok(Self {
            mode: cfg.mode,
            backend_addr: cfg.backend,
            poller,
            listener,
            pool: Pool::with_capacity(cfg.max_connections, cfg.buffer_size),
            stats: Stats::default(),
        })
    }

    pub fn wait(&mut self, events: &mut Events, timeout: Duration) -> io::Result<()> {
        self.poller.wait(events, timeout)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Routes one readiness event. For a single connection, writable
    /// handling runs before readable handling to bias toward draining
    /// outbound buffers first; connect completion is a writable event and
    /// therefore precedes any reads in the same wake-up.
    pub fn dispatch(&mut self, ev: &Event) {
        let token = ev.token();
        if token == LISTENER {
            self.accept_ready();
            return;
        }
        // Tokens carry the slot generation: an event for a connection that
        // died (and possibly got recycled) earlier in this wake-up resolves
        // to nothing.
        let Some(id) = self.pool.resolve(token) else { return };
        if ev.is_error() {
            self.on_error(id);
            return;
        }
        if ev.is_writable() {
            self.on_writable(id);
            if self.pool.resolve(token).is_none() {
                return;
            }
        }
        if ev.is_readable() {
            self.on_readable(id);
            if self.pool.resolve(token).is_none() {
                return;
            }
        }
        if ev.is_read_closed() && ev.is_write_closed() {
            self.on_error(id);
        }
    }

    /// Accepts until WouldBlock. TCP mode pairs each client with a freshly
    /// dialed backend immediately; HTTP mode defers the dial until a valid
    /// request head has arrived.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.accept_one(stream, addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(?err, "accept failed");
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(err) = sock::prepare_accepted(&stream) {
            debug!(?err, "options on accepted socket");
        }
        let Some(client_id) = self.pool.alloc() else {
            debug!(%addr, "connection pool exhausted, refusing client");
            if self.mode == Mode::Http {
                // Best-effort refusal; the socket is dropped either way.
                let _ = stream.write(http::RESPONSE_503);
            }
            return;
        };
        self.stats.total_connections += 1;
        self.stats.active_connections += 1;

        let conn = self.pool.get_mut(client_id);
        conn.role = Role::Client;
        conn.state = if self.mode == Mode::Http { State::ReadingRequest } else { State::Connected };
        conn.interest = Some(Interest::READABLE);
        conn.touch();

        let token = self.pool.token(client_id);
        if let Err(err) = self.poller.register(&mut stream, token, Interest::READABLE) {
            error!(?err, "failed to register accepted client");
            drop(stream);
            self.release_slot(client_id);
            return;
        }
        self.pool.get_mut(client_id).stream = Some(stream);
        debug!(%addr, slot = client_id.index(), "client accepted");

        if self.mode == Mode::Tcp && self.dial_backend(client_id).is_err() {
            self.close_connection(client_id);
        }
    }

    /// Allocates a backend slot and starts a non-blocking connect to the
    /// upstream. On success the two connections are paired and the backend
    /// is registered (writable while connecting, so completion is seen).
    fn dial_backend(&mut self, client_id: ConnId) -> Result<ConnId, DialIssue> {
        let Some(backend_id) = self.pool.alloc() else {
            warn!("connection pool exhausted, cannot dial backend");
            return Err(DialIssue::PoolExhausted);
        };
        self.stats.total_connections += 1;
        self.stats.active_connections += 1;
        let (mut stream, dial) = match sock::dial(self.backend_addr) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(?err, backend = %self.backend_addr, "backend dial failed");
                self.stats.dial_failures += 1;
                self.release_slot(backend_id);
                return Err(DialIssue::Failed);
            }
        };

        let interest = match dial {
            DialState::Connecting => Interest::WRITABLE,
            DialState::Connected => Interest::READABLE,
        };
        let token = self.pool.token(backend_id);
        if let Err(err) = self.poller.register(&mut stream, token, interest) {
            error!(?err, "failed to register backend socket");
            drop(stream);
            self.release_slot(backend_id);
            return Err(DialIssue::Failed);
        }
        if dial == DialState::Connected {
            self.stats.connects_completed += 1;
        }
        let conn = self.pool.get_mut(backend_id);
        conn.role = Role::Backend;
        conn.state = match dial {
            DialState::Connecting => State::Connecting,
            DialState::Connected => State::Connected,
        };
        conn.stream = Some(stream);
        conn.peer = Some(client_id);
        conn.interest = Some(interest);
        conn.touch();
        self.pool.get_mut(client_id).peer = Some(backend_id);
        debug!(slot = backend_id.index(), peer = client_id.index(), ?dial, "backend dialed");
        Ok(backend_id)
    }

    fn on_readable(&mut self, id: ConnId) {
        let conn = self.pool.get(id);
        if self.mode == Mode::Http && conn.role == Role::Client && conn.state == State::ReadingRequest
        {
            self.read_request(id);
        } else {
            self.pipe_readable(id);
        }
    }

    /// Drain-and-forward loop for paired connections (both directions in
    /// TCP mode, backend responses and request body bytes in HTTP mode).
    /// Stops on WouldBlock or when backpressure leaves no room to read.
    fn pipe_readable(&mut self, id: ConnId) {
        let Some(peer_id) = self.pool.get(id).peer else {
            // Nothing to forward into. A backend that outlived its client
            // has no further use.
            if self.pool.get(id).role == Role::Backend {
                self.close_connection(id);
            }
            return;
        };
        loop {
            self.forward(id, peer_id);
            if self.pool.get(id).read_buf.writable_len() == 0 {
                // Out of room: drain the peer toward its socket before
                // giving up, so a fast source cannot wedge behind two full
                // buffers.
                if let Flush::Error = self.flush(peer_id) {
                    self.close_pair(peer_id);
                    return;
                }
                self.forward(id, peer_id);
                if self.pool.get(id).read_buf.writable_len() == 0 {
                    // True backpressure: both buffers full, kernel tx full.
                    // The peer's next writable edge resumes the flow.
                    break;
                }
            }
            let conn = self.pool.get_mut(id);
            let Some(stream) = conn.stream.as_mut() else { return };
            match conn.read_buf.read_from(stream) {
                ReadOutcome::Bytes(_) => conn.touch(),
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => {
                    self.forward(id, peer_id);
                    self.handle_eof(id);
                    return;
                }
                ReadOutcome::NoSpace => break,
                ReadOutcome::Error(err) => {
                    self.read_failed(id, &err);
                    return;
                }
            }
        }
        self.forward(id, peer_id);
        if let Flush::Error = self.flush(peer_id) {
            self.close_pair(peer_id);
            return;
        }
        self.update_interest(id);
        self.update_interest(peer_id);
    }

    /// Copies up to `min(src readable, dst tail, src forward limit)` bytes
    /// between the paired buffers. Returns the copy count.
    fn forward(&mut self, src_id: ConnId, dst_id: ConnId) -> usize {
        let (src, dst) = self.pool.pair_mut(src_id, dst_id);
        let limit = src.forward_limit();
        if limit == 0 || src.read_buf.is_empty() {
            return 0;
        }
        if dst.write_buf.head() > 0 && dst.write_buf.writable_len() < COMPACT_SLACK {
            dst.write_buf.compact();
        }
        let n = src.read_buf.readable_len().min(dst.write_buf.writable_len()).min(limit);
        if n == 0 {
            return 0;
        }
        let copied = dst.write_buf.push(&src.read_buf.readable()[..n]);
        src.read_buf.consume(copied);
        src.note_forwarded(copied);
        self.stats.bytes_forwarded += copied as u64;
        copied
    }

    /// HTTP client readable path: accumulate the head, parse after every
    /// read, dispatch on completion.
    fn read_request(&mut self, id: ConnId) {
        loop {
            if !self.pool.get(id).read_buf.is_empty() {
                match self.parse_step(id) {
                    Step::NeedMore => {}
                    Step::Handled => {
                        let conn = self.pool.get(id);
                        if conn.state == State::WritingResponse
                            && conn.peer.is_some()
                            && conn.body_remaining > 0
                        {
                            // The rest of the body rides the pipe path.
                            self.pipe_readable(id);
                        }
                        return;
                    }
                }
            }
            let conn = self.pool.get_mut(id);
            if conn.read_buf.is_full() || conn.read_buf.readable_len() >= MAX_REQUEST_SIZE {
                debug!(slot = id.index(), "request exceeds buffering limit");
                self.queue_error_response(id, http::RESPONSE_413);
                return;
            }
            let Some(stream) = conn.stream.as_mut() else { return };
            match conn.read_buf.read_from(stream) {
                ReadOutcome::Bytes(_) => conn.touch(),
                ReadOutcome::WouldBlock => break,
                ReadOutcome::Eof => {
                    self.close_pair(id);
                    return;
                }
                ReadOutcome::NoSpace => {
                    self.queue_error_response(id, http::RESPONSE_413);
                    return;
                }
                ReadOutcome::Error(err) => {
                    self.read_failed(id, &err);
                    return;
                }
            }
        }
        self.update_interest(id);
    }

    /// Runs the parser against the buffered prefix and acts on the result.
    fn parse_step(&mut self, id: ConnId) -> Step {
        let conn = self.pool.get_mut(id);
        let cap = conn.read_buf.capacity();
        let status = conn.request.parse(conn.read_buf.readable(), cap);
        match status {
            ParseStatus::NeedMore => Step::NeedMore,
            ParseStatus::Invalid => {
                debug!(slot = id.index(), "malformed request head");
                self.queue_error_response(id, http::RESPONSE_400);
                Step::Handled
            }
            ParseStatus::Complete => {
                let conn = self.pool.get_mut(id);
                conn.state = State::RequestComplete;
                if conn.request.is_valid() {
                    self.dispatch_request(id);
                } else {
                    debug!(
                        slot = id.index(),
                        method = %self.pool.get(id).request.method_raw,
                        "request failed validation"
                    );
                    self.queue_error_response(id, http::RESPONSE_400);
                }
                Step::Handled
            }
        }
    }

    /// A validated head: dial a fresh backend, pair, and hand it the
    /// buffered request prefix. Pipelined bytes past the request stay in
    /// the client buffer for the next keep-alive round.
    fn dispatch_request(&mut self, id: ConnId) {
        match self.dial_backend(id) {
            Ok(backend_id) => {
                let reused = {
                    let (client, backend) = self.pool.pair_mut(id, backend_id);
                    let total = client.request.total_len;
                    let chunked = client.request.chunked;
                    let keep_alive = client.request.keep_alive;
                    let prefix = total.min(client.read_buf.readable_len());
                    let copied = backend.write_buf.push(&client.read_buf.readable()[..prefix]);
                    debug_assert_eq!(copied, prefix);
                    client.read_buf.consume(copied);
                    client.state = State::WritingResponse;
                    client.keep_alive = keep_alive;
                    client.requests_handled += 1;
                    client.body_remaining =
                        if chunked { u64::MAX } else { (total - prefix) as u64 };
                    client.touch();
                    client.requests_handled > 1
                };
                self.stats.requests_handled += 1;
                if reused {
                    self.stats.keep_alive_reused += 1;
                }
                // A fast-path connect can take the request right away.
                if self.pool.get(backend_id).state == State::Connected {
                    if let Flush::Error = self.flush(backend_id) {
                        self.close_pair(backend_id);
                        return;
                    }
                }
                self.update_interest(id);
                self.update_interest(backend_id);
            }
            Err(DialIssue::PoolExhausted) => self.queue_error_response(id, http::RESPONSE_503),
            Err(DialIssue::Failed) => self.queue_error_response(id, http::RESPONSE_502),
        }
    }

    /// Queues a canned response on the client and tears down any paired
    /// backend. The response always fits the (just cleared) write buffer;
    /// truncation is refused by closing instead.
    fn queue_error_response(&mut self, id: ConnId, response: &'static [u8]) {
        self.stats.requests_error += 1;
        if let Some(peer_id) = self.pool.get(id).peer {
            self.close_connection(peer_id);
        }
        let conn = self.pool.get_mut(id);
        conn.write_buf.clear();
        conn.keep_alive = false;
        conn.body_remaining = 0;
        conn.state = State::WritingResponse;
        if conn.write_buf.push(response) != response.len() {
            self.close_connection(id);
            return;
        }
        match self.flush(id) {
            Flush::Error => self.close_connection(id),
            Flush::Drained => self.finish_response(id),
            Flush::Blocked => self.update_interest(id),
        }
    }

    fn on_writable(&mut self, id: ConnId) {
        if self.pool.get(id).state == State::Connecting {
            let conn = self.pool.get_mut(id);
            let Some(stream) = conn.stream.as_mut() else { return };
            match stream.take_error() {
                Ok(None) => {
                    conn.state = State::Connected;
                    conn.touch();
                    self.stats.connects_completed += 1;
                    debug!(slot = id.index(), "backend connected");
                }
                Ok(Some(err)) | Err(err) => {
                    self.connect_failed(id, &err);
                    return;
                }
            }
        }
        match self.flush(id) {
            Flush::Error => {
                self.close_pair(id);
                return;
            }
            Flush::Blocked => {
                self.update_interest(id);
                return;
            }
            Flush::Drained => {}
        }
        // Post-drain: a client that has flushed its whole response decides
        // between keep-alive re-entry and teardown once the backend is gone.
        let conn = self.pool.get(id);
        if self.mode == Mode::Http
            && conn.role == Role::Client
            && conn.state == State::WritingResponse
            && conn.peer.is_none()
            && conn.write_buf.is_empty()
        {
            self.finish_response(id);
            return;
        }
        if let Some(p) = conn.peer {
            // The drained buffer made room: pull whatever the peer has
            // parked in its read buffer (and its kernel queue, which will
            // not edge again for data that already arrived).
            self.pipe_readable(p);
            return;
        }
        self.update_interest(id);
    }

    /// Drains the write buffer until empty or WouldBlock.
    fn flush(&mut self, id: ConnId) -> Flush {
        let conn = self.pool.get_mut(id);
        let Some(stream) = conn.stream.as_mut() else { return Flush::Error };
        let mut wrote = false;
        let result = loop {
            if conn.write_buf.is_empty() {
                break Flush::Drained;
            }
            match conn.write_buf.write_to(stream) {
                WriteOutcome::Bytes(_) => wrote = true,
                WriteOutcome::WouldBlock => break Flush::Blocked,
                WriteOutcome::Error(err) => {
                    if matches!(
                        err.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        debug!(slot = id.index(), ?err, "peer went away during write");
                    } else {
                        warn!(slot = id.index(), ?err, "write failed");
                    }
                    break Flush::Error;
                }
            }
        };
        if wrote {
            conn.touch();
        }
        result
    }

    /// Response fully delivered: either re-enter the read state for the
    /// next request on this connection, or retire it.
    fn finish_response(&mut self, id: ConnId) {
        let conn = self.pool.get(id);
        let reusable = conn.keep_alive
            && conn.requests_handled < MAX_REQUESTS_PER_CONN
            && conn.body_remaining == 0;
        if !reusable {
            self.close_connection(id);
            return;
        }
        let conn = self.pool.get_mut(id);
        conn.write_buf.clear();
        conn.request.reset();
        conn.state = State::ReadingRequest;
        conn.touch();
        // A pipelined request may already be buffered, and bytes that
        // arrived before re-entry produce no further edge. Service them
        // now.
        self.read_request(id);
    }

    fn connect_failed(&mut self, id: ConnId, err: &io::Error) {
        warn!(slot = id.index(), ?err, backend = %self.backend_addr, "backend connect failed");
        self.stats.dial_failures += 1;
        let peer = self.pool.get(id).peer;
        match (self.mode, peer) {
            (Mode::Http, Some(client)) => {
                self.close_connection(id);
                self.queue_error_response(client, http::RESPONSE_502);
            }
            _ => self.close_pair(id),
        }
    }

    fn read_failed(&mut self, id: ConnId, err: &io::Error) {
        if matches!(err.kind(), io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe) {
            debug!(slot = id.index(), ?err, "peer reset");
        } else {
            warn!(slot = id.index(), ?err, "read failed");
        }
        self.close_pair(id);
    }

    fn handle_eof(&mut self, id: ConnId) {
        match (self.mode, self.pool.get(id).role) {
            (Mode::Tcp, _) | (Mode::Http, Role::Client) => self.close_pair(id),
            (Mode::Http, Role::Backend) => {
                // Upstream finished sending; with one backend per request,
                // its close delimits the response.
                let client = self.pool.get(id).peer;
                self.close_connection(id);
                if let Some(c) = client {
                    match self.flush(c) {
                        Flush::Error => self.close_connection(c),
                        Flush::Drained => self.finish_response(c),
                        Flush::Blocked => self.update_interest(c),
                    }
                }
            }
        }
    }

    fn on_error(&mut self, id: ConnId) {
        if self.pool.get(id).state == State::Connecting {
            let err = self
                .pool
                .get_mut(id)
                .stream
                .as_mut()
                .and_then(|s| s.take_error().ok().flatten())
                .unwrap_or_else(|| io::ErrorKind::ConnectionRefused.into());
            self.connect_failed(id, &err);
            return;
        }
        let err =
            self.pool.get_mut(id).stream.as_mut().and_then(|s| s.take_error().ok().flatten());
        debug!(slot = id.index(), ?err, "socket error or hangup");
        self.close_pair(id);
    }

    /// Recomputes the registered event mask from the readiness predicates.
    /// A live connection that wants neither falls back to READABLE so
    /// errors and remote close still get delivered.
    fn update_interest(&mut self, id: ConnId) {
        let conn = self.pool.get(id);
        if conn.state == State::Closed || conn.stream.is_none() {
            return;
        }
        let peer_full = conn.peer.is_some_and(|p| self.pool.get(p).write_buf.is_full());
        let rd = conn.wants_read(peer_full);
        let wr = conn.wants_write();
        let desired = if rd && wr {
            Interest::READABLE | Interest::WRITABLE
        } else if wr {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if conn.interest == Some(desired) {
            return;
        }
        let token = self.pool.token(id);
        let conn = self.pool.get_mut(id);
        let Some(stream) = conn.stream.as_mut() else { return };
        if let Err(err) = self.poller.reregister(stream, token, desired) {
            debug!(slot = id.index(), ?err, "reregister failed");
            return;
        }
        conn.interest = Some(desired);
    }

    /// Unregisters and closes the fd, breaks the pairing on both sides and
    /// returns the slot. Safe to call twice: the second call is a no-op.
    fn close_connection(&mut self, id: ConnId) {
        if self.pool.get(id).state == State::Closed {
            return;
        }
        let conn = self.pool.get_mut(id);
        conn.state = State::Closing;
        let peer = conn.peer.take();
        let stream = conn.stream.take();
        if let Some(p) = peer {
            self.pool.get_mut(p).peer = None;
        }
        if let Some(mut stream) = stream {
            self.poller.deregister(&mut stream);
            // Dropping the stream closes the fd.
        }
        self.stats.active_connections = self.stats.active_connections.saturating_sub(1);
        self.pool.free(id);
        debug!(slot = id.index(), "connection closed");
    }

    /// Closes both sides. The peer reference is snapshotted first because
    /// the first close unpairs.
    fn close_pair(&mut self, id: ConnId) {
        let peer = self.pool.get(id).peer;
        self.close_connection(id);
        if let Some(p) = peer {
            self.close_connection(p);
        }
    }

    /// Returns a slot that never got a socket.
    fn release_slot(&mut self, id: ConnId) {
        self.stats.active_connections = self.stats.active_connections.saturating_sub(1);
        self.pool.free(id);
    }

    /// Once-per-second maintenance: fail backends stuck in the handshake
    /// and reap idle pairs.
    pub fn sweep_idle(&mut self) {
        let now = Instant::now();
        for id in self.pool.live_ids() {
            let conn = self.pool.get(id);
            if conn.state == State::Closed {
                // Reaped as the peer of an earlier victim in this sweep.
                continue;
            }
            let idle = now.duration_since(conn.last_active);
            if conn.state == State::Connecting && idle >= CONNECT_TIMEOUT {
                debug!(slot = id.index(), "backend connect timed out");
                self.stats.dial_failures += 1;
                let peer = self.pool.get(id).peer;
                self.close_connection(id);
                match (self.mode, peer) {
                    (Mode::Http, Some(client)) => {
                        self.queue_error_response(client, http::RESPONSE_502);
                    }
                    (Mode::Tcp, Some(client)) => self.close_connection(client),
                    _ => {}
                }
            } else if idle >= IDLE_TIMEOUT {
                debug!(slot = id.index(), "closing idle connection");
                self.close_pair(id);
            }
        }
    }

    pub fn log_stats(&self) {
        debug!(
            active = self.stats.active_connections,
            total = self.stats.total_connections,
            forwarded = self.stats.bytes_forwarded,
            requests = self.stats.requests_handled,
            errors = self.stats.requests_error,
            reused = self.stats.keep_alive_reused,
            "periodic stats"
        );
    }

    /// Closes every live slot and drops the listener registration.
    pub fn shutdown_all(&mut self) {
        for id in self.pool.live_ids() {
            self.close_connection(id);
        }
        self.poller.deregister(&mut self.listener);
    }
}
