use std::{io, time::Duration};

use mio::{Events, Interest, Poll, Token, event::Source};
use tracing::debug;

/// Distinguished token for the listening socket; connection tokens encode
/// a pool slot plus its generation.
pub const LISTENER: Token = Token(usize::MAX);

/// Thin wrapper over the edge-triggered event source. Interest must be
/// re-submitted via `reregister` every time the desired mask changes.
pub struct Poller {
    poll: Poll,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self { poll: Poll::new()? })
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        src: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(src, token, interest)
    }

    pub fn reregister<S: Source + ?Sized>(
        &self,
        src: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(src, token, interest)
    }

    /// Tolerant of fds that are already gone; a dying connection must not
    /// take the loop down with it.
    pub fn deregister<S: Source + ?Sized>(&self, src: &mut S) {
        if let Err(err) = self.poll.registry().deregister(src) {
            debug!(?err, "deregister on dying fd");
        }
    }

    /// Blocks up to `timeout`. A signal-interrupted wait is reported as an
    /// empty wake, not an error.
    pub fn wait(&mut self, events: &mut Events, timeout: Duration) -> io::Result<()> {
        match self.poll.poll(events, Some(timeout)) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            }
            other => other,
        }
    }
}
