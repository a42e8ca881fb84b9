use std::io::{self, Read, Write};

/// Outcome of filling the buffer from a non-blocking source.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n > 0` bytes were appended at the tail.
    Bytes(usize),
    /// The peer closed its write side.
    Eof,
    /// Nothing to read right now; re-arm and wait for the next edge.
    WouldBlock,
    /// The writable tail is empty. The caller must compact, drain the
    /// peer, or stop reading (backpressure) before trying again.
    NoSpace,
    Error(io::Error),
}

/// Outcome of draining the buffer into a non-blocking sink.
#[derive(Debug)]
pub enum WriteOutcome {
    Bytes(usize),
    WouldBlock,
    Error(io::Error),
}

/// Fixed-capacity byte window with append-at-tail / drain-from-head
/// cursors and lazy compaction.
///
/// Readable span is `[head, tail)`, writable tail is `[tail, capacity)`.
/// Invariant: `head <= tail <= capacity`. Any operation that leaves the
/// buffer empty resets both cursors to 0, so under edge-triggered readiness
/// (where most drains complete fully) compaction is rare.
pub struct Buffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: vec![0; capacity].into_boxed_slice(), head: 0, tail: 0 }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn readable_len(&self) -> usize {
        self.tail - self.head
    }

    #[inline]
    pub fn writable_len(&self) -> usize {
        self.data.len() - self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// True when the readable span covers the whole capacity: no tail space
    /// and nothing reclaimable by compaction.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.readable_len() == self.data.len()
    }

    #[inline]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    /// Drops `n` bytes from the head. Resets both cursors when the drain
    /// empties the buffer.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.readable_len());
        self.head += n;
        if self.head == self.tail {
            self.clear();
        }
    }

    /// Appends as much of `src` as fits in the writable tail. Returns the
    /// number of bytes copied.
    pub fn push(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.writable_len());
        self.data[self.tail..self.tail + n].copy_from_slice(&src[..n]);
        self.tail += n;
        n
    }

    /// Moves the readable span to offset 0. No-op when `head == 0`.
    pub fn compact(&mut self) {
        if self.head == 0 {
            return;
        }
        self.data.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }

    /// Fills the writable tail from `src` with a single read call,
    /// retrying on EINTR.
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> ReadOutcome {
        if self.writable_len() == 0 {
            return ReadOutcome::NoSpace;
        }
        loop {
            return match src.read(&mut self.data[self.tail..]) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => {
                    self.tail += n;
                    ReadOutcome::Bytes(n)
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => ReadOutcome::Error(e),
            };
        }
    }

    /// Drains the readable span into `dst` with a single write call,
    /// retrying on EINTR. A full drain resets both cursors, which is the
    /// primary space-reclamation path.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> WriteOutcome {
        if self.is_empty() {
            return WriteOutcome::Bytes(0);
        }
        loop {
            return match dst.write(&self.data[self.head..self.tail]) {
                Ok(0) => WriteOutcome::Error(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.consume(n);
                    WriteOutcome::Bytes(n)
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => WriteOutcome::WouldBlock,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => WriteOutcome::Error(e),
            };
        }
    }
}
