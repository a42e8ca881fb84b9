/// Loop-owned counters. Plain fields, no atomics: every mutation happens
/// on the event-loop thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    /// Connections ever allocated (clients and backends).
    pub total_connections: u64,
    /// Slots currently in use.
    pub active_connections: u64,
    pub bytes_forwarded: u64,
    /// HTTP requests dispatched to a backend.
    pub requests_handled: u64,
    /// Protocol violations and failed dispatches answered with a canned
    /// response (or a drop).
    pub requests_error: u64,
    /// Keep-alive re-entries: client connections that went on to serve
    /// another request.
    pub keep_alive_reused: u64,
    pub dial_failures: u64,
    pub connects_completed: u64,
}
