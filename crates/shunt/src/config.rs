use std::{net::SocketAddrV4, time::Duration};

use thiserror::Error;

/// Hard cap on concurrent connection slots (clients + backends).
pub const MAX_CONNECTIONS: usize = 10_000;
/// Events drained per readiness wait.
pub const MAX_EVENTS_PER_WAIT: usize = 256;
/// Per-direction buffer capacity for every connection.
pub const BUFFER_SIZE: usize = 16_384;
pub const LISTEN_BACKLOG: libc::c_int = 511;
/// Backends stuck in the handshake longer than this are failed.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
/// Requests served over one kept-alive client connection before it is
/// retired.
pub const MAX_REQUESTS_PER_CONN: u32 = 1000;
/// Upper bound on buffered request bytes while the head is incomplete.
pub const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

/// Forwarding discipline for accepted clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Byte-transparent: one backend dialed per accepted client.
    Tcp,
    /// HTTP/1.x-aware: the request head is parsed and validated before a
    /// backend is dialed, once per request.
    Http,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("listen and backend endpoints are identical: {0}")]
    SameEndpoint(SocketAddrV4),
    #[error("backend port must not be zero")]
    ZeroBackendPort,
}

/// Everything the core needs to run. Built by the caller (the CLI, a
/// test harness); the selected mode is authoritative.
#[derive(Clone, Copy, Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddrV4,
    pub backend: SocketAddrV4,
    pub mode: Mode,
    pub max_connections: usize,
    pub buffer_size: usize,
}

impl ProxyConfig {
    pub fn new(listen: SocketAddrV4, backend: SocketAddrV4, mode: Mode) -> Self {
        Self { listen, backend, mode, max_connections: MAX_CONNECTIONS, buffer_size: BUFFER_SIZE }
    }

    /// A zero listen port is allowed (ephemeral bind); a zero backend port
    /// can never be dialed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.port() == 0 {
            return Err(ConfigError::ZeroBackendPort);
        }
        if self.listen == self.backend {
            return Err(ConfigError::SameEndpoint(self.listen));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn rejects_identical_endpoints() {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080);
        let cfg = ProxyConfig::new(addr, addr, Mode::Tcp);
        assert_eq!(cfg.validate(), Err(ConfigError::SameEndpoint(addr)));
    }

    #[test]
    fn rejects_zero_backend_port() {
        let cfg = ProxyConfig::new(
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            Mode::Http,
        );
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroBackendPort));
    }

    #[test]
    fn accepts_distinct_endpoints() {
        let cfg = ProxyConfig::new(
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8081),
            Mode::Http,
        );
        assert!(cfg.validate().is_ok());
    }
}
