use std::{io, net::SocketAddrV4};

use thiserror::Error;

use crate::config::ConfigError;

/// Fatal startup and loop failures. Per-connection errors never surface
/// here; they are confined to the owning connection (or its pair).
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("readiness poller setup failed: {0}")]
    Poller(#[source] io::Error),
    #[error("failed to bind listener on {addr}: {err}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        err: io::Error,
    },
    #[error("failed to register listener: {0}")]
    RegisterListener(#[source] io::Error),
    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}
