use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use mio::Events;
use tracing::info;

use crate::{
    config::{MAX_EVENTS_PER_WAIT, ProxyConfig},
    engine::Engine,
    error::ProxyError,
    sock,
    stats::Stats,
    timing::Repeater,
};

/// Readiness-wait timeout; bounds how stale the periodic maintenance and
/// the shutdown-flag check can get.
const WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// The proxy core: owns the engine and the event loop. Everything runs on
/// the thread that calls [`run`]; the shutdown flag is the only datum
/// shared with the outside (typically a signal handler).
///
/// [`run`]: Proxy::run
pub struct Proxy {
    engine: Engine,
    events: Events,
    shutdown: Arc<AtomicBool>,
    maintenance: Repeater,
}

impl Proxy {
    /// Validates the config, binds the listener and registers it with the
    /// readiness poller. Any failure here is fatal; `run` is never entered.
    pub fn new(cfg: ProxyConfig) -> Result<Self, ProxyError> {
        cfg.validate()?;
        sock::ignore_sigpipe();
        let engine = Engine::new(&cfg)?;
        info!(listen = %cfg.listen, backend = %cfg.backend, mode = ?cfg.mode, "proxy initialized");
        Ok(Self {
            engine,
            events: Events::with_capacity(MAX_EVENTS_PER_WAIT),
            shutdown: Arc::new(AtomicBool::new(false)),
            maintenance: Repeater::every(Duration::from_secs(1)),
        })
    }

    /// Actual listening address, useful when the config asked for an
    /// ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.engine.local_addr()
    }

    /// Flag observed at the top of every loop iteration; store `true` from
    /// a signal handler (or any thread) to request a graceful exit.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stats(&self) -> Stats {
        self.engine.stats()
    }

    /// Blocks in the event loop until the shutdown flag is raised, then
    /// tears every connection down. Only a failing readiness wait can end
    /// the loop early.
    pub fn run(&mut self) -> Result<(), ProxyError> {
        info!("proxy running");
        while !self.shutdown.load(Ordering::Relaxed) {
            self.engine.wait(&mut self.events, WAIT_TIMEOUT).map_err(ProxyError::Wait)?;
            for ev in self.events.iter() {
                self.engine.dispatch(ev);
            }
            if self.maintenance.fired() {
                self.engine.sweep_idle();
                self.engine.log_stats();
            }
        }
        info!("shutdown requested");
        self.shutdown();
        Ok(())
    }

    /// Closes every live connection and the listener registration.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        self.engine.shutdown_all();
    }
}
