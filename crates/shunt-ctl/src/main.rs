use std::{
    net::{Ipv4Addr, SocketAddrV4},
    process::ExitCode,
    sync::atomic::Ordering,
};

use clap::Parser;
use shunt::{Mode, Proxy, ProxyConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Single-threaded TCP/HTTP reverse proxy.
#[derive(Parser, Debug)]
#[command(name = "shunt", version, about)]
struct Args {
    /// Listen address (IPv4)
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen: Ipv4Addr,

    /// Listen port
    #[arg(short = 'p', long, default_value_t = 8080, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Upstream address (IPv4)
    #[arg(short = 'b', long, default_value = "127.0.0.1")]
    backend: Ipv4Addr,

    /// Upstream port
    #[arg(short = 'P', long, default_value_t = 8081, value_parser = clap::value_parser!(u16).range(1..))]
    backend_port: u16,

    /// Forwarding mode
    #[arg(short = 'm', long, default_value = "http", value_parser = ["tcp", "http"])]
    mode: String,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mode = if args.mode == "tcp" { Mode::Tcp } else { Mode::Http };
    let cfg = ProxyConfig::new(
        SocketAddrV4::new(args.listen, args.port),
        SocketAddrV4::new(args.backend, args.backend_port),
        mode,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cfg.listen,
        backend = %cfg.backend,
        mode = %args.mode,
        "shunt starting"
    );

    let mut proxy = match Proxy::new(cfg) {
        Ok(proxy) => proxy,
        Err(err) => {
            error!(%err, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let flag = proxy.shutdown_handle();
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        error!(%err, "failed to install signal handler");
        return ExitCode::FAILURE;
    }

    if let Err(err) = proxy.run() {
        error!(%err, "proxy loop failed");
        return ExitCode::FAILURE;
    }

    let stats = proxy.stats();
    info!(
        total_connections = stats.total_connections,
        bytes_forwarded = stats.bytes_forwarded,
        requests_handled = stats.requests_handled,
        requests_error = stats.requests_error,
        keep_alive_reused = stats.keep_alive_reused,
        dial_failures = stats.dial_failures,
        "shunt stopped"
    );
    ExitCode::SUCCESS
}
