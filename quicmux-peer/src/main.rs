//! `quicmux-peer` -- echo server and client over a quicmux transport.
//!
//! Every run generates a fresh self-signed identity and logs its
//! fingerprint, which the other side can pin with `--pin`.
//!
//! # Usage
//!
//! ```bash
//! # Echo server
//! cargo run --bin quicmux-peer -- --listen 0.0.0.0:50000
//!
//! # Client
//! cargo run --bin quicmux-peer -- --connect localhost:50000 --message Hello
//!
//! # Client that only accepts a known server certificate
//! cargo run --bin quicmux-peer -- --connect localhost:50000 --pin <sha256-hex>
//! ```

use std::path::Path;

use clap::Parser;
use quicmux::identity::Origin;
use quicmux::{Config, Listener};
use quicmux_peer::PeerError;
use quicmux_peer::config::{Mode, PeerCliArgs, PeerConfig};
use quicmux_peer::echo;
use tracing_appender::non_blocking::WorkerGuard;

#[tokio::main]
async fn main() {
    let cli = PeerCliArgs::parse();

    let config = match PeerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(2);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());

    if let Err(e) = run(config).await {
        tracing::error!(err = %e, "quicmux-peer failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(config: PeerConfig) -> Result<(), PeerError> {
    let origin = Origin::random()?;
    let transport_config = Config::self_signed(&origin)?.with_tuning(config.tuning);
    tracing::info!(
        origin = %origin.to_hex(),
        fingerprint = %transport_config.fingerprint(),
        "generated identity"
    );

    match config.mode {
        Mode::Listen { address } => {
            let listener = Listener::bind(&address, &transport_config).await?;
            tracing::info!(addr = %listener.local_addr()?, "echo server listening");
            echo::serve(listener, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(err = %e, "failed to wait for ctrl-c");
                }
            })
            .await;
        }
        Mode::Connect { address, message } => {
            let echoed = echo::run_client(&address, &transport_config, message.as_bytes()).await?;
            println!("{}", String::from_utf8_lossy(&echoed));
        }
    }
    Ok(())
}

/// Initialize logging to stderr, or to `file_path` when given.
///
/// Returns a [`WorkerGuard`] for file logging that must be held until
/// shutdown so buffered entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some((log_dir, file_name)) = file_path.and_then(|p| {
        let dir = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
        Some((dir, p.file_name()?))
    }) else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}
