//! Configuration for the `quicmux-peer` binary.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/quicmux/config.toml`)
//! 4. Compiled defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use quicmux::TransportTuning;

/// Errors that can occur when loading peer configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// Neither a listen nor a connect address was configured.
    #[error("either --listen or --connect must be given")]
    NoMode,

    /// Both a listen and a connect address were configured.
    #[error("--listen and --connect are mutually exclusive")]
    ConflictingModes,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PeerConfigFile {
    peer: PeerFileConfig,
    transport: TransportFileConfig,
}

/// `[peer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct PeerFileConfig {
    listen: Option<String>,
    connect: Option<String>,
    message: Option<String>,
}

/// `[transport]` section of the config file. Durations are milliseconds.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransportFileConfig {
    handshake_timeout_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
    /// `0` disables keep-alive.
    keep_alive_ms: Option<u64>,
    idle_timeout_ms: Option<u64>,
    max_concurrent_bidi_streams: Option<u32>,
    inbound_queue_capacity: Option<usize>,
    server_name: Option<String>,
    pinned_peer_fingerprint: Option<String>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the peer.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "quicmux echo peer")]
pub struct PeerCliArgs {
    /// Run an echo server on this address (e.g. `0.0.0.0:50000`).
    #[arg(short, long, env = "QUICMUX_LISTEN")]
    pub listen: Option<String>,

    /// Dial this address and send `--message` on a new stream.
    #[arg(short = 'C', long, env = "QUICMUX_CONNECT")]
    pub connect: Option<String>,

    /// Message sent by the client.
    #[arg(short, long)]
    pub message: Option<String>,

    /// Require the peer's certificate to have this SHA-256 fingerprint.
    #[arg(long, env = "QUICMUX_PIN")]
    pub pin: Option<String>,

    /// Path to config file (default: `~/.config/quicmux/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "QUICMUX_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// What the peer does once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Echo every inbound stream back to its sender.
    Listen {
        /// Address to bind.
        address: String,
    },
    /// Send one message and print the echo.
    Connect {
        /// Address to dial.
        address: String,
        /// Payload to send.
        message: String,
    },
}

/// Fully resolved peer configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Server or client mode.
    pub mode: Mode,
    /// Transport tuning passed to the library.
    pub tuning: TransportTuning,
    /// Log level filter string.
    pub log_level: String,
    /// Optional log file.
    pub log_file: Option<PathBuf>,
}

/// Message sent when none is configured.
pub const DEFAULT_MESSAGE: &str = "Hello";

impl PeerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and a missing
    /// file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed, or if the mode is missing or ambiguous.
    pub fn load(cli: &PeerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `PeerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. A mode given on the command line
    /// replaces the file's mode entirely.
    fn resolve(cli: &PeerCliArgs, file: &PeerConfigFile) -> Result<Self, ConfigError> {
        let (listen, connect) = if cli.listen.is_some() || cli.connect.is_some() {
            (cli.listen.clone(), cli.connect.clone())
        } else {
            (file.peer.listen.clone(), file.peer.connect.clone())
        };

        let mode = match (listen, connect) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingModes),
            (None, None) => return Err(ConfigError::NoMode),
            (Some(address), None) => Mode::Listen { address },
            (None, Some(address)) => Mode::Connect {
                address,
                message: cli
                    .message
                    .clone()
                    .or_else(|| file.peer.message.clone())
                    .unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            },
        };

        Ok(Self {
            mode,
            tuning: resolve_tuning(cli, &file.transport),
            log_level: cli.log_level.clone(),
            log_file: cli.log_file.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn resolve_tuning(cli: &PeerCliArgs, file: &TransportFileConfig) -> TransportTuning {
    let defaults = TransportTuning::default();
    let millis = Duration::from_millis;

    TransportTuning {
        handshake_timeout: file
            .handshake_timeout_ms
            .map_or(defaults.handshake_timeout, millis),
        shutdown_timeout: file
            .shutdown_timeout_ms
            .map_or(defaults.shutdown_timeout, millis),
        keep_alive_interval: match file.keep_alive_ms {
            Some(0) => None,
            Some(ms) => Some(millis(ms)),
            None => defaults.keep_alive_interval,
        },
        idle_timeout: file.idle_timeout_ms.map_or(defaults.idle_timeout, millis),
        max_concurrent_bidi_streams: file
            .max_concurrent_bidi_streams
            .unwrap_or(defaults.max_concurrent_bidi_streams),
        inbound_queue_capacity: file
            .inbound_queue_capacity
            .unwrap_or(defaults.inbound_queue_capacity),
        server_name: file.server_name.clone().or(defaults.server_name),
        pinned_peer_fingerprint: cli
            .pin
            .clone()
            .or_else(|| file.pinned_peer_fingerprint.clone()),
    }
}

/// Load and parse the TOML config file.
fn load_config_file(explicit_path: Option<&Path>) -> Result<PeerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(PeerConfigFile::default());
        };
        config_dir.join("quicmux").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PeerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
