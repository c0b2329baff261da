use crate::config::{load_config, RelayConfig};
use anyhow::Result;
use clap::{ArgAction, Parser};
use sorng_relay::relay::{CancelToken, RelayError, RelayErrorKind, RelayOptions};
use std::path::PathBuf;
use std::time::Duration;

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "sftp-relay",
    about = "Copy a file from one SFTP server to another without touching local disk"
)]
pub struct CliArgs {
    /// Relay config file (.json, .yaml or .yml)
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,
    /// Overall time limit for the relay; overrides `timeoutSecs`
    #[arg(long, value_name = "SECS")]
    pub timeout_secs: Option<u64>,
    /// Copy buffer size in bytes; overrides `chunkSize`
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,
    /// Log filter (e.g. `debug` or `info,sorng_relay=trace`); defaults to RUST_LOG or info
    #[arg(long, value_name = "FILTER")]
    pub log_level: Option<String>,
    /// Emit log lines as JSON
    #[arg(long, action = ArgAction::SetTrue)]
    pub json_logs: bool,
}

impl CliArgs {
    /// Load the config file and fold the command-line overrides into it.
    pub fn resolve(&self) -> Result<RelayConfig> {
        let mut config = load_config(&self.config)?;
        if let Some(secs) = self.timeout_secs {
            config.timeout_secs = Some(secs);
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size;
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn relay_options(config: &RelayConfig, cancel: CancelToken) -> RelayOptions {
    RelayOptions {
        chunk_size: config.chunk_size,
        connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        timeout: config.timeout_secs.map(Duration::from_secs),
        cancel,
        progress: None,
    }
}

pub fn exit_code(err: &RelayError) -> u8 {
    match err.kind() {
        RelayErrorKind::Cancelled => EXIT_CANCELLED,
        RelayErrorKind::InvalidConfig => EXIT_CONFIG,
        _ => EXIT_FAILURE,
    }
}
