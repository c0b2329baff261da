// ── Types ─────────────────────────────────────────────────────────────────────

use crate::relay::cancel::CancelToken;
use crate::relay::host_keys::HostKeyPolicy;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ── Defaults ─────────────────────────────────────────────────────────────────

pub const DEFAULT_SSH_PORT: u16 = 22;

pub fn default_chunk_size() -> usize {
    1_048_576 // 1 MiB
}
pub fn default_connect_timeout_secs() -> u64 {
    30
}

// ── Connection & Authentication ──────────────────────────────────────────────

/// Where the private key for an endpoint comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Read from a file on the machine running the relay.
    File(PathBuf),
    /// Key text supplied directly (OpenSSH or PEM encoding).
    Inline(SecretString),
}

#[derive(Debug, Clone)]
pub enum AuthMethod {
    PublicKey {
        key: KeySource,
        passphrase: Option<SecretString>,
    },
    Password(SecretString),
}

impl AuthMethod {
    pub fn public_key(key: KeySource) -> Self {
        AuthMethod::PublicKey {
            key,
            passphrase: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::Password(_) => "password",
        }
    }
}

/// Everything needed to open one session. Not mutated once built.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

impl ConnectionDescriptor {
    pub fn with_key_file(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: AuthMethod::public_key(KeySource::File(key_path.into())),
        }
    }

    /// `user@host:port`, used to tag errors and log lines.
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// A descriptor paired with the host-identity decision for that endpoint.
#[derive(Debug, Clone)]
pub struct RelayEndpoint {
    pub descriptor: ConnectionDescriptor,
    pub host_key: HostKeyPolicy,
}

impl RelayEndpoint {
    pub fn new(descriptor: ConnectionDescriptor, host_key: HostKeyPolicy) -> Self {
        Self {
            descriptor,
            host_key,
        }
    }
}

// ── Session lifecycle ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Unestablished,
    Authenticating,
    Open,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unestablished => "unestablished",
            SessionState::Authenticating => "authenticating",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ── Transfer ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub elapsed_ms: u64,
    pub speed_bytes_per_sec: f64,
}

pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Knobs for one relay invocation.
#[derive(Clone)]
pub struct RelayOptions {
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /// Overall budget for establishing both sessions and copying.
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
    pub progress: Option<ProgressCallback>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            connect_timeout: Duration::from_secs(default_connect_timeout_secs()),
            timeout: None,
            cancel: CancelToken::new(),
            progress: None,
        }
    }
}

impl fmt::Debug for RelayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayOptions")
            .field("chunk_size", &self.chunk_size)
            .field("connect_timeout", &self.connect_timeout)
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelaySummary {
    pub relay_id: String,
    pub source: String,
    pub target: String,
    pub bytes_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub average_speed_bps: f64,
}
