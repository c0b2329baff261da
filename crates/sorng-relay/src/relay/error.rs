//! Relay error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised relay failure.
///
/// `endpoint` is `user@host:port` of the side that failed, `path` the remote
/// path involved (if any). `bytes_transferred` is set when a copy stopped
/// part-way so the caller can decide what to do with the partial target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayError {
    pub kind: RelayErrorKind,
    pub message: String,
    pub endpoint: Option<String>,
    pub path: Option<String>,
    pub bytes_transferred: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorKind {
    /// Key material could not be read.
    KeyUnavailable,
    /// Key material is not a usable private key.
    KeyInvalid,
    /// DNS, TCP, SSH handshake or authentication failure.
    ConnectionFailed,
    /// The host-key policy refused the server's identity.
    HostKeyRejected,
    /// SFTP subsystem could not be started on an authenticated session.
    SessionInitFailed,
    SourceOpenFailed,
    TargetOpenFailed,
    /// Transport failed part-way through the copy.
    CopyFailed,
    /// Cancel token fired or the deadline passed.
    Cancelled,
    InvalidConfig,
}

pub type RelayResult<T> = Result<T, RelayError>;

// ── Construction helpers ─────────────────────────────────────────────

impl RelayError {
    pub fn new(kind: RelayErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            endpoint: None,
            path: None,
            bytes_transferred: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes_transferred = Some(bytes);
        self
    }

    pub fn kind(&self) -> RelayErrorKind {
        self.kind
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn key_unavailable(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::KeyUnavailable, msg)
    }

    pub fn key_invalid(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::KeyInvalid, msg)
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::ConnectionFailed, msg)
    }

    pub fn host_key_rejected(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::HostKeyRejected, msg)
    }

    pub fn session_init_failed(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::SessionInitFailed, msg)
    }

    pub fn source_open_failed(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::SourceOpenFailed, msg)
    }

    pub fn target_open_failed(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::TargetOpenFailed, msg)
    }

    pub fn copy_failed(bytes: u64, msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::CopyFailed, msg).with_bytes(bytes)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::Cancelled, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(RelayErrorKind::InvalidConfig, msg)
    }

    /// Keep endpoint, path and byte count, but report the failure as a cancel.
    pub fn into_cancelled(mut self, reason: impl Into<String>) -> Self {
        self.message = format!("{}: {}", reason.into(), self.message);
        self.kind = RelayErrorKind::Cancelled;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == RelayErrorKind::Cancelled
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[relay {:?}]", self.kind)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " {}", endpoint)?;
        }
        if let Some(path) = &self.path {
            write!(f, " {}", path)?;
        }
        write!(f, ": {}", self.message)?;
        if let Some(bytes) = self.bytes_transferred {
            write!(f, " ({} bytes transferred)", bytes)?;
        }
        Ok(())
    }
}

impl std::error::Error for RelayError {}

impl From<RelayError> for String {
    fn from(e: RelayError) -> String {
        e.to_string()
    }
}
