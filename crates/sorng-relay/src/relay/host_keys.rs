// ── Host identity verification ───────────────────────────────────────────────

use crate::relay::error::{RelayError, RelayResult};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, Session};
use std::path::{Path, PathBuf};

/// How a server's identity is accepted. Chosen explicitly for every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "policy", rename_all = "camelCase")]
pub enum HostKeyPolicy {
    /// Refuse every server.
    RejectAll,
    /// Trust whatever key the server presents.
    AcceptAny,
    /// Accept only keys whose `SHA256:` fingerprint is listed.
    Pinned { fingerprints: Vec<String> },
    /// Check against an OpenSSH `known_hosts` file.
    KnownHosts { path: PathBuf },
}

/// The key a server presented during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentedHostKey {
    pub algorithm: &'static str,
    pub fingerprint: String,
    pub blob: Vec<u8>,
}

impl PresentedHostKey {
    pub fn new(algorithm: &'static str, blob: &[u8]) -> Self {
        Self {
            algorithm,
            fingerprint: fingerprint_sha256(blob),
            blob: blob.to_vec(),
        }
    }
}

/// OpenSSH-style fingerprint: `SHA256:` + unpadded base64 of the key blob hash.
pub fn fingerprint_sha256(blob: &[u8]) -> String {
    let digest = Sha256::digest(blob);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

fn normalize_fingerprint(raw: &str) -> String {
    let raw = raw.trim();
    let body = raw.strip_prefix("SHA256:").unwrap_or(raw);
    format!("SHA256:{}", body.trim_end_matches('='))
}

fn algorithm_name(kind: HostKeyType) -> &'static str {
    match kind {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        HostKeyType::Ed25519 => "ssh-ed25519",
        _ => "unknown",
    }
}

impl HostKeyPolicy {
    /// Decide on an already-extracted key. Known-hosts lookups need the live
    /// session and go through [`HostKeyPolicy::verify`].
    pub fn decide(&self, presented: &PresentedHostKey) -> Result<(), String> {
        match self {
            HostKeyPolicy::RejectAll => Err("host key policy rejects all servers".into()),
            HostKeyPolicy::AcceptAny => Ok(()),
            HostKeyPolicy::Pinned { fingerprints } => {
                let matched = fingerprints
                    .iter()
                    .any(|f| normalize_fingerprint(f) == presented.fingerprint);
                if matched {
                    Ok(())
                } else {
                    Err(format!(
                        "{} key {} is not pinned",
                        presented.algorithm, presented.fingerprint
                    ))
                }
            }
            HostKeyPolicy::KnownHosts { path } => Err(format!(
                "known_hosts '{}' requires a live session",
                path.display()
            )),
        }
    }

    /// Check the identity of the server on a handshaken session.
    pub fn verify(
        &self,
        session: &Session,
        host: &str,
        port: u16,
    ) -> RelayResult<PresentedHostKey> {
        let (blob, kind) = session
            .host_key()
            .ok_or_else(|| RelayError::host_key_rejected("Server presented no host key"))?;
        let presented = PresentedHostKey::new(algorithm_name(kind), blob);

        let decision = match self {
            HostKeyPolicy::KnownHosts { path } => check_known_hosts(session, path, host, port, &presented),
            _ => self.decide(&presented),
        };

        match decision {
            Ok(()) => {
                if matches!(self, HostKeyPolicy::AcceptAny) {
                    warn!(
                        "Accepting unverified {} host key {} for {}:{}",
                        presented.algorithm, presented.fingerprint, host, port
                    );
                } else {
                    info!(
                        "Host key {} for {}:{} verified",
                        presented.fingerprint, host, port
                    );
                }
                Ok(presented)
            }
            Err(reason) => Err(RelayError::host_key_rejected(reason)),
        }
    }
}

fn check_known_hosts(
    session: &Session,
    path: &Path,
    host: &str,
    port: u16,
    presented: &PresentedHostKey,
) -> Result<(), String> {
    let mut known = session
        .known_hosts()
        .map_err(|e| format!("known_hosts init failed: {}", e))?;
    known
        .read_file(path, KnownHostFileKind::OpenSSH)
        .map_err(|e| format!("Unable to read known_hosts '{}': {}", path.display(), e))?;

    match known.check_port(host, port, &presented.blob) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(format!(
            "HOST KEY MISMATCH for {}:{} ({} {} differs from known_hosts)",
            host, port, presented.algorithm, presented.fingerprint
        )),
        CheckResult::NotFound => Err(format!(
            "{}:{} not found in '{}' (presented {})",
            host,
            port,
            path.display(),
            presented.fingerprint
        )),
        CheckResult::Failure => Err(format!(
            "known_hosts lookup failed for {}:{}",
            host, port
        )),
    }
}
