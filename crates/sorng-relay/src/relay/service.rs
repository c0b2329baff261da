// ── Session establishment ────────────────────────────────────────────────────

use crate::relay::cancel::Interrupt;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::host_keys::HostKeyPolicy;
use crate::relay::keys::{self, KeyMaterial};
use crate::relay::session::SftpSession;
use crate::relay::types::{AuthMethod, ConnectionDescriptor, SessionState};
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};
use ssh2::{Session, Sftp};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Credential resolved before any network activity.
enum Credential<'d> {
    Key(KeyMaterial),
    Password(&'d SecretString),
}

/// Turns connection descriptors into open [`SftpSession`]s.
///
/// Blocking; run it on a blocking-capable thread. No retries: the first
/// failing step ends the attempt and nothing partially built is returned.
pub struct Establisher {
    connect_timeout: Duration,
    interrupt: Interrupt,
}

impl Establisher {
    pub fn new(connect_timeout: Duration, interrupt: Interrupt) -> Self {
        Self {
            connect_timeout,
            interrupt,
        }
    }

    pub fn establish(
        &self,
        descriptor: &ConnectionDescriptor,
        host_key: &HostKeyPolicy,
    ) -> RelayResult<SftpSession> {
        let endpoint = descriptor.endpoint();
        self.establish_inner(descriptor, host_key)
            .map_err(|e| self.interrupt.classify(e, "session setup"))
            .map_err(|e| {
                debug!(
                    "Session {} {} -> {}",
                    endpoint,
                    SessionState::Authenticating,
                    SessionState::Closed
                );
                e.with_endpoint(endpoint.clone())
            })
    }

    fn establish_inner(
        &self,
        descriptor: &ConnectionDescriptor,
        host_key: &HostKeyPolicy,
    ) -> RelayResult<SftpSession> {
        let endpoint = descriptor.endpoint();
        validate(descriptor)?;
        debug!(
            "Session {} {} -> {}",
            endpoint,
            SessionState::Unestablished,
            SessionState::Authenticating
        );

        let credential = match &descriptor.auth {
            AuthMethod::PublicKey { key, passphrase } => {
                let material = keys::load_key(key, passphrase.as_ref())?;
                debug!(
                    "Loaded {} key ({:?}) for {}",
                    material.algorithm, material.format, endpoint
                );
                Credential::Key(material)
            }
            AuthMethod::Password(password) => Credential::Password(password),
        };

        self.interrupt.check("connect")?;
        let tcp = self.connect_tcp(descriptor)?;
        let cancel_guard = self.interrupt.register(&tcp).map_err(|e| {
            RelayError::connection_failed(format!("Failed to watch socket for cancellation: {}", e))
        })?;

        let mut session = Session::new()
            .map_err(|e| RelayError::connection_failed(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(
            tcp.try_clone()
                .map_err(|e| RelayError::connection_failed(format!("Failed to clone TCP stream: {}", e)))?,
        );
        session.set_timeout(millis(self.interrupt.bounded(self.connect_timeout)));
        session
            .handshake()
            .map_err(|e| RelayError::connection_failed(format!("SSH handshake failed: {}", e)))?;

        let sftp = match self.secure(&session, descriptor, host_key, &credential) {
            Ok(sftp) => sftp,
            Err(e) => {
                // Authenticating -> Closed: tear the half-built session down.
                if let Err(de) = session.disconnect(None, "Relay setup failed", None) {
                    debug!("Disconnect after failed setup of {}: {}", endpoint, de);
                }
                return Err(e);
            }
        };

        // Copy-phase operations are bounded only by the overall deadline.
        session.set_timeout(self.interrupt.remaining().map(millis).unwrap_or(0));

        info!(
            "SFTP session open to {} via {}",
            endpoint,
            descriptor.auth.name()
        );
        debug!(
            "Session {} {} -> {}",
            endpoint,
            SessionState::Authenticating,
            SessionState::Open
        );
        Ok(SftpSession::new(endpoint, session, sftp, tcp, cancel_guard))
    }

    /// Host check, authentication, SFTP start-up on a handshaken session.
    fn secure(
        &self,
        session: &Session,
        descriptor: &ConnectionDescriptor,
        host_key: &HostKeyPolicy,
        credential: &Credential<'_>,
    ) -> RelayResult<Sftp> {
        let presented = host_key.verify(session, &descriptor.host, descriptor.port)?;
        debug!(
            "{} presented {} {}",
            descriptor.host, presented.algorithm, presented.fingerprint
        );

        self.interrupt.check("authentication")?;
        authenticate(session, descriptor, credential)?;

        self.interrupt.check("SFTP start-up")?;
        session.sftp().map_err(|e| {
            RelayError::session_init_failed(format!(
                "Unable to secure a remote SFTP client connection: {}",
                e
            ))
        })
    }

    fn connect_tcp(&self, descriptor: &ConnectionDescriptor) -> RelayResult<TcpStream> {
        let addr = format!("{}:{}", descriptor.host, descriptor.port);
        info!("SFTP connecting to {}", addr);

        let candidates: Vec<SocketAddr> = (descriptor.host.as_str(), descriptor.port)
            .to_socket_addrs()
            .map_err(|e| RelayError::connection_failed(format!("Unable to resolve '{}': {}", addr, e)))?
            .collect();
        if candidates.is_empty() {
            return Err(RelayError::connection_failed(format!(
                "'{}' resolved to no addresses",
                addr
            )));
        }

        let mut last_error = None;
        for candidate in candidates {
            self.interrupt.check("connect")?;
            // A zero timeout is rejected by connect_timeout.
            let timeout = self
                .interrupt
                .bounded(self.connect_timeout)
                .max(Duration::from_millis(1));
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(tcp) => {
                    tcp.set_nonblocking(false).map_err(|e| {
                        RelayError::connection_failed(format!("Failed to set blocking mode: {}", e))
                    })?;
                    if let Err(e) = tcp.set_nodelay(true) {
                        debug!("TCP_NODELAY on {}: {}", candidate, e);
                    }
                    return Ok(tcp);
                }
                Err(e) => {
                    warn!("TCP connection to {} failed: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }

        Err(RelayError::connection_failed(format!(
            "Unable to open the remote connection to {}: {}",
            addr,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn validate(descriptor: &ConnectionDescriptor) -> RelayResult<()> {
    if descriptor.host.trim().is_empty() {
        return Err(RelayError::invalid_config("Host must not be empty"));
    }
    if descriptor.username.trim().is_empty() {
        return Err(RelayError::invalid_config("Username must not be empty"));
    }
    if descriptor.port == 0 {
        return Err(RelayError::invalid_config("Port must not be 0"));
    }
    Ok(())
}

fn authenticate(
    session: &Session,
    descriptor: &ConnectionDescriptor,
    credential: &Credential<'_>,
) -> RelayResult<()> {
    let user = descriptor.username.as_str();
    match credential {
        Credential::Key(key) => {
            // ssh2 only authenticates from a key file on every platform.
            let key_file = key.to_temp_file().map_err(|e| {
                RelayError::key_unavailable(format!("Unable to stage private key: {}", e))
            })?;
            session
                .userauth_pubkey_file(user, None, key_file.path(), key.passphrase())
                .map_err(|e| {
                    RelayError::connection_failed(format!(
                        "Public-key authentication failed for '{}': {}",
                        user, e
                    ))
                })?;
        }
        Credential::Password(password) => {
            session
                .userauth_password(user, password.expose_secret())
                .map_err(|e| {
                    RelayError::connection_failed(format!(
                        "Password authentication failed for '{}': {}",
                        user, e
                    ))
                })?;
        }
    }

    if !session.authenticated() {
        return Err(RelayError::connection_failed(
            "Authentication failed – not authenticated after auth attempt",
        ));
    }
    Ok(())
}

/// libssh2 timeout in ms. Never 0, which libssh2 reads as "wait forever".
fn millis(d: Duration) -> u32 {
    d.as_millis().clamp(1, u32::MAX as u128) as u32
}
