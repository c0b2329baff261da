// ── Remote sessions ──────────────────────────────────────────────────────────

use crate::relay::cancel::SocketGuard;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::types::SessionState;
use log::{debug, info, warn};
use ssh2::{File, OpenFlags, OpenType, Session, Sftp};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::Path;

/// File-level capability of one open remote endpoint.
///
/// Handles borrow the session, so the borrow checker guarantees every handle
/// is gone before the session can be closed.
pub trait RemoteFs {
    /// Label for logs and errors, normally `user@host:port`.
    fn describe(&self) -> String;

    fn open_read<'a>(&'a self, path: &str) -> io::Result<Box<dyn Read + 'a>>;

    /// Create or truncate `path` for writing.
    fn open_write<'a>(&'a self, path: &str) -> io::Result<Box<dyn RemoteWrite + 'a>>;
}

/// Write handle whose final close status is reported.
pub trait RemoteWrite: Write {
    /// Close the handle. Dropping without `finish` closes it too, but the
    /// server's answer is lost.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

impl RemoteWrite for File {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.close().map_err(io::Error::from)
    }
}

/// An authenticated SSH connection with the SFTP subsystem running on it.
pub struct SftpSession {
    endpoint: String,
    state: SessionState,
    sftp: Option<Sftp>,
    session: Session,
    #[allow(dead_code)] // held to keep the TCP connection alive
    tcp: TcpStream,
    #[allow(dead_code)] // unregisters the socket from cancellation on drop
    cancel_guard: SocketGuard,
}

impl SftpSession {
    pub(crate) fn new(
        endpoint: String,
        session: Session,
        sftp: Sftp,
        tcp: TcpStream,
        cancel_guard: SocketGuard,
    ) -> Self {
        Self {
            endpoint,
            state: SessionState::Open,
            sftp: Some(sftp),
            session,
            tcp,
            cancel_guard,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn server_banner(&self) -> Option<String> {
        self.session.banner().map(|b| b.to_string())
    }

    fn sftp(&self) -> io::Result<&Sftp> {
        self.sftp
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "SFTP session is closed"))
    }

    /// Shut down SFTP and disconnect SSH. Consumes the session so it can only
    /// happen once.
    pub fn close(mut self) -> RelayResult<()> {
        self.release()
    }

    fn release(&mut self) -> RelayResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        // Dropping the SFTP handle shuts the subsystem channel down.
        drop(self.sftp.take());
        // Only an authenticated transport has anything to say goodbye on.
        let result = if self.session.authenticated() {
            self.session
                .disconnect(None, "Relay finished", None)
                .map_err(|e| {
                    RelayError::connection_failed(format!("SSH disconnect failed: {}", e))
                        .with_endpoint(self.endpoint.clone())
                })
        } else {
            Ok(())
        };
        info!("Session {} closed", self.endpoint);
        result
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            warn!("Session {} dropped without close; releasing", self.endpoint);
            if let Err(e) = self.release() {
                debug!("{}", e);
            }
        }
    }
}

impl RemoteFs for SftpSession {
    fn describe(&self) -> String {
        self.endpoint.clone()
    }

    fn open_read<'a>(&'a self, path: &str) -> io::Result<Box<dyn Read + 'a>> {
        let sftp = self.sftp()?;
        // Some servers happily open a directory for reading and only fail on
        // the first read, so refuse it up front.
        if sftp.stat(Path::new(path))?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("'{}' is a directory", path),
            ));
        }
        let file = sftp.open_mode(Path::new(path), OpenFlags::READ, 0, OpenType::File)?;
        Ok(Box::new(file))
    }

    fn open_write<'a>(&'a self, path: &str) -> io::Result<Box<dyn RemoteWrite + 'a>> {
        let file = self.sftp()?.open_mode(
            Path::new(path),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
            OpenType::File,
        )?;
        Ok(Box::new(file))
    }
}
