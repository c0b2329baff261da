// ── Cancellation & deadlines ─────────────────────────────────────────────────

use crate::relay::error::{RelayError, RelayResult};
use log::debug;
use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct TokenInner {
    flag: AtomicBool,
    next_id: AtomicU64,
    sockets: Mutex<HashMap<u64, TcpStream>>,
}

/// Shared cancel flag. Cloning shares the flag.
///
/// Sockets registered with the token are shut down on [`CancelToken::cancel`],
/// which unblocks any libssh2 call waiting on them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        for (_, tcp) in self.sockets().iter() {
            shutdown(tcp);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    fn sockets(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.inner
            .sockets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, tcp: &TcpStream) -> std::io::Result<u64> {
        let clone = tcp.try_clone()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.sockets().insert(id, clone);
        // A cancel that raced the insert would have missed this socket.
        if self.is_cancelled() {
            shutdown(tcp);
        }
        Ok(id)
    }

    fn unregister(&self, id: u64) {
        self.sockets().remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.sockets().len()
    }
}

fn shutdown(tcp: &TcpStream) {
    if let Err(e) = tcp.shutdown(Shutdown::Both) {
        debug!("Socket shutdown on cancel: {}", e);
    }
}

/// Keeps a socket registered with one or more tokens until dropped.
#[derive(Debug, Default)]
pub struct SocketGuard {
    entries: Vec<(CancelToken, u64)>,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        for (token, id) in self.entries.drain(..) {
            token.unregister(id);
        }
    }
}

/// Cancel token, optional sibling-abort token and optional absolute deadline.
#[derive(Debug, Clone)]
pub struct Interrupt {
    cancel: CancelToken,
    abort: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl Interrupt {
    pub fn new(cancel: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            abort: None,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn none() -> Self {
        Self::new(CancelToken::new(), None)
    }

    /// Also stop when `abort` fires. Used to stop one establishment once its
    /// sibling has failed.
    pub fn with_abort(mut self, abort: CancelToken) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamp `limit` to the time left before the deadline.
    pub fn bounded(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(left) => limit.min(left),
            None => limit,
        }
    }

    /// Shut `tcp` down when the cancel or abort token fires.
    pub fn register(&self, tcp: &TcpStream) -> std::io::Result<SocketGuard> {
        let mut guard = SocketGuard::default();
        for token in std::iter::once(&self.cancel).chain(self.abort.as_ref()) {
            let id = token.register(tcp)?;
            guard.entries.push((token.clone(), id));
        }
        Ok(guard)
    }

    /// Why work should stop, if it should.
    pub fn reason(&self, stage: &str) -> Option<String> {
        if self.cancel.is_cancelled() {
            return Some(format!("cancelled during {}", stage));
        }
        if self.abort.as_ref().map_or(false, |a| a.is_cancelled()) {
            return Some(format!("aborted during {}: the other session failed", stage));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(format!("deadline exceeded during {}", stage))
            }
            _ => None,
        }
    }

    pub fn check(&self, stage: &str) -> RelayResult<()> {
        match self.reason(stage) {
            Some(reason) => Err(RelayError::cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Re-tag a transport failure as `Cancelled` when it was caused by a
    /// cancel, an abort or the deadline.
    pub fn classify(&self, err: RelayError, stage: &str) -> RelayError {
        if err.is_cancelled() {
            return err;
        }
        match self.reason(stage) {
            Some(reason) => err.into_cancelled(reason),
            None => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_token_clones_share_state() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_check_reports_cancel() {
        let token = CancelToken::new();
        let interrupt = Interrupt::new(token.clone(), None);
        assert!(interrupt.check("handshake").is_ok());
        token.cancel();
        let err = interrupt.check("handshake").unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.message.contains("handshake"));
    }

    #[test]
    fn test_abort_token() {
        let abort = CancelToken::new();
        let interrupt = Interrupt::none().with_abort(abort.clone());
        assert!(interrupt.check("connect").is_ok());
        abort.cancel();
        let err = interrupt.check("connect").unwrap_err();
        assert!(err.is_cancelled());
        assert!(err.message.contains("aborted"));
    }

    #[test]
    fn test_expired_deadline() {
        let interrupt = Interrupt::new(CancelToken::new(), Some(Duration::ZERO));
        let err = interrupt.check("copy").unwrap_err();
        assert!(err.message.contains("deadline"));
        assert_eq!(interrupt.bounded(Duration::from_secs(30)), Duration::ZERO);
    }

    #[test]
    fn test_bounded_without_deadline() {
        let interrupt = Interrupt::none();
        assert!(interrupt.remaining().is_none());
        assert_eq!(
            interrupt.bounded(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_classify() {
        let token = CancelToken::new();
        let interrupt = Interrupt::new(token.clone(), None);
        let err = interrupt.classify(RelayError::connection_failed("Timed out"), "handshake");
        assert_eq!(err.kind, crate::relay::error::RelayErrorKind::ConnectionFailed);

        token.cancel();
        let err = interrupt.classify(
            RelayError::copy_failed(42, "Read error: socket closed"),
            "copy",
        );
        assert!(err.is_cancelled());
        assert_eq!(err.bytes_transferred, Some(42));
        assert!(err.message.contains("socket closed"));
    }

    #[test]
    fn test_cancel_shuts_down_registered_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let token = CancelToken::new();
        let interrupt = Interrupt::new(token.clone(), None);
        let guard = interrupt.register(&client).unwrap();
        assert_eq!(token.registered(), 1);

        token.cancel();
        // A shut-down socket reads EOF instead of blocking.
        let mut buf = [0u8; 8];
        assert_eq!((&client).read(&mut buf).unwrap_or(0), 0);

        drop(guard);
        assert_eq!(token.registered(), 0);
    }

    #[test]
    fn test_register_after_cancel_shuts_down_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let abort = CancelToken::new();
        abort.cancel();
        let interrupt = Interrupt::none().with_abort(abort.clone());
        let _guard = interrupt.register(&client).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!((&client).read(&mut buf).unwrap_or(0), 0);
    }
}
