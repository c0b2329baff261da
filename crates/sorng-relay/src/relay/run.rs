// ── Relay orchestration ──────────────────────────────────────────────────────

use crate::relay::cancel::{CancelToken, Interrupt};
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::service::Establisher;
use crate::relay::session::SftpSession;
use crate::relay::transfer::{relay_stream, CopyOptions};
use crate::relay::types::{RelayEndpoint, RelayOptions, RelaySummary};
use chrono::Utc;
use log::{info, warn};
use std::time::Instant;
use tokio::task::{self, JoinError, JoinHandle};

/// Relay one file from `source_path` on `source` to `target_path` on `target`.
///
/// Both sessions are established concurrently and are closed before this
/// returns, whatever the outcome.
pub async fn relay(
    source: &RelayEndpoint,
    source_path: &str,
    target: &RelayEndpoint,
    target_path: &str,
    options: &RelayOptions,
) -> RelayResult<RelaySummary> {
    validate(source_path, target_path, options)?;

    let relay_id = uuid::Uuid::new_v4().to_string();
    let started_at = Utc::now();
    let clock = Instant::now();
    let interrupt = Interrupt::new(options.cancel.clone(), options.timeout);
    let source_label = source.descriptor.endpoint();
    let target_label = target.descriptor.endpoint();

    info!(
        "Relay {} starting: {}:{} -> {}:{}",
        relay_id, source_label, source_path, target_label, target_path
    );

    let (src_session, dst_session) = establish_both(source, target, options, &interrupt).await?;

    let chunk_size = options.chunk_size;
    let progress = options.progress.clone();
    let from = source_path.to_string();
    let to = target_path.to_string();
    let copied = task::spawn_blocking(move || {
        let copy_options = CopyOptions {
            chunk_size,
            interrupt: &interrupt,
            progress: progress.as_ref(),
        };
        let result = relay_stream(&src_session, &from, &dst_session, &to, &copy_options);
        close_logged(dst_session);
        close_logged(src_session);
        result
    })
    .await
    .map_err(|e| RelayError::copy_failed(0, format!("Relay task failed: {}", e)))??;

    let duration = clock.elapsed();
    let secs = duration.as_secs_f64();
    let summary = RelaySummary {
        relay_id,
        source: format!("{}:{}", source_label, source_path),
        target: format!("{}:{}", target_label, target_path),
        bytes_transferred: copied,
        started_at,
        duration_ms: duration.as_millis() as u64,
        average_speed_bps: if secs > 0.0 { copied as f64 / secs } else { 0.0 },
    };
    info!(
        "Relay {} complete: {} bytes in {} ms",
        summary.relay_id, summary.bytes_transferred, summary.duration_ms
    );
    Ok(summary)
}

fn validate(source_path: &str, target_path: &str, options: &RelayOptions) -> RelayResult<()> {
    if options.chunk_size == 0 {
        return Err(RelayError::invalid_config("Chunk size must be greater than 0"));
    }
    if source_path.trim().is_empty() {
        return Err(RelayError::invalid_config("Source path must not be empty"));
    }
    if target_path.trim().is_empty() {
        return Err(RelayError::invalid_config("Target path must not be empty"));
    }
    Ok(())
}

/// Establish both sessions concurrently. The first failure aborts the other
/// establishment; a session that still opened is closed again.
async fn establish_both(
    source: &RelayEndpoint,
    target: &RelayEndpoint,
    options: &RelayOptions,
    interrupt: &Interrupt,
) -> RelayResult<(SftpSession, SftpSession)> {
    let source_label = source.descriptor.endpoint();
    let target_label = target.descriptor.endpoint();
    let abort = CancelToken::new();
    let setup = interrupt.clone().with_abort(abort.clone());

    let mut src = spawn_establish(source, options, &setup);
    let mut dst = spawn_establish(target, options, &setup);

    let (source_first, first) = tokio::select! {
        joined = &mut src => (true, flatten_join(joined, &source_label)),
        joined = &mut dst => (false, flatten_join(joined, &target_label)),
    };
    if let Err(e) = &first {
        warn!("Aborting the other session: {}", e);
        abort.cancel();
    }
    let (src, dst) = if source_first {
        (first, flatten_join(dst.await, &target_label))
    } else {
        (flatten_join(src.await, &source_label), first)
    };

    match (src, dst) {
        (Ok(s), Ok(d)) => Ok((s, d)),
        (Err(e), Ok(d)) => {
            close_all(vec![d]).await;
            Err(e)
        }
        (Ok(s), Err(e)) => {
            close_all(vec![s]).await;
            Err(e)
        }
        // The source wins unless it only stopped because the target failed.
        (Err(s), Err(d)) => {
            let (reported, other) = if source_first || !s.is_cancelled() {
                (s, d)
            } else {
                (d, s)
            };
            warn!("Other session also failed: {}", other);
            Err(reported)
        }
    }
}

fn spawn_establish(
    endpoint: &RelayEndpoint,
    options: &RelayOptions,
    interrupt: &Interrupt,
) -> JoinHandle<RelayResult<SftpSession>> {
    let endpoint = endpoint.clone();
    let establisher = Establisher::new(options.connect_timeout, interrupt.clone());
    task::spawn_blocking(move || establisher.establish(&endpoint.descriptor, &endpoint.host_key))
}

fn flatten_join(
    joined: Result<RelayResult<SftpSession>, JoinError>,
    endpoint: &str,
) -> RelayResult<SftpSession> {
    joined.map_err(|e| {
        RelayError::connection_failed(format!("Establishment task failed: {}", e))
            .with_endpoint(endpoint)
    })?
}

fn close_logged(session: SftpSession) {
    let endpoint = session.endpoint().to_string();
    if let Err(e) = session.close() {
        warn!("Failed to close session {}: {}", endpoint, e);
    }
}

async fn close_all(sessions: Vec<SftpSession>) {
    if let Err(e) = task::spawn_blocking(move || sessions.into_iter().for_each(close_logged)).await
    {
        warn!("Session release task failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::error::RelayErrorKind;
    use crate::relay::host_keys::HostKeyPolicy;
    use crate::relay::testing::silent_server;
    use crate::relay::types::{AuthMethod, ConnectionDescriptor};
    use secrecy::SecretString;
    use std::net::TcpListener;
    use std::time::Duration;

    fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn password_endpoint(port: u16) -> RelayEndpoint {
        RelayEndpoint::new(
            ConnectionDescriptor {
                host: "127.0.0.1".into(),
                port,
                username: "user".into(),
                auth: AuthMethod::Password(SecretString::new("pw".into())),
            },
            HostKeyPolicy::AcceptAny,
        )
    }

    fn missing_key_endpoint() -> RelayEndpoint {
        RelayEndpoint::new(
            ConnectionDescriptor::with_key_file(
                "192.0.2.1",
                22,
                "user",
                "/nonexistent/sorng_relay/id_rsa",
            ),
            HostKeyPolicy::RejectAll,
        )
    }

    #[tokio::test]
    async fn test_missing_key_is_reported_before_anything_is_copied() {
        let source = missing_key_endpoint();
        let target = password_endpoint(refused_port());

        let err = relay(
            &source,
            "/data/a.txt",
            &target,
            "/in/a.txt",
            &RelayOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::KeyUnavailable);
        assert_eq!(err.endpoint.as_deref(), Some("user@192.0.2.1:22"));
        assert!(err.bytes_transferred.is_none());
    }

    #[tokio::test]
    async fn test_source_failure_stops_stalled_target() {
        let source = missing_key_endpoint();
        let target = password_endpoint(silent_server());
        let options = RelayOptions {
            connect_timeout: Duration::from_secs(4),
            ..RelayOptions::default()
        };

        let started = std::time::Instant::now();
        let err = relay(&source, "/a", &target, "/b", &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::KeyUnavailable);
        assert_eq!(err.endpoint.as_deref(), Some("user@192.0.2.1:22"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_target_failure_stops_stalled_source() {
        let source = password_endpoint(silent_server());
        let target = missing_key_endpoint();
        let options = RelayOptions {
            connect_timeout: Duration::from_secs(4),
            ..RelayOptions::default()
        };

        let started = std::time::Instant::now();
        let err = relay(&source, "/a", &target, "/b", &options)
            .await
            .unwrap_err();
        // The source only stopped because of the target, so the target's error wins.
        assert_eq!(err.kind, RelayErrorKind::KeyUnavailable);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_during_stalled_handshakes() {
        let port = silent_server();
        let cancel = CancelToken::new();
        let options = RelayOptions {
            connect_timeout: Duration::from_secs(6),
            cancel: cancel.clone(),
            ..RelayOptions::default()
        };
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let err = relay(
            &password_endpoint(port),
            "/a",
            &password_endpoint(port),
            "/b",
            &options,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_zero_chunk_size() {
        let options = RelayOptions {
            chunk_size: 0,
            ..RelayOptions::default()
        };
        let err = relay(
            &missing_key_endpoint(),
            "/a",
            &missing_key_endpoint(),
            "/b",
            &options,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_empty_path_rejected() {
        let err = relay(
            &missing_key_endpoint(),
            " ",
            &missing_key_endpoint(),
            "/b",
            &RelayOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, RelayErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let options = RelayOptions {
            cancel,
            ..RelayOptions::default()
        };
        let port = refused_port();
        let err = relay(
            &password_endpoint(port),
            "/a",
            &password_endpoint(port),
            "/b",
            &options,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }
}
