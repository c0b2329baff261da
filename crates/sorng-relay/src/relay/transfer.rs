// ── Stream relay – chunked copy between two remote handles ───────────────────

use crate::relay::cancel::Interrupt;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::session::{RemoteFs, RemoteWrite};
use crate::relay::types::{ProgressCallback, TransferProgress};
use log::{debug, info};
use std::io::{ErrorKind, Read};
use std::time::Instant;

/// Per-copy settings.
pub struct CopyOptions<'o> {
    pub chunk_size: usize,
    pub interrupt: &'o Interrupt,
    pub progress: Option<&'o ProgressCallback>,
}

/// Copy `source_path` on `source` to `target_path` on `target`.
///
/// Streams through one `chunk_size` buffer; the file is never held in memory.
/// Returns the number of bytes written. On a mid-copy failure the error
/// carries the bytes written so far and the target is left as it is.
pub fn relay_stream<S, T>(
    source: &S,
    source_path: &str,
    target: &T,
    target_path: &str,
    options: &CopyOptions<'_>,
) -> RelayResult<u64>
where
    S: RemoteFs + ?Sized,
    T: RemoteFs + ?Sized,
{
    if options.chunk_size == 0 {
        return Err(RelayError::invalid_config("Chunk size must be greater than 0"));
    }

    let mut reader = source.open_read(source_path).map_err(|e| {
        RelayError::source_open_failed(e.to_string())
            .with_endpoint(source.describe())
            .with_path(source_path)
    })?;

    // `reader` is dropped on this early return, releasing the source handle.
    let mut writer = target.open_write(target_path).map_err(|e| {
        RelayError::target_open_failed(e.to_string())
            .with_endpoint(target.describe())
            .with_path(target_path)
    })?;

    debug!(
        "Copying {}:{} -> {}:{}",
        source.describe(),
        source_path,
        target.describe(),
        target_path
    );

    let on_target = |e: RelayError| e.with_endpoint(target.describe()).with_path(target_path);
    let on_source = |e: RelayError| e.with_endpoint(source.describe()).with_path(source_path);

    let copied = pump(&mut *reader, &mut *writer, options, &on_source, &on_target)
        .map_err(|e| options.interrupt.classify(e, "copy"))?;

    // Close the write handle before the read handle; a refused close means
    // the target may not hold what was written.
    writer.finish().map_err(|e| {
        let err = on_target(RelayError::copy_failed(
            copied,
            format!("Close error: {}", e),
        ));
        options.interrupt.classify(err, "copy")
    })?;
    drop(reader);

    info!("Relayed {} bytes to {}:{}", copied, target.describe(), target_path);
    Ok(copied)
}

fn pump(
    reader: &mut dyn Read,
    writer: &mut dyn RemoteWrite,
    options: &CopyOptions<'_>,
    on_source: &dyn Fn(RelayError) -> RelayError,
    on_target: &dyn Fn(RelayError) -> RelayError,
) -> RelayResult<u64> {
    let mut buf = vec![0u8; options.chunk_size];
    let mut transferred: u64 = 0;
    let epoch = Instant::now();

    loop {
        options
            .interrupt
            .check("copy")
            .map_err(|e| on_source(e.with_bytes(transferred)))?;

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(on_source(RelayError::copy_failed(
                    transferred,
                    format!("Read error: {}", e),
                )))
            }
        };

        writer.write_all(&buf[..n]).map_err(|e| {
            on_target(RelayError::copy_failed(
                transferred,
                format!("Write error: {}", e),
            ))
        })?;
        transferred += n as u64;

        if let Some(progress) = options.progress {
            let elapsed = epoch.elapsed();
            let secs = elapsed.as_secs_f64();
            progress(&TransferProgress {
                bytes_transferred: transferred,
                elapsed_ms: elapsed.as_millis() as u64,
                speed_bytes_per_sec: if secs > 0.0 {
                    transferred as f64 / secs
                } else {
                    0.0
                },
            });
        }
    }

    writer.flush().map_err(|e| {
        on_target(RelayError::copy_failed(
            transferred,
            format!("Flush error: {}", e),
        ))
    })?;

    Ok(transferred)
}
