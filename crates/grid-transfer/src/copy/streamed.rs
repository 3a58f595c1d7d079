//! Streamed copy fallback.
//!
//! When no third-party copy is possible the data flows through this
//! process: read a chunk from the source, write it to the destination,
//! until EOF. Cancellation and the transfer deadline are checked between
//! chunks, so a stuck backend stalls at most one chunk.

use crate::backend::FileBackend;
use crate::config::CopyConfig;
use crate::error::{Result, TransferError};
use crate::events::PerfMarker;
use crate::params::TransferParams;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Copy `source` to `destination` chunk by chunk. Returns the byte count.
/// Both handles are closed on every exit path; when the loop already
/// failed, close errors are logged away so they cannot mask the original
/// failure.
pub async fn streamed_copy(
    backend: &dyn FileBackend,
    config: &CopyConfig,
    params: &TransferParams,
    cancel: &CancellationToken,
    deadline: Instant,
    source: &str,
    destination: &str,
) -> Result<u64> {
    let mut reader = backend.open_read(source).await?;
    let mut writer = match backend.open_write(destination).await {
        Ok(w) => w,
        Err(e) => {
            if let Err(close_err) = reader.close().await {
                debug!("closing source after failed open: {}", close_err);
            }
            return Err(e);
        }
    };

    let started = Instant::now();
    let perf_interval = Duration::from_secs(config.perf_interval_secs);
    let mut last_sample = started;
    let mut bytes_at_sample: u64 = 0;
    let mut total: u64 = 0;

    let mut outcome: Result<()> = Ok(());
    loop {
        if cancel.is_cancelled() {
            outcome = Err(TransferError::canceled(format!(
                "copy of {} cancelled after {} bytes",
                source, total
            )));
            break;
        }
        if Instant::now() >= deadline {
            outcome = Err(TransferError::timeout(format!(
                "copy of {} exceeded its deadline after {} bytes",
                source, total
            )));
            break;
        }

        let chunk = match reader.read(config.buffer_size).await {
            Ok(c) => c,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };
        if chunk.is_empty() {
            break;
        }
        if let Err(e) = writer.write(&chunk).await {
            outcome = Err(e);
            break;
        }
        total += chunk.len() as u64;

        let since_sample = last_sample.elapsed();
        if since_sample >= perf_interval {
            let elapsed = started.elapsed();
            params.emit_perf(&PerfMarker {
                bytes_transferred: total,
                instant_throughput: (total - bytes_at_sample) / since_sample.as_secs().max(1),
                average_throughput: total / elapsed.as_secs().max(1),
                elapsed,
            });
            last_sample = Instant::now();
            bytes_at_sample = total;
        }
    }

    if let Err(e) = writer.close().await {
        if outcome.is_ok() {
            outcome = Err(e);
        } else {
            debug!("closing destination after failure: {}", e);
        }
    }
    if let Err(e) = reader.close().await {
        if outcome.is_ok() {
            outcome = Err(e);
        } else {
            debug!("closing source after failure: {}", e);
        }
    }

    outcome.map(|_| total)
}
