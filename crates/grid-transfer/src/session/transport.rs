//! Transport seam over the native GridFTP library.
//!
//! The engine never talks the wire protocol itself; it drives a transport
//! through this trait and gets completion through the request/stream
//! callbacks. Register-style calls are non-blocking: they queue the
//! operation and return, and the transport later completes the associated
//! [`RequestState`] or [`StreamState`].

use crate::error::{errno, Result, TransferError};
use crate::request::{OpKind, RequestState, StreamState};
use crate::session::SessionOptions;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Raw throughput sample reported by the transport during a third-party copy.
#[derive(Debug, Clone, Copy)]
pub struct RawPerfMarker {
    /// Total bytes moved so far
    pub total_bytes: u64,
    /// Instantaneous throughput, bytes per second
    pub instant_throughput: u64,
    /// Average throughput, bytes per second
    pub average_throughput: u64,
}

/// Channel on which the transport publishes performance markers.
pub type PerfSender = tokio::sync::mpsc::UnboundedSender<RawPerfMarker>;

fn unsupported(operation: &str) -> TransferError {
    TransferError::protocol(operation, errno::ENOTSUP, "operation not supported by this transport")
}

/// One established control connection to a storage host.
///
/// Operations default to ENOTSUP so partial implementations (and test
/// doubles) only provide what they use. `abort` has no default: every
/// transport must be able to interrupt its own operations.
pub trait FtpTransport: Send + Sync {
    /// Begin a get transfer, optionally from a byte offset.
    fn start_read(&self, _url: &str, _offset: Option<u64>, _stream: &StreamState) -> Result<()> {
        Err(unsupported("start_read"))
    }

    /// Begin a put transfer, optionally at a byte offset.
    fn start_write(&self, _url: &str, _offset: Option<u64>, _stream: &StreamState) -> Result<()> {
        Err(unsupported("start_write"))
    }

    /// Begin a directory listing; entries arrive as newline-separated
    /// records through the stream.
    fn start_list(&self, _url: &str, _stream: &StreamState) -> Result<()> {
        Err(unsupported("start_list"))
    }

    /// Queue a read of up to `len` bytes on an active get transfer. The
    /// chunk is delivered through [`StreamState::deliver_read`].
    fn register_read(&self, _len: usize, _stream: &StreamState) -> Result<()> {
        Err(unsupported("register_read"))
    }

    /// Queue a write on an active put transfer. `eof` marks the final block.
    fn register_write(&self, _data: Bytes, _eof: bool, _stream: &StreamState) -> Result<()> {
        Err(unsupported("register_write"))
    }

    /// Begin a third-party server-to-server copy. Performance markers go to
    /// `perf` while the copy runs; completion goes to `request`.
    fn start_url_copy(
        &self,
        _source: &str,
        _destination: &str,
        _request: &RequestState,
        _perf: Option<PerfSender>,
    ) -> Result<()> {
        Err(unsupported("start_url_copy"))
    }

    /// Apply per-transfer tuning before a data operation.
    fn apply_transfer_options(&self, _nb_streams: u32, _tcp_buffer_size: u64) -> Result<()> {
        Ok(())
    }

    /// Clear per-transfer state (tuning, marker callbacks) so the session
    /// can go back to the pool clean.
    fn reset(&self) {}

    /// Interrupt the in-flight operation on the given channel. The
    /// operation still completes through its callback afterwards.
    fn abort(&self, kind: OpKind) -> Result<()>;
}

/// Builds transports; one control connection per call.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, host: &str, options: &SessionOptions) -> Result<Arc<dyn FtpTransport>>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Transport double that only counts aborts.
    pub(crate) struct MockTransport {
        pub(crate) abort_count: Arc<AtomicUsize>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            MockTransport {
                abort_count: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl FtpTransport for MockTransport {
        fn abort(&self, _kind: OpKind) -> Result<()> {
            self.abort_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_defaults_are_unsupported() {
        let transport = MockTransport::new();
        let stream = crate::request::StreamState::new(OpKind::Data);
        let err = transport.register_read(16, &stream).unwrap_err();
        assert_eq!(err.code(), errno::ENOTSUP);
    }
}
