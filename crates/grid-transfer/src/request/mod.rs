//! Asynchronous request lifecycle.
//!
//! Every operation driven through the native transport follows the same
//! lifecycle: it is launched, runs until the transport's completion callback
//! fires, and ends FINISHED with an optional recorded error. Waiters block on
//! the completion; a deadline or an explicit cancel records an error and asks
//! the transport to abort, but the request only becomes FINISHED when the
//! transport actually reports completion. Aborting twice on the same handle
//! crashes some native libraries, so the abort is issued at most once.

use crate::error::{errno, Result, TransferError};
use crate::session::transport::FtpTransport;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Which channel of the session an operation runs on. Aborts must target
/// the right one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Control-channel operation (stat, mkdir, delete, checksum)
    Control,
    /// Data-channel operation (get, put, list, third-party copy)
    Data,
}

/// Lifecycle phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    NotLaunched,
    Running,
    Finished,
}

struct RequestCore {
    status: RequestStatus,
    /// First recorded failure, as (code, message). Later failures never
    /// overwrite it.
    error: Option<(i32, String)>,
    canceling: bool,
    abort_issued: bool,
    operation: &'static str,
}

struct RequestInner {
    core: Mutex<RequestCore>,
    notify: Notify,
    kind: OpKind,
    transport: Mutex<Option<Arc<dyn FtpTransport>>>,
}

/// Shared handle on one in-flight operation. Clones observe the same state.
#[derive(Clone)]
pub struct RequestState {
    inner: Arc<RequestInner>,
}

/// Handle given to the transport to signal completion. Completing twice is
/// harmless; the first outcome wins.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<RequestInner>,
}

impl RequestState {
    pub fn new(kind: OpKind) -> Self {
        RequestState {
            inner: Arc::new(RequestInner {
                core: Mutex::new(RequestCore {
                    status: RequestStatus::NotLaunched,
                    error: None,
                    canceling: false,
                    abort_issued: false,
                    operation: "request",
                }),
                notify: Notify::new(),
                kind,
                transport: Mutex::new(None),
            }),
        }
    }

    pub fn with_transport(self, transport: Arc<dyn FtpTransport>) -> Self {
        *self.inner.transport.lock().unwrap() = Some(transport);
        self
    }

    /// Mark the request running and clear any error left by a previous
    /// operation on the same handle. Fails if an operation is already in
    /// flight or the request has been cancelled.
    pub fn start(&self, operation: &'static str) -> Result<()> {
        let mut core = self.inner.core.lock().unwrap();
        if core.canceling {
            return Err(TransferError::canceled(format!(
                "{} not launched: request already cancelled",
                operation
            )));
        }
        if core.status == RequestStatus::Running {
            return Err(TransferError::invalid_argument(format!(
                "{} not launched: another operation is in flight",
                operation
            )));
        }
        core.status = RequestStatus::Running;
        core.error = None;
        core.operation = operation;
        Ok(())
    }

    /// Completion handle for the transport's callback.
    pub fn completion(&self) -> CompletionHandle {
        CompletionHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.inner.core.lock().unwrap().status
    }

    pub fn is_canceling(&self) -> bool {
        self.inner.core.lock().unwrap().canceling
    }

    /// Code of the recorded error, if any.
    pub fn error_code(&self) -> Option<i32> {
        self.inner.core.lock().unwrap().error.as_ref().map(|(c, _)| *c)
    }

    /// Resolve to () once the request is FINISHED. Does not consume the
    /// outcome; use [`report`](Self::report) for that.
    pub async fn finished(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.core.lock().unwrap().status == RequestStatus::Finished {
                return;
            }
            notified.as_mut().await;
        }
    }

    /// Block until the operation completes. If `timeout` elapses first, a
    /// timeout error is recorded, the operation is cancelled, and the wait
    /// resumes until the transport acknowledges completion. The recorded
    /// timeout wins over the cancellation marker.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, self.finished()).await.is_err() {
                    debug!(
                        "operation '{}' exceeded its {}s deadline, cancelling",
                        self.operation(),
                        limit.as_secs()
                    );
                    self.record_error(errno::ETIMEDOUT, "operation deadline exceeded");
                    let _ = self.cancel("deadline exceeded");
                    self.finished().await;
                }
            }
            None => self.finished().await,
        }
        self.report()
    }

    /// Outcome of the last completed operation.
    pub fn report(&self) -> Result<()> {
        let core = self.inner.core.lock().unwrap();
        match &core.error {
            Some((code, message)) => Err(TransferError::from_code(core.operation, *code, message.clone())),
            None => Ok(()),
        }
    }

    /// Mark the request cancelled and ask the transport to abort the
    /// operation. Idempotent: later calls observe the first outcome and do
    /// not re-issue the abort. The request stays RUNNING until the transport
    /// reports completion.
    pub fn cancel(&self, reason: &str) -> Result<()> {
        let transport = {
            let mut core = self.inner.core.lock().unwrap();
            if core.status == RequestStatus::Finished || core.abort_issued {
                return Ok(());
            }
            core.canceling = true;
            core.abort_issued = true;
            if core.error.is_none() {
                core.error = Some((errno::ECANCELED, reason.to_string()));
            }
            self.inner.transport.lock().unwrap().clone()
        };
        debug!("cancelling '{}': {}", self.operation(), reason);
        if let Some(transport) = transport {
            if let Err(e) = transport.abort(self.inner.kind) {
                warn!("abort request failed: {}", e);
            }
        }
        Ok(())
    }

    /// Record a failure if none is recorded yet.
    pub fn record_error(&self, code: i32, message: impl Into<String>) {
        let mut core = self.inner.core.lock().unwrap();
        if core.error.is_none() {
            core.error = Some((code, message.into()));
        }
    }

    fn operation(&self) -> &'static str {
        self.inner.core.lock().unwrap().operation
    }
}

impl CompletionHandle {
    /// Report successful completion.
    pub fn complete_ok(&self) {
        self.finish(None);
    }

    /// Report failed completion.
    pub fn complete_err(&self, code: i32, message: impl Into<String>) {
        self.finish(Some((code, message.into())));
    }

    fn finish(&self, outcome: Option<(i32, String)>) {
        let mut core = self.inner.core.lock().unwrap();
        if core.status == RequestStatus::Finished {
            return;
        }
        // While canceling, the callback's error is abort noise; keep the
        // error recorded by cancel/timeout instead.
        if !core.canceling {
            if let Some((code, message)) = outcome {
                if core.error.is_none() {
                    core.error = Some((code, message));
                }
            }
        }
        core.status = RequestStatus::Finished;
        drop(core);
        self.inner.notify.notify_waiters();
    }
}

struct StreamIo {
    offset: u64,
    eof: bool,
    chunk: Option<Bytes>,
}

/// Request state plus stream position for get/put/list operations. The
/// offset advances only on delivered data; a zero-length delivery marks
/// end of file.
#[derive(Clone)]
pub struct StreamState {
    request: RequestState,
    io: Arc<Mutex<StreamIo>>,
}

impl StreamState {
    pub fn new(kind: OpKind) -> Self {
        StreamState {
            request: RequestState::new(kind),
            io: Arc::new(Mutex::new(StreamIo {
                offset: 0,
                eof: false,
                chunk: None,
            })),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn FtpTransport>) -> Self {
        self.request = self.request.with_transport(transport);
        self
    }

    pub fn request(&self) -> &RequestState {
        &self.request
    }

    pub fn offset(&self) -> u64 {
        self.io.lock().unwrap().offset
    }

    pub fn eof(&self) -> bool {
        self.io.lock().unwrap().eof
    }

    /// Transport callback: a read chunk arrived. Advances the offset by the
    /// chunk length and completes the pending operation.
    pub fn deliver_read(&self, data: Bytes, eof: bool) {
        {
            let mut io = self.io.lock().unwrap();
            io.offset += data.len() as u64;
            if eof || data.is_empty() {
                io.eof = true;
            }
            io.chunk = Some(data);
        }
        self.request.completion().complete_ok();
    }

    /// Transport callback: a write was flushed. Advances the offset and
    /// completes the pending operation.
    pub fn deliver_write(&self, len: usize) {
        self.io.lock().unwrap().offset += len as u64;
        self.request.completion().complete_ok();
    }

    /// Transport callback: the operation failed.
    pub fn deliver_error(&self, code: i32, message: impl Into<String>) {
        self.request.completion().complete_err(code, message);
    }

    /// Mark end of file. Write streams call this after flushing their final
    /// block; the transport only sets it for reads.
    pub fn set_eof(&self) {
        self.io.lock().unwrap().eof = true;
    }

    /// Take the chunk delivered by the last read.
    pub fn take_chunk(&self) -> Bytes {
        self.io.lock().unwrap().chunk.take().unwrap_or_else(Bytes::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transport::tests::MockTransport;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_wait_resolves_on_completion() {
        let request = RequestState::new(OpKind::Data);
        request.start("get").unwrap();
        let completion = request.completion();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completion.complete_ok();
        });
        request.wait(None).await.unwrap();
        assert_eq!(request.status(), RequestStatus::Finished);
    }

    #[tokio::test]
    async fn test_wait_reports_transport_error() {
        let request = RequestState::new(OpKind::Data);
        request.start("get").unwrap();
        let completion = request.completion();
        completion.complete_err(errno::ENOENT, "550 No such file");
        let err = request.wait(None).await.unwrap_err();
        assert_eq!(err.code(), errno::ENOENT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_then_waits_for_completion() {
        // The transport acknowledges the abort some time after it is issued;
        // wait() must not return before that acknowledgement.
        let transport = Arc::new(MockTransport::new());
        let request =
            RequestState::new(OpKind::Data).with_transport(transport.clone() as Arc<dyn FtpTransport>);
        request.start("url_copy").unwrap();

        let completion = request.completion();
        let abort_seen = transport.abort_count.clone();
        tokio::spawn(async move {
            // Acknowledge the abort 100ms after it is issued.
            while abort_seen.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            completion.complete_err(errno::ECANCELED, "aborted");
        });

        let err = request.wait(Some(Duration::from_secs(1))).await.unwrap_err();
        // The timeout was recorded before the cancel marker, so it wins.
        assert_eq!(err.code(), errno::ETIMEDOUT);
        assert_eq!(request.status(), RequestStatus::Finished);
        assert_eq!(transport.abort_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let transport = Arc::new(MockTransport::new());
        let request =
            RequestState::new(OpKind::Data).with_transport(transport.clone() as Arc<dyn FtpTransport>);
        request.start("put").unwrap();

        request.cancel("caller gave up").unwrap();
        request.cancel("caller gave up again").unwrap();
        // Only one abort reaches the transport.
        assert_eq!(transport.abort_count.load(Ordering::SeqCst), 1);

        request.completion().complete_ok();
        let first = request.wait(None).await.unwrap_err();
        assert_eq!(first.code(), errno::ECANCELED);
        // A second report sees the same terminal error.
        let second = request.report().unwrap_err();
        assert_eq!(second.code(), errno::ECANCELED);
        assert_eq!(format!("{}", first), format!("{}", second));
    }

    #[tokio::test]
    async fn test_callback_error_ignored_while_canceling() {
        let request = RequestState::new(OpKind::Data);
        request.start("get").unwrap();
        request.cancel("shutting down").unwrap();
        // The abort makes the native callback fire with its own error; the
        // cancel marker must survive it.
        request.completion().complete_err(errno::ECOMM, "abort noise");
        let err = request.wait(None).await.unwrap_err();
        assert_eq!(err.code(), errno::ECANCELED);
    }

    #[tokio::test]
    async fn test_start_rejected_after_cancel() {
        let request = RequestState::new(OpKind::Control);
        request.start("stat").unwrap();
        request.cancel("done with this handle").unwrap();
        request.completion().complete_ok();
        assert!(request.start("stat").is_err());
    }

    #[tokio::test]
    async fn test_start_clears_previous_error() {
        let request = RequestState::new(OpKind::Data);
        request.start("read").unwrap();
        request.completion().complete_err(errno::ECOMM, "hiccup");
        assert!(request.wait(None).await.is_err());

        // Relaunching the same handle starts from a clean slate.
        request.start("read").unwrap();
        request.completion().complete_ok();
        request.wait(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_offset_and_eof() {
        let stream = StreamState::new(OpKind::Data);
        stream.request().start("read").unwrap();
        stream.deliver_read(Bytes::from_static(b"abcd"), false);
        stream.request().wait(None).await.unwrap();
        assert_eq!(stream.offset(), 4);
        assert!(!stream.eof());
        assert_eq!(stream.take_chunk(), Bytes::from_static(b"abcd"));

        stream.request().start("read").unwrap();
        stream.deliver_read(Bytes::new(), true);
        stream.request().wait(None).await.unwrap();
        assert_eq!(stream.offset(), 4);
        assert!(stream.eof());
    }
}
