//! Copy orchestration.
//!
//! A copy runs in phases: destination precheck, preparation (source
//! checksum and SURL resolution run concurrently), data movement, commit,
//! destination checksum, cleanup. An SRM upload stays invisible until the
//! put-done commit; any failure before that point rolls the upload back,
//! and the rollback never masks the error that caused it.

pub mod streamed;

use crate::backend::FileBackend;
use crate::checksum::checksums_equal;
use crate::config::Config;
use crate::error::{errno, ChecksumComparison, Result, TransferError};
use crate::events::{stage, PerfMarker, Side, TransferEvent};
use crate::params::{ChecksumMode, TransferParams};
use crate::request::{OpKind, RequestState};
use crate::session::transport::RawPerfMarker;
use crate::session::SessionPool;
use crate::srm::{is_srm_url, SrmStaging, StagedFile};
use crate::uri;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcome of a completed copy.
#[derive(Debug, Clone, Serialize)]
pub struct CopyResult {
    pub transfer_id: String,
    pub source: String,
    pub destination: String,
    pub bytes_transferred: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    /// Checksum computed on the destination, when verification ran
    pub destination_checksum: Option<String>,
}

/// Effective checksum settings for one copy, resolved from the parameters
/// and the configuration.
struct ChecksumPlan {
    mode: ChecksumMode,
    algorithm: String,
    user_value: Option<String>,
}

/// Drives copies across the session pool, the SRM staging machinery and the
/// generic file backend. Owns the context-wide cancellation token: cancel
/// it and every in-flight phase winds down.
pub struct CopyOrchestrator {
    pool: Arc<SessionPool>,
    staging: Arc<SrmStaging>,
    backend: Arc<dyn FileBackend>,
    config: Config,
    cancel: CancellationToken,
}

fn is_gridftp_url(url: &str) -> bool {
    matches!(uri::scheme_of(url), Some("gsiftp") | Some("ftp"))
}

impl CopyOrchestrator {
    pub fn new(
        pool: Arc<SessionPool>,
        staging: Arc<SrmStaging>,
        backend: Arc<dyn FileBackend>,
        config: Config,
    ) -> Self {
        CopyOrchestrator {
            pool,
            staging,
            backend,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token observed by every phase of every copy on this orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel everything currently running on this orchestrator.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Copy `source` to `destination` according to `params`.
    pub async fn copy(
        &self,
        params: &TransferParams,
        source: &str,
        destination: &str,
    ) -> Result<CopyResult> {
        let transfer_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = Instant::now() + params.effective_timeout(&self.config);
        info!("[{}] copy {} -> {}", transfer_id, source, destination);

        let plan = self.checksum_plan(params);

        if !params.strict_copy {
            self.prepare_destination(params, destination).await?;
        }

        params.emit(&TransferEvent::new(
            Side::Both,
            "copy",
            stage::PREPARE_ENTER,
            format!("{} -> {}", source, destination),
        ));

        // Advisory size for PUT staging; a source that cannot be statted
        // still transfers, the endpoint just allocates blindly.
        let source_size = if is_srm_url(destination) {
            match self.backend.stat(source).await {
                Ok(s) => s.size,
                Err(e) => {
                    debug!("could not stat {} for size hint: {}", source, e);
                    0
                }
            }
        } else {
            0
        };

        let protocols = &self.config.srm.transfer_protocols;
        let checksum_task = async {
            if plan.mode.source() {
                params.emit(&TransferEvent::new(
                    Side::Source,
                    "copy",
                    stage::CHECKSUM_ENTER,
                    plan.algorithm.clone(),
                ));
                let result = self.backend.checksum(source, &plan.algorithm).await;
                params.emit(&TransferEvent::new(
                    Side::Source,
                    "copy",
                    stage::CHECKSUM_EXIT,
                    plan.algorithm.clone(),
                ));
                Some(result)
            } else {
                None
            }
        };
        let get_task = async {
            if is_srm_url(source) {
                Some(
                    self.staging
                        .stage_get(
                            source,
                            protocols,
                            params.source_spacetoken.clone(),
                            &self.cancel,
                        )
                        .await,
                )
            } else {
                None
            }
        };
        let put_task = async {
            if is_srm_url(destination) {
                Some(
                    self.staging
                        .stage_put(
                            destination,
                            source_size,
                            protocols,
                            params.dest_spacetoken.clone(),
                            &self.cancel,
                        )
                        .await,
                )
            } else {
                None
            }
        };
        let (sum_result, get_result, put_result) = tokio::join!(checksum_task, get_task, put_task);

        // Unpack the join. Staged handles are kept even on failure so the
        // cleanup below can roll them back. The first failure wins, in
        // fixed order: source resolution, source checksum, destination
        // resolution.
        let mut staged_get: Option<StagedFile> = None;
        let mut staged_put: Option<StagedFile> = None;
        let mut source_checksum: Option<String> = None;
        let mut failure: Option<TransferError> = None;

        if let Some(result) = get_result {
            match result {
                Ok(staged) => staged_get = Some(staged),
                Err(e) => failure = Some(e),
            }
        }
        if let Some(result) = sum_result {
            match result {
                Ok(sum) if sum.is_empty() && self.config.srm.allow_empty_source_checksum => {
                    debug!("source {} has no stored checksum, accepted", source);
                }
                Ok(sum) if sum.is_empty() => {
                    if failure.is_none() {
                        failure = Some(TransferError::protocol(
                            "checksum",
                            errno::EIO,
                            format!("source {} returned an empty checksum", source),
                        ));
                    }
                }
                Ok(sum) => {
                    if let Some(user) = &plan.user_value {
                        if !checksums_equal(user, &sum) && failure.is_none() {
                            failure = Some(TransferError::ChecksumMismatch {
                                comparison: ChecksumComparison::UserVsSource,
                                expected: user.clone(),
                                actual: sum.clone(),
                            });
                        }
                    }
                    source_checksum = Some(sum);
                }
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(result) = put_result {
            match result {
                Ok(staged) => staged_put = Some(staged),
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        params.emit(&TransferEvent::new(
            Side::Both,
            "copy",
            stage::PREPARE_EXIT,
            format!("{} -> {}", source, destination),
        ));

        let mut outcome: Result<()> = match failure {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if outcome.is_ok() && self.cancel.is_cancelled() {
            outcome = Err(TransferError::canceled("transfer context cancelled"));
        }

        // Data movement
        let mut bytes: u64 = 0;
        if outcome.is_ok() {
            let source_turl = staged_get
                .as_ref()
                .map(|s| s.turl.as_str())
                .unwrap_or(source);
            let dest_turl = staged_put
                .as_ref()
                .map(|s| s.turl.as_str())
                .unwrap_or(destination);
            params.emit(&TransferEvent::new(
                Side::Both,
                "copy",
                stage::TRANSFER_ENTER,
                format!("{} -> {}", source_turl, dest_turl),
            ));
            let inner = params.for_turl_transfer();
            let moved = if is_gridftp_url(source_turl) && is_gridftp_url(dest_turl) {
                self.third_party_copy(&inner, source_turl, dest_turl, source_size, deadline)
                    .await
            } else {
                streamed::streamed_copy(
                    self.backend.as_ref(),
                    &self.config.copy,
                    &inner,
                    &self.cancel,
                    deadline,
                    source_turl,
                    dest_turl,
                )
                .await
            };
            match moved {
                Ok(n) => {
                    bytes = n;
                    params.emit(&TransferEvent::new(
                        Side::Both,
                        "copy",
                        stage::TRANSFER_EXIT,
                        format!("{} bytes", n),
                    ));
                }
                Err(e) => {
                    params.emit(&TransferEvent::new(
                        Side::Both,
                        "copy",
                        stage::TRANSFER_EXIT,
                        format!("failed: {}", e),
                    ));
                    outcome = Err(e);
                }
            }
        }

        // Commit: the uploaded replica only becomes visible now.
        let mut committed = false;
        if outcome.is_ok() {
            if let Some(staged) = &staged_put {
                params.emit(&TransferEvent::new(
                    Side::Destination,
                    "srm",
                    stage::CLOSE_ENTER,
                    staged.surl.clone(),
                ));
                match self.staging.put_done(staged).await {
                    Ok(()) => {
                        committed = true;
                        params.emit(&TransferEvent::new(
                            Side::Destination,
                            "srm",
                            stage::CLOSE_EXIT,
                            staged.surl.clone(),
                        ));
                    }
                    Err(e) => outcome = Err(e),
                }
            }
        }

        // Destination checksum, after the replica is visible. A mismatch
        // here fails the copy but never deletes the committed file.
        let mut dest_checksum: Option<String> = None;
        if outcome.is_ok() && plan.mode.target() {
            params.emit(&TransferEvent::new(
                Side::Destination,
                "copy",
                stage::CHECKSUM_ENTER,
                plan.algorithm.clone(),
            ));
            match self.backend.checksum(destination, &plan.algorithm).await {
                Ok(sum) if sum.is_empty() => {
                    outcome = Err(TransferError::invalid_argument(format!(
                        "destination {} returned an empty checksum",
                        destination
                    )));
                }
                Ok(sum) => {
                    let expected = match &source_checksum {
                        Some(src) => Some((src.clone(), ChecksumComparison::SourceVsDestination)),
                        None => plan
                            .user_value
                            .clone()
                            .map(|u| (u, ChecksumComparison::UserVsDestination)),
                    };
                    if let Some((expected, comparison)) = expected {
                        if !checksums_equal(&expected, &sum) {
                            outcome = Err(TransferError::ChecksumMismatch {
                                comparison,
                                expected,
                                actual: sum.clone(),
                            });
                        }
                    }
                    dest_checksum = Some(sum);
                }
                Err(e) => outcome = Err(e),
            }
            params.emit(&TransferEvent::new(
                Side::Destination,
                "copy",
                stage::CHECKSUM_EXIT,
                plan.algorithm.clone(),
            ));
        }

        // Cleanup. Rollback of an uncommitted upload, with two guards: a
        // committed replica is kept even when its checksum disagrees, and a
        // destination we refused to overwrite is never deleted.
        if let Err(e) = &outcome {
            error!("[{}] copy failed: {}", transfer_id, e);
            if let Some(staged) = &staged_put {
                if !committed && e.code() != errno::EEXIST {
                    self.staging.abort_put(staged, self.backend.as_ref()).await;
                }
            }
        }
        if let Some(staged) = &staged_get {
            self.staging.release_get(staged).await;
        }

        outcome?;
        let completed_at = Utc::now();
        let duration_seconds =
            (completed_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
        info!(
            "[{}] done: {} bytes in {:.3}s",
            transfer_id, bytes, duration_seconds
        );
        Ok(CopyResult {
            transfer_id: transfer_id.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            bytes_transferred: bytes,
            started_at,
            completed_at,
            duration_seconds,
            destination_checksum: dest_checksum,
        })
    }

    fn checksum_plan(&self, params: &TransferParams) -> ChecksumPlan {
        let mut mode = if params.strict_copy {
            ChecksumMode::None
        } else {
            params.checksum_mode
        };
        if self.config.gridftp.skip_source_checksum {
            mode = mode.without_source();
        }
        ChecksumPlan {
            mode,
            algorithm: params
                .checksum_algorithm
                .clone()
                .unwrap_or_else(|| self.config.srm.default_checksum.clone()),
            user_value: params.checksum_value.clone(),
        }
    }

    /// Existence and parent handling before anything touches the wire.
    async fn prepare_destination(&self, params: &TransferParams, destination: &str) -> Result<()> {
        if self.backend.exists(destination).await? {
            if !params.replace_existing {
                return Err(TransferError::AlreadyExists(destination.to_string()));
            }
            match self.backend.unlink(destination).await {
                Ok(()) => {
                    info!("overwriting {}", destination);
                    params.emit(&TransferEvent::new(
                        Side::Destination,
                        "copy",
                        stage::OVERWRITE_DESTINATION,
                        destination.to_string(),
                    ));
                }
                // Vanished between the check and the unlink; that is fine.
                Err(e) if e.code() == errno::ENOENT => {}
                Err(e) => return Err(e),
            }
        }
        if params.create_parent_dir {
            let parent = uri::parent_of(destination)?;
            self.backend.mkdir_all(&parent).await?;
            params.emit(&TransferEvent::new(
                Side::Destination,
                "copy",
                stage::CREATE_PARENT,
                parent,
            ));
        }
        Ok(())
    }

    /// Server-to-server copy on a pooled session, supervised by the
    /// performance-marker watchdog.
    async fn third_party_copy(
        &self,
        params: &TransferParams,
        source_turl: &str,
        dest_turl: &str,
        expected_size: u64,
        deadline: Instant,
    ) -> Result<u64> {
        let host = uri::hostname_of(source_turl)?;
        let mut session = self.pool.acquire(&host).await?;
        let transport = session.transport();

        let nb_streams = if params.nb_streams > 0 {
            params.nb_streams
        } else {
            self.config.gridftp.nb_streams
        };
        let tcp_buffer = if params.tcp_buffer_size > 0 {
            params.tcp_buffer_size
        } else {
            self.config.gridftp.tcp_buffer_size
        };
        transport.apply_transfer_options(nb_streams, tcp_buffer)?;

        let request = RequestState::new(OpKind::Data).with_transport(Arc::clone(&transport));
        let (perf_tx, perf_rx) = mpsc::unbounded_channel();
        request.start("url_copy")?;
        transport.start_url_copy(source_turl, dest_turl, &request, Some(perf_tx))?;

        let bytes = Arc::new(AtomicU64::new(0));
        let stop = CancellationToken::new();
        let watchdog = tokio::spawn(Self::perf_watchdog(
            perf_rx,
            request.clone(),
            params.clone(),
            Arc::clone(&bytes),
            expected_size,
            Duration::from_secs(self.config.gridftp.perf_marker_timeout_secs),
            stop.clone(),
        ));

        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = tokio::select! {
            result = request.wait(Some(remaining)) => result,
            _ = self.cancel.cancelled() => {
                let _ = request.cancel("transfer context cancelled");
                request.wait(None).await
            }
        };
        stop.cancel();
        let _ = watchdog.await;

        if outcome.is_err() {
            session.disable_reuse();
        }
        outcome?;

        let mut total = bytes.load(Ordering::SeqCst);
        if total == 0 {
            // Not every server emits performance markers; fall back to the
            // size of what actually landed.
            match self.backend.stat(dest_turl).await {
                Ok(stat) => total = stat.size,
                Err(e) => debug!("could not stat {} after copy: {}", dest_turl, e),
            }
        }
        Ok(total)
    }

    /// Forwards performance markers to the listeners and cancels the copy
    /// when no marker shows progress for `timeout`. A marker with nonzero
    /// throughput re-arms the timer; so does one reporting the whole source
    /// already sent, since the last stripes can sit in server buffers.
    async fn perf_watchdog(
        mut perf_rx: mpsc::UnboundedReceiver<RawPerfMarker>,
        request: RequestState,
        params: TransferParams,
        bytes: Arc<AtomicU64>,
        expected_size: u64,
        timeout: Duration,
        stop: CancellationToken,
    ) {
        let started = Instant::now();
        let mut armed_at = Instant::now();
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    // Drain markers that raced with the stop so the final
                    // byte count is accurate.
                    while let Ok(marker) = perf_rx.try_recv() {
                        bytes.store(marker.total_bytes, Ordering::SeqCst);
                    }
                    return;
                }
                marker = perf_rx.recv() => {
                    let Some(marker) = marker else { return };
                    bytes.store(marker.total_bytes, Ordering::SeqCst);
                    params.emit_perf(&PerfMarker {
                        bytes_transferred: marker.total_bytes,
                        instant_throughput: marker.instant_throughput,
                        average_throughput: marker.average_throughput,
                        elapsed: started.elapsed(),
                    });
                    if marker.instant_throughput > 0
                        || (expected_size > 0 && marker.total_bytes >= expected_size)
                    {
                        armed_at = Instant::now();
                    }
                }
                _ = tokio::time::sleep_until(armed_at + timeout), if !timeout.is_zero() => {
                    warn!(
                        "no progress marker for {}s, cancelling transfer",
                        timeout.as_secs()
                    );
                    let _ = request.cancel("performance marker timeout");
                    return;
                }
            }
        }
    }
}
