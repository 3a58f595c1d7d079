//! SRM asynchronous staging.
//!
//! An SRM storage hands out transfer URLs through an asynchronous request:
//! submit names the SURLs, the server queues the request under a token, and
//! per-file statuses are polled until ready or failed. Uploads stay
//! invisible until committed with put-done; an aborted upload must also be
//! force-unlinked because some storages leave the half-written replica
//! behind.

pub mod client;

use crate::backend::FileBackend;
use crate::config::SrmConfig;
use crate::error::{errno, Result, TransferError};
use crate::uri;
use client::{
    resolve_endpoint, Endpoint, FileStatus, PrepareInput, SrmClient, StagingStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which direction a staging request works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingKind {
    Get,
    Put,
}

/// A SURL staged to a usable transfer URL. Carries the request token needed
/// for commit, release and abort.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub surl: String,
    pub turl: String,
    pub token: String,
    pub endpoint: Endpoint,
}

/// Driver for the staging state machine of one SRM endpoint family.
pub struct SrmStaging {
    client: Arc<dyn SrmClient>,
    config: SrmConfig,
}

/// Whether a URL is an SRM SURL.
pub fn is_srm_url(url: &str) -> bool {
    uri::scheme_of(url) == Some("srm")
}

/// Client-side check that the returned TURL speaks one of the requested
/// protocols. An empty request list means the server chooses freely.
fn validate_turl(turl: &str, protocols: &[String]) -> Result<()> {
    let scheme = match uri::scheme_of(turl) {
        Some(s) if !turl.starts_with('/') => s,
        _ => {
            return Err(TransferError::protocol(
                "prepare",
                errno::EBADMSG,
                format!("'{}' is not a valid transfer URL", turl),
            ))
        }
    };
    if protocols.is_empty() || protocols.iter().any(|p| p == scheme) {
        Ok(())
    } else {
        Err(TransferError::protocol(
            "prepare",
            errno::EBADMSG,
            format!(
                "TURL protocol '{}' is not among the requested protocols",
                scheme
            ),
        ))
    }
}

impl SrmStaging {
    pub fn new(client: Arc<dyn SrmClient>, config: SrmConfig) -> Self {
        SrmStaging { client, config }
    }

    /// Stage a SURL for download. Returns once the replica is pinned and a
    /// TURL is available.
    pub async fn stage_get(
        &self,
        surl: &str,
        protocols: &[String],
        spacetoken: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<StagedFile> {
        self.stage(StagingKind::Get, surl, protocols, spacetoken, 0, cancel)
            .await
    }

    /// Stage a SURL for upload. `file_size` is advisory; 0 means unknown.
    pub async fn stage_put(
        &self,
        surl: &str,
        file_size: u64,
        protocols: &[String],
        spacetoken: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<StagedFile> {
        self.stage(
            StagingKind::Put,
            surl,
            protocols,
            spacetoken,
            file_size,
            cancel,
        )
        .await
    }

    async fn stage(
        &self,
        kind: StagingKind,
        surl: &str,
        protocols: &[String],
        spacetoken: Option<String>,
        file_size: u64,
        cancel: &CancellationToken,
    ) -> Result<StagedFile> {
        let endpoint = resolve_endpoint(surl)?;
        let mut input = PrepareInput::new(surl, &self.config, protocols).with_spacetoken(spacetoken);
        if kind == StagingKind::Put {
            input = input.with_file_size(file_size);
        }

        debug!("submitting {:?} staging request for {}", kind, surl);
        let reply = match kind {
            StagingKind::Get => self.client.prepare_to_get(&endpoint, &input).await?,
            StagingKind::Put => self.client.prepare_to_put(&endpoint, &input).await?,
        };
        let token = reply.token.clone();
        let deadline = Instant::now() + Duration::from_secs(self.config.operation_timeout_secs);
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);
        let surls = vec![surl.to_string()];

        let mut statuses = reply.files;
        loop {
            match Self::inspect(surl, &statuses)? {
                Some(turl) => {
                    validate_turl(&turl, protocols)?;
                    info!("{} staged to {}", surl, turl);
                    return Ok(StagedFile {
                        surl: surl.to_string(),
                        turl,
                        token,
                        endpoint,
                    });
                }
                None => {
                    if Instant::now() >= deadline {
                        self.abort_quietly(&endpoint, &token).await;
                        return Err(TransferError::timeout(format!(
                            "staging of {} still queued after {}s",
                            surl, self.config.operation_timeout_secs
                        )));
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.abort_quietly(&endpoint, &token).await;
                            return Err(TransferError::canceled(format!(
                                "staging of {} cancelled",
                                surl
                            )));
                        }
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    statuses = match kind {
                        StagingKind::Get => {
                            self.client.status_of_get(&endpoint, &token, &surls).await?
                        }
                        StagingKind::Put => {
                            self.client.status_of_put(&endpoint, &token, &surls).await?
                        }
                    };
                }
            }
        }
    }

    /// Look at the per-file statuses: `Some(turl)` when ready, `None` while
    /// pending, error when the server reports a failure.
    fn inspect(surl: &str, statuses: &[FileStatus]) -> Result<Option<String>> {
        let status = statuses.first().ok_or_else(|| {
            TransferError::protocol("prepare", errno::ECOMM, "endpoint returned no file status")
        })?;
        match &status.status {
            StagingStatus::Ready { turl } => Ok(Some(turl.clone())),
            StagingStatus::Pending => Ok(None),
            StagingStatus::Failed { code, explanation } => Err(TransferError::from_code(
                "prepare",
                *code,
                format!("staging of {} failed: {}", surl, explanation),
            )),
        }
    }

    /// Commit an uploaded file so the replica becomes visible.
    pub async fn put_done(&self, staged: &StagedFile) -> Result<()> {
        debug!("committing upload of {}", staged.surl);
        self.client
            .put_done(&staged.endpoint, &staged.token, &[staged.surl.clone()])
            .await
    }

    /// Roll an upload back: abort the staging request, then force-unlink the
    /// destination because some storages keep the half-written replica after
    /// the abort. Never fails; failures are logged so they cannot mask the
    /// error that triggered the rollback.
    pub async fn abort_put(&self, staged: &StagedFile, backend: &dyn FileBackend) {
        self.abort_quietly(&staged.endpoint, &staged.token).await;
        match backend.unlink(&staged.surl).await {
            Ok(()) => debug!("removed aborted upload {}", staged.surl),
            Err(e) if e.code() == errno::ENOENT => {}
            Err(e) => warn!("could not remove aborted upload {}: {}", staged.surl, e),
        }
    }

    /// Release the pin held by a get request. Log-only: a stuck pin expires
    /// on its own and must not fail the transfer.
    pub async fn release_get(&self, staged: &StagedFile) {
        if let Err(e) = self
            .client
            .release_files(&staged.endpoint, &staged.token, &[staged.surl.clone()])
            .await
        {
            warn!("could not release pin on {}: {}", staged.surl, e);
        }
    }

    async fn abort_quietly(&self, endpoint: &Endpoint, token: &str) {
        if let Err(e) = self.client.abort_request(endpoint, token).await {
            warn!("could not abort staging request {}: {}", token, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileReader, FileStat, FileWriter};
    use async_trait::async_trait;
    use client::PrepareReply;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted SRM endpoint: stays Pending for `pending_polls` status
    /// calls, then resolves to `outcome`.
    struct MockSrm {
        pending_polls: usize,
        outcome: StagingStatus,
        polls: AtomicUsize,
        put_dones: AtomicUsize,
        aborts: AtomicUsize,
        releases: AtomicUsize,
        /// Half-written uploads; prepare_to_put adds, abort removes.
        pending_files: Mutex<Vec<String>>,
    }

    impl MockSrm {
        fn ready(turl: &str) -> Self {
            Self::with(0, StagingStatus::Ready { turl: turl.into() })
        }

        fn with(pending_polls: usize, outcome: StagingStatus) -> Self {
            MockSrm {
                pending_polls,
                outcome,
                polls: AtomicUsize::new(0),
                put_dones: AtomicUsize::new(0),
                aborts: AtomicUsize::new(0),
                releases: AtomicUsize::new(0),
                pending_files: Mutex::new(Vec::new()),
            }
        }

        fn status_now(&self, surl: &str, polls_done: usize) -> Vec<FileStatus> {
            let status = if polls_done < self.pending_polls {
                StagingStatus::Pending
            } else {
                self.outcome.clone()
            };
            vec![FileStatus {
                surl: surl.to_string(),
                status,
            }]
        }
    }

    #[async_trait]
    impl SrmClient for MockSrm {
        async fn prepare_to_get(
            &self,
            _endpoint: &Endpoint,
            input: &PrepareInput,
        ) -> Result<PrepareReply> {
            Ok(PrepareReply {
                token: "tok-get-1".into(),
                files: self.status_now(&input.surls[0], 0),
            })
        }

        async fn prepare_to_put(
            &self,
            _endpoint: &Endpoint,
            input: &PrepareInput,
        ) -> Result<PrepareReply> {
            self.pending_files
                .lock()
                .unwrap()
                .push(input.surls[0].clone());
            Ok(PrepareReply {
                token: "tok-put-1".into(),
                files: self.status_now(&input.surls[0], 0),
            })
        }

        async fn status_of_get(
            &self,
            _endpoint: &Endpoint,
            _token: &str,
            surls: &[String],
        ) -> Result<Vec<FileStatus>> {
            let done = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.status_now(&surls[0], done))
        }

        async fn status_of_put(
            &self,
            _endpoint: &Endpoint,
            _token: &str,
            surls: &[String],
        ) -> Result<Vec<FileStatus>> {
            let done = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(self.status_now(&surls[0], done))
        }

        async fn put_done(
            &self,
            _endpoint: &Endpoint,
            _token: &str,
            surls: &[String],
        ) -> Result<()> {
            self.put_dones.fetch_add(1, Ordering::SeqCst);
            self.pending_files.lock().unwrap().retain(|s| s != &surls[0]);
            Ok(())
        }

        async fn abort_request(&self, _endpoint: &Endpoint, _token: &str) -> Result<()> {
            let first = self.aborts.fetch_add(1, Ordering::SeqCst) == 0;
            self.pending_files.lock().unwrap().clear();
            if first {
                Ok(())
            } else {
                // Aborting a gone request is an endpoint error.
                Err(TransferError::protocol(
                    "abort",
                    errno::EINVAL,
                    "unknown request token",
                ))
            }
        }

        async fn release_files(
            &self,
            _endpoint: &Endpoint,
            _token: &str,
            _surls: &[String],
        ) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Backend double that only counts unlinks.
    struct UnlinkSpy {
        unlinks: AtomicUsize,
        missing: bool,
    }

    #[async_trait]
    impl FileBackend for UnlinkSpy {
        async fn stat(&self, url: &str) -> Result<FileStat> {
            Err(TransferError::NotFound(url.to_string()))
        }

        async fn unlink(&self, url: &str) -> Result<()> {
            self.unlinks.fetch_add(1, Ordering::SeqCst);
            if self.missing {
                Err(TransferError::NotFound(url.to_string()))
            } else {
                Ok(())
            }
        }

        async fn mkdir_all(&self, _url: &str) -> Result<()> {
            Ok(())
        }

        async fn open_read(&self, url: &str) -> Result<Box<dyn FileReader>> {
            Err(TransferError::NotFound(url.to_string()))
        }

        async fn open_write(&self, url: &str) -> Result<Box<dyn FileWriter>> {
            Err(TransferError::NotFound(url.to_string()))
        }

        async fn checksum(&self, url: &str, _algorithm: &str) -> Result<String> {
            Err(TransferError::NotFound(url.to_string()))
        }
    }

    fn staging(mock: Arc<MockSrm>) -> SrmStaging {
        let mut config = SrmConfig::default();
        config.poll_interval_secs = 1;
        config.operation_timeout_secs = 10;
        SrmStaging::new(mock, config)
    }

    const SURL: &str = "srm://se.example.org/data/f";

    #[tokio::test]
    async fn test_empty_protocol_list_accepts_server_choice() {
        let mock = Arc::new(MockSrm::ready("gsiftp://pool1.example.org/data/f"));
        let staged = staging(mock.clone())
            .stage_get(SURL, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(staged.turl, "gsiftp://pool1.example.org/data/f");
        assert_eq!(staged.token, "tok-get-1");
        assert_eq!(mock.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_turl_must_match_requested_protocol() {
        let mock = Arc::new(MockSrm::ready("https://pool1.example.org/data/f"));
        let err = staging(mock)
            .stage_get(SURL, &["gsiftp".into()], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), errno::EBADMSG);
    }

    #[tokio::test]
    async fn test_bare_path_turl_rejected() {
        let mock = Arc::new(MockSrm::ready("/pnfs/data/f"));
        let err = staging(mock)
            .stage_get(SURL, &[], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), errno::EBADMSG);
    }

    #[tokio::test]
    async fn test_unsupported_protocol_fails_without_polling() {
        let mock = Arc::new(MockSrm::with(
            0,
            StagingStatus::Failed {
                code: errno::ENOTSUP,
                explanation: "unsupported_protocol".into(),
            },
        ));
        let err = staging(mock.clone())
            .stage_get(SURL, &["badproto".into()], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), errno::ENOTSUP);
        assert_eq!(mock.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_then_ready() {
        let mock = Arc::new(MockSrm::with(
            2,
            StagingStatus::Ready {
                turl: "gsiftp://pool1.example.org/data/f".into(),
            },
        ));
        let staged = staging(mock.clone())
            .stage_get(SURL, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(staged.turl, "gsiftp://pool1.example.org/data/f");
        assert_eq!(mock.polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_bounded_by_timeout() {
        let mock = Arc::new(MockSrm::with(usize::MAX, StagingStatus::Pending));
        let err = staging(mock.clone())
            .stage_get(SURL, &[], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), errno::ETIMEDOUT);
        assert_eq!(mock.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_pending_request() {
        let mock = Arc::new(MockSrm::with(usize::MAX, StagingStatus::Pending));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = staging(mock.clone())
            .stage_get(SURL, &[], None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), errno::ECANCELED);
        assert_eq!(mock.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_put_then_abort_leaves_nothing() {
        let mock = Arc::new(MockSrm::ready("gsiftp://pool1.example.org/data/f"));
        let engine = staging(mock.clone());
        let staged = engine
            .stage_put(SURL, 1024, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(mock.pending_files.lock().unwrap().len(), 1);

        let spy = UnlinkSpy {
            unlinks: AtomicUsize::new(0),
            missing: false,
        };
        engine.abort_put(&staged, &spy).await;
        assert!(mock.pending_files.lock().unwrap().is_empty());
        assert_eq!(spy.unlinks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abort_put_is_idempotent_and_quiet() {
        let mock = Arc::new(MockSrm::ready("gsiftp://pool1.example.org/data/f"));
        let engine = staging(mock.clone());
        let staged = engine
            .stage_put(SURL, 0, &[], None, &CancellationToken::new())
            .await
            .unwrap();

        // The file is already gone; unlink reports ENOENT and the second
        // abort hits an unknown token. Neither surfaces.
        let spy = UnlinkSpy {
            unlinks: AtomicUsize::new(0),
            missing: true,
        };
        engine.abort_put(&staged, &spy).await;
        engine.abort_put(&staged, &spy).await;
        assert_eq!(mock.aborts.load(Ordering::SeqCst), 2);
        assert_eq!(spy.unlinks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_put_done_commits() {
        let mock = Arc::new(MockSrm::ready("gsiftp://pool1.example.org/data/f"));
        let engine = staging(mock.clone());
        let staged = engine
            .stage_put(SURL, 0, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        engine.put_done(&staged).await.unwrap();
        assert_eq!(mock.put_dones.load(Ordering::SeqCst), 1);
        assert!(mock.pending_files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_get_counts() {
        let mock = Arc::new(MockSrm::ready("gsiftp://pool1.example.org/data/f"));
        let engine = staging(mock.clone());
        let staged = engine
            .stage_get(SURL, &[], None, &CancellationToken::new())
            .await
            .unwrap();
        engine.release_get(&staged).await;
        assert_eq!(mock.releases.load(Ordering::SeqCst), 1);
    }
}
