//! SRM client seam and wire types.
//!
//! The engine drives an SRM endpoint through this trait; the SOAP plumbing
//! lives behind it. Requests are asynchronous on the server side: prepare
//! calls return a request token, and per-file statuses are polled until
//! every file is ready or failed.

use crate::config::SrmConfig;
use crate::error::{Result, TransferError};
use crate::uri::StorageUrl;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// SRM protocol versions the engine knows about. Version 1 endpoints are
/// rejected with `EPROTONOSUPPORT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrmVersion {
    V1,
    V2,
}

/// A resolved SRM service endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    /// Full service URL, e.g. `httpg://se.example.org:8446/srm/managerv2`
    pub service_url: String,
    pub version: SrmVersion,
}

/// Default SRM service port when the SURL does not name one.
const DEFAULT_SRM_PORT: u16 = 8446;
const SERVICE_PATH_V1: &str = "/srm/managerv1";
const SERVICE_PATH_V2: &str = "/srm/managerv2";

/// Resolve the service endpoint for a SURL. A SURL may spell the service
/// path out (`srm://host:port/srm/managerv2?SFN=/path`) or leave it to the
/// default v2 path.
pub fn resolve_endpoint(surl: &str) -> Result<Endpoint> {
    let parsed = StorageUrl::parse(surl)?;
    if parsed.scheme != "srm" {
        return Err(TransferError::invalid_argument(format!(
            "not an SRM URL: '{}'",
            surl
        )));
    }
    let port = parsed.port.unwrap_or(DEFAULT_SRM_PORT);
    let (path, version) = if parsed.path.starts_with(SERVICE_PATH_V1) {
        (SERVICE_PATH_V1, SrmVersion::V1)
    } else {
        (SERVICE_PATH_V2, SrmVersion::V2)
    };
    if version == SrmVersion::V1 {
        return Err(TransferError::UnsupportedProtocol(format!(
            "endpoint '{}' only speaks SRM v1",
            parsed.host
        )));
    }
    Ok(Endpoint {
        service_url: format!("httpg://{}:{}{}", parsed.host, port, path),
        host: parsed.host,
        version,
    })
}

/// State of one file inside a staging request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagingStatus {
    /// Queued or in progress on the server
    Pending,
    /// Staged; the transfer URL is usable
    Ready { turl: String },
    /// Failed; `code` is errno-style
    Failed { code: i32, explanation: String },
}

/// Per-file status returned by prepare and status calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStatus {
    pub surl: String,
    pub status: StagingStatus,
}

/// Reply to a prepare-to-get/put call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareReply {
    /// Request token used for later polls, commit and abort
    pub token: String,
    pub files: Vec<FileStatus>,
}

/// Input to a prepare-to-get/put call.
#[derive(Debug, Clone, Default)]
pub struct PrepareInput {
    pub surls: Vec<String>,
    /// Transfer protocols in preference order; empty lets the server choose
    pub protocols: Vec<String>,
    pub spacetoken: Option<String>,
    /// Requested pin lifetime for the staged replica, seconds
    pub desired_pin_secs: u32,
    /// Expected file sizes, one per SURL; 0 when unknown (put only)
    pub file_sizes: Vec<u64>,
}

impl PrepareInput {
    pub fn new(surl: &str, config: &SrmConfig, protocols: &[String]) -> Self {
        PrepareInput {
            surls: vec![surl.to_string()],
            protocols: protocols.to_vec(),
            spacetoken: None,
            desired_pin_secs: config.desired_pin_time_secs,
            file_sizes: Vec::new(),
        }
    }

    pub fn with_spacetoken(mut self, token: Option<String>) -> Self {
        self.spacetoken = token;
        self
    }

    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_sizes = vec![size];
        self
    }
}

/// SRM endpoint operations, as driven by the staging state machine.
#[async_trait]
pub trait SrmClient: Send + Sync {
    async fn prepare_to_get(&self, endpoint: &Endpoint, input: &PrepareInput)
        -> Result<PrepareReply>;

    async fn prepare_to_put(&self, endpoint: &Endpoint, input: &PrepareInput)
        -> Result<PrepareReply>;

    async fn status_of_get(
        &self,
        endpoint: &Endpoint,
        token: &str,
        surls: &[String],
    ) -> Result<Vec<FileStatus>>;

    async fn status_of_put(
        &self,
        endpoint: &Endpoint,
        token: &str,
        surls: &[String],
    ) -> Result<Vec<FileStatus>>;

    /// Commit an uploaded file; the replica only becomes visible after this.
    async fn put_done(&self, endpoint: &Endpoint, token: &str, surls: &[String]) -> Result<()>;

    /// Abort the whole staging request.
    async fn abort_request(&self, endpoint: &Endpoint, token: &str) -> Result<()>;

    /// Release the pins held by a get request.
    async fn release_files(&self, endpoint: &Endpoint, token: &str, surls: &[String])
        -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno;

    #[test]
    fn test_resolve_endpoint_defaults() {
        let ep = resolve_endpoint("srm://se.example.org/data/f").unwrap();
        assert_eq!(ep.host, "se.example.org");
        assert_eq!(ep.service_url, "httpg://se.example.org:8446/srm/managerv2");
        assert_eq!(ep.version, SrmVersion::V2);
    }

    #[test]
    fn test_resolve_endpoint_explicit() {
        let ep = resolve_endpoint("srm://se.example.org:8444/srm/managerv2?SFN=/data/f").unwrap();
        assert_eq!(ep.service_url, "httpg://se.example.org:8444/srm/managerv2");
    }

    #[test]
    fn test_resolve_endpoint_v1_rejected() {
        let err = resolve_endpoint("srm://old.example.org/srm/managerv1?SFN=/f").unwrap_err();
        assert_eq!(err.code(), errno::EPROTONOSUPPORT);
    }

    #[test]
    fn test_resolve_endpoint_wrong_scheme() {
        assert!(resolve_endpoint("gsiftp://host/f").is_err());
    }
}
