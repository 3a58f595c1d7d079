//! # grid-transfer
//!
//! Asynchronous transfer engine for grid storage protocols.
//!
//! This library provides the machinery behind wide-area file copies between
//! grid storage elements, with support for:
//!
//! - **Session pooling** of GridFTP control connections, keyed by host
//! - **Asynchronous request lifecycle** with deadlines and cancellation
//! - **SRM staging** (SURL to TURL resolution, commit and rollback)
//! - **Third-party copies** supervised by a performance-marker watchdog,
//!   with a streamed fallback when no server-to-server path exists
//! - **Checksum verification** on either or both endpoints
//!
//! The wire protocols themselves live behind the [`FtpTransport`],
//! [`SrmClient`] and [`FileBackend`] seams.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grid_transfer::{ChecksumMode, Config, TransferParams};
//!
//! fn main() -> grid_transfer::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let params = TransferParams::new()
//!         .with_checksum(ChecksumMode::Both, Some("adler32".into()), None)
//!         .with_replace_existing(true)
//!         .with_timeout(std::time::Duration::from_secs(config.copy.default_timeout_secs));
//!     let _ = params;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod checksum;
pub mod config;
pub mod copy;
pub mod error;
pub mod events;
pub mod io;
pub mod params;
pub mod request;
pub mod session;
pub mod srm;
pub mod uri;

// Re-exports for convenient access
pub use backend::{FileBackend, FileReader, FileStat, FileWriter, LocalFile};
pub use checksum::checksums_equal;
pub use config::{Config, CopyConfig, GridFtpConfig, SrmConfig};
pub use copy::{CopyOrchestrator, CopyResult};
pub use error::{ChecksumComparison, Result, TransferError};
pub use events::{PerfMarker, Side, TransferEvent, TransferListener};
pub use io::{DirReader, GridStream};
pub use params::{ChecksumMode, TransferParams};
pub use request::{CompletionHandle, OpKind, RequestState, RequestStatus, StreamState};
pub use session::transport::{FtpTransport, PerfSender, RawPerfMarker, TransportFactory};
pub use session::{PooledSession, Session, SessionOptions, SessionPool};
pub use srm::client::SrmClient;
pub use srm::{SrmStaging, StagedFile};
