//! Error types for the transfer engine

use thiserror::Error;

/// POSIX-style error codes carried by engine errors. The native protocol
/// libraries report failures as free-form strings; the engine normalizes
/// them to these codes so callers can branch on the class of failure.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EACCES: i32 = 13;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EINVAL: i32 = 22;
    pub const ECOMM: i32 = 70;
    pub const EBADMSG: i32 = 74;
    pub const EPROTONOSUPPORT: i32 = 93;
    pub const ENOTSUP: i32 = 95;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECANCELED: i32 = 125;
}

/// Which comparison failed when checksums disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumComparison {
    /// User-supplied value vs. the checksum computed on the source
    UserVsSource,
    /// Checksum computed on the source vs. the one computed on the destination
    SourceVsDestination,
    /// User-supplied value vs. the checksum computed on the destination
    UserVsDestination,
}

impl std::fmt::Display for ChecksumComparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumComparison::UserVsSource => write!(f, "user-defined vs source"),
            ChecksumComparison::SourceVsDestination => write!(f, "source vs destination"),
            ChecksumComparison::UserVsDestination => write!(f, "user-defined vs destination"),
        }
    }
}

/// Main error type for transfer operations
#[derive(Error, Debug)]
pub enum TransferError {
    /// Failed to establish a control connection to a storage host
    #[error("Connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    /// A protocol operation failed; `code` is the normalized errno
    #[error("{operation} failed (errno {code}): {message}")]
    Protocol {
        operation: String,
        code: i32,
        message: String,
    },

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Operation was cancelled, either explicitly or through the context
    #[error("Operation cancelled: {0}")]
    Canceled(String),

    /// Checksums disagree after normalization
    #[error("Checksum mismatch ({comparison}): '{expected}' != '{actual}'")]
    ChecksumMismatch {
        comparison: ChecksumComparison,
        expected: String,
        actual: String,
    },

    /// Destination already exists and overwriting was not requested
    #[error("Destination already exists: {0}")]
    AlreadyExists(String),

    /// The named file or directory does not exist
    #[error("No such file or directory: {0}")]
    NotFound(String),

    /// The endpoint speaks a protocol version the engine does not support
    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Caller passed an argument the engine cannot act on
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration file is missing, unreadable or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration deserialization failure
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl TransferError {
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn protocol(operation: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        TransferError::Protocol {
            operation: operation.into(),
            code,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        TransferError::Timeout(message.into())
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        TransferError::Canceled(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        TransferError::InvalidArgument(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        TransferError::Config(message.into())
    }

    /// The POSIX-style code for this error.
    pub fn code(&self) -> i32 {
        match self {
            TransferError::Connection { .. } => errno::ECOMM,
            TransferError::Protocol { code, .. } => *code,
            TransferError::Timeout(_) => errno::ETIMEDOUT,
            TransferError::Canceled(_) => errno::ECANCELED,
            TransferError::ChecksumMismatch { .. } => errno::EIO,
            TransferError::AlreadyExists(_) => errno::EEXIST,
            TransferError::NotFound(_) => errno::ENOENT,
            TransferError::UnsupportedProtocol(_) => errno::EPROTONOSUPPORT,
            TransferError::InvalidArgument(_) => errno::EINVAL,
            TransferError::Config(_) => errno::EINVAL,
            TransferError::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
            TransferError::Yaml(_) => errno::EINVAL,
        }
    }

    /// Rebuild an error from a stored (code, message) pair. Request state
    /// keeps failures in this form so the error can be reported more than
    /// once (cancel is idempotent and every waiter sees the same outcome).
    pub fn from_code(operation: &str, code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            errno::ETIMEDOUT => TransferError::Timeout(message),
            errno::ECANCELED => TransferError::Canceled(message),
            errno::ENOENT => TransferError::NotFound(message),
            errno::EEXIST => TransferError::AlreadyExists(message),
            errno::EPROTONOSUPPORT => TransferError::UnsupportedProtocol(message),
            _ => TransferError::protocol(operation, code, message),
        }
    }
}

/// Map a protocol library error string to an errno-style code. The native
/// libraries report everything as text, so classification is by substring.
///
/// This is for [`FtpTransport`](crate::session::transport::FtpTransport)
/// and [`SrmClient`](crate::srm::client::SrmClient) implementations: feed
/// the native error string through here to pick the code passed to
/// [`CompletionHandle::complete_err`](crate::request::CompletionHandle::complete_err)
/// or carried in a failed staging status.
pub fn errno_from_message(message: &str) -> i32 {
    const PATTERNS: &[(&str, i32)] = &[
        ("No such file", errno::ENOENT),
        ("not found", errno::ENOENT),
        ("does not exist", errno::ENOENT),
        ("Permission denied", errno::EACCES),
        ("permission denied", errno::EACCES),
        ("exists", errno::EEXIST),
        ("Not a directory", errno::ENOTDIR),
        ("not a directory", errno::ENOTDIR),
        ("not supported", errno::ENOTSUP),
        ("aborted", errno::ECANCELED),
        ("cancelled", errno::ECANCELED),
    ];
    for (pattern, code) in PATTERNS {
        if message.contains(pattern) {
            return *code;
        }
    }
    errno::ECOMM
}

/// Convenience type alias for Results with TransferError
pub type Result<T> = std::result::Result<T, TransferError>;
