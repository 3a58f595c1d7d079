//! Configuration type definitions.

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// GridFTP session and transfer settings.
    #[serde(default)]
    pub gridftp: GridFtpConfig,

    /// SRM staging settings.
    #[serde(default)]
    pub srm: SrmConfig,

    /// Copy orchestration settings.
    #[serde(default)]
    pub copy: CopyConfig,
}

/// GridFTP session and transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridFtpConfig {
    /// Reuse control sessions across operations (default: true).
    #[serde(default = "default_true")]
    pub session_reuse: bool,

    /// Maximum number of idle sessions kept in the pool (default: 400).
    #[serde(default = "default_session_cache")]
    pub max_cached_sessions: usize,

    /// Per-operation timeout in seconds (default: 300).
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Cancel a third-party copy if no performance marker shows progress
    /// within this many seconds; 0 disables the watchdog (default: 180).
    #[serde(default = "default_perf_timeout")]
    pub perf_marker_timeout_secs: u64,

    /// Number of parallel data streams; 0 lets the server decide.
    #[serde(default)]
    pub nb_streams: u32,

    /// TCP buffer size in bytes; 0 keeps the system default.
    #[serde(default)]
    pub tcp_buffer_size: u64,

    /// Enable IPv6 on new sessions (default: false).
    #[serde(default)]
    pub ipv6: bool,

    /// Enable data-channel authentication (default: false).
    #[serde(default)]
    pub dcau: bool,

    /// Use delayed passive mode (default: true).
    #[serde(default = "default_true")]
    pub delayed_passive: bool,

    /// Speak GridFTP v2 where the server supports it (default: true).
    #[serde(default = "default_true")]
    pub gridftp_v2: bool,

    /// Never compute the source checksum even when the caller asks for it.
    /// Some tape frontends stage the whole file just to checksum it.
    #[serde(default)]
    pub skip_source_checksum: bool,
}

impl Default for GridFtpConfig {
    fn default() -> Self {
        GridFtpConfig {
            session_reuse: default_true(),
            max_cached_sessions: default_session_cache(),
            operation_timeout_secs: default_operation_timeout(),
            perf_marker_timeout_secs: default_perf_timeout(),
            nb_streams: 0,
            tcp_buffer_size: 0,
            ipv6: false,
            dcau: false,
            delayed_passive: default_true(),
            gridftp_v2: default_true(),
            skip_source_checksum: false,
        }
    }
}

/// SRM staging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrmConfig {
    /// Overall timeout for one staging request in seconds (default: 180).
    #[serde(default = "default_srm_timeout")]
    pub operation_timeout_secs: u64,

    /// Delay between status polls in seconds (default: 5).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Pin lifetime requested for staged replicas, in seconds (default: 1800).
    #[serde(default = "default_pin_time")]
    pub desired_pin_time_secs: u32,

    /// Transfer protocols offered to the endpoint, in preference order.
    #[serde(default = "default_protocols")]
    pub transfer_protocols: Vec<String>,

    /// Checksum algorithm used when the caller enables verification without
    /// naming one (default: "adler32").
    #[serde(default = "default_checksum_algorithm")]
    pub default_checksum: String,

    /// Treat a source without a stored checksum as valid instead of failing.
    #[serde(default)]
    pub allow_empty_source_checksum: bool,
}

impl Default for SrmConfig {
    fn default() -> Self {
        SrmConfig {
            operation_timeout_secs: default_srm_timeout(),
            poll_interval_secs: default_poll_interval(),
            desired_pin_time_secs: default_pin_time(),
            transfer_protocols: default_protocols(),
            default_checksum: default_checksum_algorithm(),
            allow_empty_source_checksum: false,
        }
    }
}

/// Copy orchestration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyConfig {
    /// Chunk size for streamed copies in bytes (default: 4 MiB).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Seconds between performance samples on streamed copies (default: 5).
    #[serde(default = "default_perf_interval")]
    pub perf_interval_secs: u64,

    /// Default whole-transfer timeout in seconds when the caller does not
    /// set one (default: 3600).
    #[serde(default = "default_copy_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for CopyConfig {
    fn default() -> Self {
        CopyConfig {
            buffer_size: default_buffer_size(),
            perf_interval_secs: default_perf_interval(),
            default_timeout_secs: default_copy_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_session_cache() -> usize {
    400
}

fn default_operation_timeout() -> u64 {
    300
}

fn default_perf_timeout() -> u64 {
    180
}

fn default_srm_timeout() -> u64 {
    180
}

fn default_poll_interval() -> u64 {
    5
}

fn default_pin_time() -> u32 {
    1800
}

fn default_protocols() -> Vec<String> {
    vec!["gsiftp".to_string()]
}

fn default_checksum_algorithm() -> String {
    "adler32".to_string()
}

fn default_buffer_size() -> usize {
    4 * 1024 * 1024
}

fn default_perf_interval() -> u64 {
    5
}

fn default_copy_timeout() -> u64 {
    3600
}
