//! Per-transfer parameters.
//!
//! A `TransferParams` value is a snapshot: the orchestrator reads it at the
//! start of a copy and never observes later mutation. Sub-transfers (the
//! TURL-to-TURL leg of an SRM copy) run on a derived copy, never the
//! caller's original.

use crate::config::Config;
use crate::events::{PerfMarker, TransferEvent, TransferListener};
use std::sync::Arc;
use std::time::Duration;

/// Which sides of a transfer get checksum-verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    #[default]
    None,
    /// Verify the source against the user-supplied value before transferring
    Source,
    /// Verify the destination after transferring
    Target,
    /// Verify the source first, then compare source and destination
    Both,
}

impl ChecksumMode {
    pub fn source(&self) -> bool {
        matches!(self, ChecksumMode::Source | ChecksumMode::Both)
    }

    pub fn target(&self) -> bool {
        matches!(self, ChecksumMode::Target | ChecksumMode::Both)
    }

    /// The same mode with the source side cleared.
    pub fn without_source(self) -> Self {
        match self {
            ChecksumMode::Source => ChecksumMode::None,
            ChecksumMode::Both => ChecksumMode::Target,
            other => other,
        }
    }
}

/// Parameters for a single copy operation.
#[derive(Clone, Default)]
pub struct TransferParams {
    /// Whole-transfer timeout; `None` falls back to `copy.default_timeout_secs`.
    pub timeout: Option<Duration>,

    /// Parallel data streams for third-party copies; 0 uses the configured value.
    pub nb_streams: u32,

    /// TCP buffer size for third-party copies; 0 uses the configured value.
    pub tcp_buffer_size: u64,

    /// Which sides to checksum.
    pub checksum_mode: ChecksumMode,

    /// Checksum algorithm; `None` uses `srm.default_checksum`.
    pub checksum_algorithm: Option<String>,

    /// User-supplied expected checksum value.
    pub checksum_value: Option<String>,

    /// Delete an existing destination instead of failing with EEXIST.
    pub replace_existing: bool,

    /// Create the destination's parent directory if missing.
    pub create_parent_dir: bool,

    /// Skip all prechecks and validation; just move bytes.
    pub strict_copy: bool,

    /// Space token for source staging.
    pub source_spacetoken: Option<String>,

    /// Space token for destination staging.
    pub dest_spacetoken: Option<String>,

    listeners: Vec<Arc<dyn TransferListener>>,
}

impl TransferParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_checksum(
        mut self,
        mode: ChecksumMode,
        algorithm: Option<String>,
        value: Option<String>,
    ) -> Self {
        self.checksum_mode = mode;
        self.checksum_algorithm = algorithm;
        self.checksum_value = value;
        self
    }

    pub fn with_replace_existing(mut self, replace: bool) -> Self {
        self.replace_existing = replace;
        self
    }

    pub fn with_create_parent_dir(mut self, create: bool) -> Self {
        self.create_parent_dir = create;
        self
    }

    pub fn with_strict_copy(mut self, strict: bool) -> Self {
        self.strict_copy = strict;
        self
    }

    pub fn with_streams(mut self, nb_streams: u32) -> Self {
        self.nb_streams = nb_streams;
        self
    }

    pub fn with_tcp_buffer_size(mut self, size: u64) -> Self {
        self.tcp_buffer_size = size;
        self
    }

    pub fn with_source_spacetoken(mut self, token: impl Into<String>) -> Self {
        self.source_spacetoken = Some(token.into());
        self
    }

    pub fn with_dest_spacetoken(mut self, token: impl Into<String>) -> Self {
        self.dest_spacetoken = Some(token.into());
        self
    }

    /// Register a listener for events and performance markers.
    pub fn with_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Effective whole-transfer timeout.
    pub fn effective_timeout(&self, config: &Config) -> Duration {
        self.timeout
            .unwrap_or(Duration::from_secs(config.copy.default_timeout_secs))
    }

    /// Parameters for the TURL-to-TURL leg of an SRM copy. Checksums and
    /// prechecks already happened (or will happen) at the SURL level, so the
    /// inner transfer runs strict with no verification and no overwrite.
    pub fn for_turl_transfer(&self) -> TransferParams {
        let mut inner = self.clone();
        inner.checksum_mode = ChecksumMode::None;
        inner.checksum_value = None;
        inner.replace_existing = false;
        inner.create_parent_dir = false;
        inner.strict_copy = true;
        inner
    }

    /// Fan an event out to every listener.
    pub fn emit(&self, event: &TransferEvent) {
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    /// Fan a performance marker out to every listener.
    pub fn emit_perf(&self, marker: &PerfMarker) {
        for listener in &self.listeners {
            listener.on_performance(marker);
        }
    }
}

impl std::fmt::Debug for TransferParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferParams")
            .field("timeout", &self.timeout)
            .field("nb_streams", &self.nb_streams)
            .field("checksum_mode", &self.checksum_mode)
            .field("checksum_algorithm", &self.checksum_algorithm)
            .field("replace_existing", &self.replace_existing)
            .field("create_parent_dir", &self.create_parent_dir)
            .field("strict_copy", &self.strict_copy)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mode_bits() {
        assert!(ChecksumMode::Both.source());
        assert!(ChecksumMode::Both.target());
        assert!(ChecksumMode::Source.source());
        assert!(!ChecksumMode::Source.target());
        assert!(!ChecksumMode::None.source());
    }

    #[test]
    fn test_without_source() {
        assert_eq!(ChecksumMode::Both.without_source(), ChecksumMode::Target);
        assert_eq!(ChecksumMode::Source.without_source(), ChecksumMode::None);
        assert_eq!(ChecksumMode::Target.without_source(), ChecksumMode::Target);
    }

    #[test]
    fn test_for_turl_transfer() {
        let params = TransferParams::new()
            .with_checksum(ChecksumMode::Both, Some("adler32".into()), None)
            .with_replace_existing(true)
            .with_streams(4);
        let inner = params.for_turl_transfer();
        assert_eq!(inner.checksum_mode, ChecksumMode::None);
        assert!(!inner.replace_existing);
        assert!(inner.strict_copy);
        // transport tuning carries over to the inner transfer
        assert_eq!(inner.nb_streams, 4);
    }
}
