//! Configuration validation.

use super::Config;
use crate::error::{Result, TransferError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.gridftp.max_cached_sessions == 0 {
        return Err(TransferError::config(
            "gridftp.max_cached_sessions must be at least 1",
        ));
    }
    if config.gridftp.operation_timeout_secs == 0 {
        return Err(TransferError::config(
            "gridftp.operation_timeout_secs must be at least 1",
        ));
    }

    if config.srm.poll_interval_secs == 0 {
        return Err(TransferError::config(
            "srm.poll_interval_secs must be at least 1",
        ));
    }
    if config.srm.operation_timeout_secs == 0 {
        return Err(TransferError::config(
            "srm.operation_timeout_secs must be at least 1",
        ));
    }
    for protocol in &config.srm.transfer_protocols {
        if protocol.is_empty() {
            return Err(TransferError::config(
                "srm.transfer_protocols must not contain empty entries",
            ));
        }
    }
    if config.srm.default_checksum.is_empty() {
        return Err(TransferError::config("srm.default_checksum is required"));
    }

    if config.copy.buffer_size == 0 {
        return Err(TransferError::config("copy.buffer_size must be at least 1"));
    }
    if config.copy.default_timeout_secs == 0 {
        return Err(TransferError::config(
            "copy.default_timeout_secs must be at least 1",
        ));
    }

    Ok(())
}
