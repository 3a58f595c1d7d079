//! Transfer lifecycle events and performance markers.
//!
//! The orchestrator reports phase boundaries (prepare, transfer, checksum,
//! close) and periodic throughput samples to registered listeners. Listener
//! callbacks run inline on the transfer task, so implementations should be
//! quick and must not block.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Which endpoint of the transfer an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Destination,
    /// Event applies to the transfer as a whole
    Both,
}

/// Stage names reported through [`TransferEvent::stage`].
pub mod stage {
    pub const PREPARE_ENTER: &str = "PREPARE:ENTER";
    pub const PREPARE_EXIT: &str = "PREPARE:EXIT";
    pub const TRANSFER_ENTER: &str = "TRANSFER:ENTER";
    pub const TRANSFER_EXIT: &str = "TRANSFER:EXIT";
    pub const CHECKSUM_ENTER: &str = "CHECKSUM:ENTER";
    pub const CHECKSUM_EXIT: &str = "CHECKSUM:EXIT";
    pub const CLOSE_ENTER: &str = "CLOSE:ENTER";
    pub const CLOSE_EXIT: &str = "CLOSE:EXIT";
    pub const OVERWRITE_DESTINATION: &str = "OVERWRITE";
    pub const CREATE_PARENT: &str = "CREATE_PARENT";
}

/// A lifecycle event emitted during a copy.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub timestamp: DateTime<Utc>,
    pub side: Side,
    /// Subsystem that produced the event ("gridftp", "srm", "local")
    pub domain: &'static str,
    pub stage: &'static str,
    pub description: String,
}

impl TransferEvent {
    pub fn new(side: Side, domain: &'static str, stage: &'static str, description: impl Into<String>) -> Self {
        TransferEvent {
            timestamp: Utc::now(),
            side,
            domain,
            stage,
            description: description.into(),
        }
    }
}

/// A periodic throughput sample for an in-flight transfer.
#[derive(Debug, Clone, Copy)]
pub struct PerfMarker {
    /// Bytes moved so far
    pub bytes_transferred: u64,
    /// Instantaneous throughput in bytes per second
    pub instant_throughput: u64,
    /// Average throughput since the transfer started, bytes per second
    pub average_throughput: u64,
    /// Time since the transfer started
    pub elapsed: Duration,
}

/// Receiver for transfer events and performance markers.
pub trait TransferListener: Send + Sync {
    fn on_event(&self, _event: &TransferEvent) {}
    fn on_performance(&self, _marker: &PerfMarker) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        events: AtomicUsize,
    }

    impl TransferListener for Counter {
        fn on_event(&self, _event: &TransferEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listener_receives_events() {
        let counter = Counter {
            events: AtomicUsize::new(0),
        };
        let event = TransferEvent::new(Side::Both, "gridftp", stage::TRANSFER_ENTER, "start");
        counter.on_event(&event);
        counter.on_event(&event);
        assert_eq!(counter.events.load(Ordering::SeqCst), 2);
    }
}
