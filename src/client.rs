//! Capability contract for the transport that physically reads the log.
//!
//! The core never talks to a concrete log service. It only needs to list the
//! open partitions of a stream and to read the record following a position.
//! Polling, retries and backoff stay inside the implementation.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::event::Record;
use crate::position::{PartitionId, SequenceToken};

/// Outcome of a single read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    /// The next record after the requested position.
    Record(Record),
    /// No record is available yet; the reader is caught up with the head.
    Idle,
    /// The partition has been closed (split or merged) and is fully drained.
    Closed,
}

/// Read access to a partitioned, append-only log.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// List the partitions of `stream` that are still open for reading.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the log cannot be queried.
    async fn list_open_partitions(&self, stream: &str) -> Result<Vec<PartitionId>, TransportError>;

    /// Read the record following `after` in `partition` (the first record of
    /// the partition when `after` is `None`).
    ///
    /// Implementations may block for up to `timeout` waiting for a record to
    /// arrive before returning [`Fetch::Idle`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the read fails.
    async fn read_from(
        &self,
        stream: &str,
        partition: &str,
        after: Option<&SequenceToken>,
        timeout: Duration,
    ) -> Result<Fetch, TransportError>;
}
