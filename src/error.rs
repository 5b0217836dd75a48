//! Crate-level error types for consumption, snapshots, and the compacting source.

use crate::compacting::SourceState;
use crate::position::PartitionId;

/// Boxed error carried as the source of collaborator failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A payload could not be decoded by the configured codec.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode payload: {source}")]
pub struct DecodeError {
    #[source]
    source: BoxError,
}

impl DecodeError {
    /// Wrap any error as a decode failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// A value could not be encoded by the configured codec.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode payload: {source}")]
pub struct EncodeError {
    #[source]
    source: BoxError,
}

impl EncodeError {
    /// Wrap any error as an encode failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// A log read or blob I/O failure reported by a transport collaborator.
#[derive(Debug, thiserror::Error)]
#[error("transport failure: {source}")]
pub struct TransportError {
    #[source]
    source: BoxError,
}

impl TransportError {
    /// Wrap any error as a transport failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::new(e)
    }
}

/// A registered consumer callback (or event handler) failed.
#[derive(Debug, thiserror::Error)]
#[error("consumer failed: {source}")]
pub struct ConsumerError {
    #[source]
    source: BoxError,
}

impl ConsumerError {
    /// Wrap any error as a consumer failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Error returned by partition consumption and by
/// [`LogEventSource::consume_all`](crate::LogEventSource::consume_all).
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// The set of open partitions could not be listed.
    #[error("failed to discover partitions of stream '{stream}': {source}")]
    Discovery {
        stream: String,
        #[source]
        source: TransportError,
    },

    /// A record payload failed to decode. No event was delivered for it.
    #[error("partition '{partition}': {source}")]
    Decode {
        partition: PartitionId,
        #[source]
        source: DecodeError,
    },

    /// Reading from the partition failed.
    #[error("partition '{partition}': {source}")]
    Transport {
        partition: PartitionId,
        #[source]
        source: TransportError,
    },

    /// The event handler rejected an event.
    #[error("partition '{partition}': {source}")]
    Consumer {
        partition: PartitionId,
        #[source]
        source: ConsumerError,
    },

    /// The partition task panicked or was cancelled.
    #[error("partition '{partition}': task failed: {message}")]
    TaskFailed {
        partition: PartitionId,
        message: String,
    },
}

impl ConsumeError {
    /// The partition the failure originated from, if any.
    pub fn partition(&self) -> Option<&str> {
        match self {
            Self::Discovery { .. } => None,
            Self::Decode { partition, .. }
            | Self::Transport { partition, .. }
            | Self::Consumer { partition, .. }
            | Self::TaskFailed { partition, .. } => Some(partition),
        }
    }
}

/// Error returned when writing or reading a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Local file I/O failed.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A repository value could not be encoded.
    #[error("failed to encode snapshot entry '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: EncodeError,
    },

    /// The blob store rejected the snapshot upload.
    #[error("failed to upload snapshot '{name}': {source}")]
    Upload {
        name: String,
        #[source]
        source: TransportError,
    },

    /// The snapshot could not be listed or downloaded.
    #[error("failed to download snapshot '{name}': {source}")]
    Download {
        name: String,
        #[source]
        source: TransportError,
    },

    /// An entry of the snapshot is corrupt.
    #[error("corrupt snapshot entry {entry}: {source}")]
    Decode {
        entry: u64,
        #[source]
        source: DecodeError,
    },

    /// The snapshot does not start with a position header.
    #[error("snapshot has no position header")]
    MissingHeader,

    /// Replaying the state entries failed.
    #[error("snapshot replay failed: {0}")]
    Replay(#[from] ConsumeError),
}

/// Error returned by the compacting event source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Restoring from the latest snapshot failed.
    #[error("restore failed: {0}")]
    Restore(#[source] SnapshotError),

    /// A consumption round failed.
    #[error("consumption failed: {0}")]
    Consume(#[from] ConsumeError),

    /// Taking a snapshot failed.
    #[error("snapshot failed: {0}")]
    Snapshot(#[source] SnapshotError),

    /// The operation is not valid in the current lifecycle state.
    #[error("invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: SourceState,
        actual: SourceState,
    },

    /// The live loop has already been started for this source.
    #[error("live loop already started")]
    AlreadyStarted,

    /// The live loop task panicked.
    #[error("live loop task failed: {0}")]
    TaskFailed(String),
}

/// A consumer registration was rejected.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The key pattern is not a valid regular expression.
    #[error("invalid key pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A required collaborator was not supplied to the builder.
#[derive(Debug, thiserror::Error)]
#[error("missing required component: {0}")]
pub struct BuildError(pub &'static str);
