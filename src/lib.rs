//! Partitioned event-log consumption with snapshot compaction.
//!
//! A [`LogEventSource`] reads every open partition of a stream in parallel
//! and merges the per-partition progress into an [`OffsetVector`]. A
//! [`CompactingEventSource`] folds those events into a key/value
//! [`StateRepository`], periodically freezes repository and position into a
//! snapshot in a [`BlobStore`], and on startup restores from the most recent
//! snapshot before resuming the log where the snapshot left off.

mod client;
mod codec;
mod compacting;
mod error;
mod event;
mod live;
mod memory;
mod partition;
mod position;
mod projection;
mod registry;
pub mod snapshot;
mod snapshot_reader;
mod snapshot_writer;
mod source;
pub mod stop;
mod storage;

pub use client::{Fetch, LogClient};
pub use codec::{Codec, Decrypting, FnCodec, JsonCodec, NoOpDecryptor, RawCodec, TextDecryptor, Utf8Codec};
pub use compacting::{
    CompactingEventSource, CompactingEventSourceBuilder, RestoreFailurePolicy, SourceState,
};
pub use error::{
    BoxError, BuildError, ConsumeError, ConsumerError, DecodeError, EncodeError, RegistryError,
    SnapshotError, SourceError, TransportError,
};
pub use event::{Event, Record};
pub use live::{LiveConfig, LiveHandle};
pub use memory::InMemoryLog;
pub use partition::{
    ConsumerFailurePolicy, EventHandler, LogPartitionCursor, PartitionConsumer, RecordSource,
    handler,
};
pub use position::{OffsetVector, PartitionId, SequenceToken};
pub use projection::{InMemoryStateRepository, StateRepository};
pub use registry::{ConsumerCallback, ConsumerRegistry, MATCH_ALL};
pub use snapshot::SnapshotEntry;
pub use snapshot_reader::SnapshotReader;
pub use snapshot_writer::{LocalSnapshot, SnapshotConfig, SnapshotWriter};
pub use source::{DEFAULT_POLL_TIMEOUT, LogEventSource};
pub use stop::StopPredicate;
pub use storage::{BlobStore, FilesystemBlobStore, InMemoryBlobStore};
