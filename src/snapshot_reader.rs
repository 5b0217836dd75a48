//! Replaying a snapshot object.
//!
//! A snapshot file is read as a log with a single partition: the header line
//! yields the recovered [`OffsetVector`], and every following entry is
//! decoded and delivered through the same [`PartitionConsumer`] used for
//! live records, with the same stop-predicate semantics.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::client::Fetch;
use crate::codec::Codec;
use crate::error::{ConsumeError, DecodeError, SnapshotError, TransportError};
use crate::event::Record;
use crate::partition::{EventHandler, PartitionConsumer, RecordSource};
use crate::position::OffsetVector;
use crate::snapshot::{self, SNAPSHOT_EXTENSION, SnapshotEntry};
use crate::stop::StopPredicate;
use crate::storage::BlobStore;

/// Line reader over the state entries of a snapshot file.
struct SnapshotRecords {
    lines: Lines<BufReader<File>>,
    // Ordinal of the last line read; the header is 0.
    entry: u64,
    failure: Option<SnapshotError>,
}

impl SnapshotRecords {
    async fn open(path: &Path) -> Result<Self, SnapshotError> {
        let file = File::open(path).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            entry: 0,
            failure: None,
        })
    }

    async fn next_entry(&mut self) -> std::io::Result<Option<String>> {
        while let Some(line) = self.lines.next_line().await? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// Read and decode the header line.
    async fn header(&mut self) -> Result<OffsetVector, SnapshotError> {
        let line = self.next_entry().await?.ok_or(SnapshotError::MissingHeader)?;
        let header = SnapshotEntry::parse(&line)
            .map_err(|source| SnapshotError::Decode { entry: 0, source })?;
        if !header.is_header() {
            return Err(SnapshotError::MissingHeader);
        }
        header
            .position()
            .map_err(|source| SnapshotError::Decode { entry: 0, source })
    }

    fn corrupt(&mut self, source: DecodeError) -> TransportError {
        let message = source.to_string();
        self.failure = Some(SnapshotError::Decode {
            entry: self.entry,
            source,
        });
        TransportError::new(message)
    }
}

#[async_trait]
impl RecordSource for SnapshotRecords {
    async fn next_record(&mut self) -> Result<Fetch, TransportError> {
        let Some(line) = self.next_entry().await? else {
            return Ok(Fetch::Closed);
        };
        self.entry += 1;

        let entry = match SnapshotEntry::parse(&line) {
            Ok(entry) => entry,
            Err(e) => return Err(self.corrupt(e)),
        };
        let bytes = match entry.bytes() {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.corrupt(e)),
        };
        Ok(Fetch::Record(Record::new(entry.key, bytes, entry.sequence, 0)))
    }
}

/// Locates, downloads, and replays snapshots of `T` decoded with `C`.
pub struct SnapshotReader<T, C: ?Sized> {
    store: Arc<dyn BlobStore>,
    codec: Arc<C>,
    temp_dir: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Codec<T> + ?Sized> SnapshotReader<T, C> {
    /// Create a reader downloading from `store` into the system temp dir.
    pub fn new(store: Arc<dyn BlobStore>, codec: Arc<C>) -> Self {
        Self {
            store,
            codec,
            temp_dir: std::env::temp_dir(),
            _marker: PhantomData,
        }
    }

    /// Download snapshots into `temp_dir`.
    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    /// Name of the most recent snapshot of `stream`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Download`] if the store cannot be listed.
    pub async fn latest_snapshot(&self, stream: &str) -> Result<Option<String>, SnapshotError> {
        let prefix = snapshot::snapshot_prefix(stream);
        let names = self
            .store
            .list(&prefix)
            .await
            .map_err(|source| SnapshotError::Download {
                name: prefix.clone(),
                source,
            })?;
        Ok(names
            .into_iter()
            .find(|name| snapshot::snapshot_timestamp(stream, name).is_some()))
    }

    /// Download the snapshot `name` into a local temporary file.
    ///
    /// The file is deleted when the returned handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] if the local file cannot be created and
    /// [`SnapshotError::Download`] if the blob cannot be fetched.
    pub async fn download(&self, name: &str) -> Result<NamedTempFile, SnapshotError> {
        let stem = name.strip_suffix(SNAPSHOT_EXTENSION).unwrap_or(name);
        let local = tempfile::Builder::new()
            .prefix(stem)
            .suffix(".download")
            .tempfile_in(&self.temp_dir)?;
        self.store
            .get_file(name, local.path())
            .await
            .map_err(|source| SnapshotError::Download {
                name: name.to_owned(),
                source,
            })?;
        Ok(local)
    }

    /// Replay the snapshot file at `path`, delivering each state entry to
    /// `on_entry` until `stop` fires or the file ends.
    ///
    /// `name_hint` identifies the snapshot in events, logs, and errors.
    ///
    /// # Returns
    ///
    /// The vector stored in the header, regardless of how much of the body
    /// was replayed.
    ///
    /// # Errors
    ///
    /// - [`SnapshotError::MissingHeader`] if the first entry is not a header.
    /// - [`SnapshotError::Decode`] if any entry is corrupt or its value does
    ///   not decode.
    /// - [`SnapshotError::Replay`] if `on_entry` fails.
    /// - [`SnapshotError::Io`] if the file cannot be read.
    pub async fn consume_snapshot(
        &self,
        path: &Path,
        name_hint: &str,
        stop: &StopPredicate<T>,
        on_entry: &EventHandler<T>,
    ) -> Result<OffsetVector, SnapshotError> {
        let mut records = SnapshotRecords::open(path).await?;
        let position = records.header().await?;

        let consumer = PartitionConsumer::new(Arc::clone(&self.codec));
        let replayed = consumer
            .consume(name_hint, &mut records, None, stop, on_entry)
            .await;

        if let Some(failure) = records.failure.take() {
            return Err(failure);
        }
        match replayed {
            Ok(_) => {
                tracing::debug!(
                    snapshot = name_hint,
                    entries = records.entry,
                    partitions = position.len(),
                    "snapshot replayed"
                );
                Ok(position)
            }
            Err(ConsumeError::Decode { source, .. }) => Err(SnapshotError::Decode {
                entry: records.entry,
                source,
            }),
            Err(e) => Err(SnapshotError::Replay(e)),
        }
    }

    /// Download and fully replay the most recent snapshot of `stream`.
    ///
    /// # Returns
    ///
    /// `None` if the stream has no snapshot, otherwise the snapshot name and
    /// the recovered vector.
    ///
    /// # Errors
    ///
    /// Any error of [`latest_snapshot`](Self::latest_snapshot),
    /// [`download`](Self::download), or
    /// [`consume_snapshot`](Self::consume_snapshot).
    pub async fn restore_latest(
        &self,
        stream: &str,
        on_entry: &EventHandler<T>,
    ) -> Result<Option<(String, OffsetVector)>, SnapshotError> {
        let Some(name) = self.latest_snapshot(stream).await? else {
            return Ok(None);
        };
        let local = self.download(&name).await?;
        let position = self
            .consume_snapshot(local.path(), &name, &crate::stop::never(), on_entry)
            .await?;
        if let Err(e) = local.close() {
            tracing::warn!(snapshot = %name, error = %e, "failed to delete downloaded snapshot");
        }
        Ok(Some((name, position)))
    }
}
