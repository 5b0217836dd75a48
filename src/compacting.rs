//! Restore-then-resume orchestration of one stream.
//!
//! A [`CompactingEventSource`] owns the state repository of a stream and
//! moves through three states:
//!
//! ```text
//! Cold --restore()--> Restoring --> Live
//! ```
//!
//! `restore` rebuilds the repository from the most recent snapshot (or
//! starts empty when there is none). In `Live`, [`consume`] runs a
//! consumption round over every open partition from the last known position,
//! applying each event to the repository and dispatching it to the
//! registered consumers, and [`take_snapshot`] freezes repository and
//! position into a new snapshot. [`start_live`] runs both in a background
//! loop.
//!
//! [`consume`]: CompactingEventSource::consume
//! [`take_snapshot`]: CompactingEventSource::take_snapshot
//! [`start_live`]: CompactingEventSource::start_live

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::{Mutex, watch};

use crate::client::LogClient;
use crate::codec::Codec;
use crate::error::{BuildError, ConsumerError, RegistryError, SourceError};
use crate::event::Event;
use crate::live::{LiveConfig, LiveHandle, run_live_loop};
use crate::partition::{EventHandler, handler};
use crate::position::OffsetVector;
use crate::projection::{InMemoryStateRepository, StateRepository};
use crate::registry::ConsumerRegistry;
use crate::snapshot_reader::SnapshotReader;
use crate::snapshot_writer::{SnapshotConfig, SnapshotWriter};
use crate::source::LogEventSource;
use crate::stop::StopPredicate;
use crate::storage::BlobStore;

/// Lifecycle state of a [`CompactingEventSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceState {
    /// Not yet restored.
    Cold,
    /// Replaying the latest snapshot into the repository.
    Restoring,
    /// Restored; consuming the log.
    Live,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cold => "cold",
            Self::Restoring => "restoring",
            Self::Live => "live",
        })
    }
}

/// What `restore` does when the latest snapshot cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestoreFailurePolicy {
    /// Return the error and stay `Cold`.
    #[default]
    FailStartup,
    /// Log the error and go `Live` with an empty repository from the start
    /// of the log.
    StartEmpty,
}

struct Inner<T, C: ?Sized> {
    stream_name: String,
    log: LogEventSource<T, C>,
    repository: Arc<dyn StateRepository<T>>,
    registry: Arc<ConsumerRegistry<T>>,
    writer: SnapshotWriter<T, C>,
    reader: SnapshotReader<T, C>,
    live_config: LiveConfig,
    state: watch::Sender<SourceState>,
    position: watch::Sender<OffsetVector>,
    round_lock: Mutex<()>,
    snapshot_lock: Mutex<()>,
    live_handle: Mutex<Option<LiveHandle>>,
}

/// Event source for one stream that restores from snapshots and keeps a
/// materialized key/value projection up to date.
///
/// `Clone` is cheap: all state is shared behind an `Arc`.
pub struct CompactingEventSource<T, C: ?Sized> {
    inner: Arc<Inner<T, C>>,
}

impl<T, C: ?Sized> Clone for CompactingEventSource<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, C: ?Sized> fmt::Debug for CompactingEventSource<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactingEventSource")
            .field("stream_name", &self.inner.stream_name)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl<T, C> CompactingEventSource<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Codec<T> + ?Sized + 'static,
{
    /// Start building a source for `stream_name`.
    pub fn builder(stream_name: impl Into<String>) -> CompactingEventSourceBuilder<T, C> {
        CompactingEventSourceBuilder::new(stream_name)
    }

    /// The stream this source consumes.
    pub fn stream_name(&self) -> &str {
        &self.inner.stream_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        *self.inner.state.borrow()
    }

    /// Position the next consumption round starts from.
    pub fn position(&self) -> OffsetVector {
        self.inner.position.borrow().clone()
    }

    /// The state repository maintained by this source.
    pub fn repository(&self) -> Arc<dyn StateRepository<T>> {
        Arc::clone(&self.inner.repository)
    }

    /// The live loop settings.
    pub fn live_config(&self) -> &LiveConfig {
        &self.inner.live_config
    }

    /// Rebuild the repository from the most recent snapshot and go `Live`.
    ///
    /// The repository is cleared first. Without a snapshot the source goes
    /// `Live` at the start of the log.
    ///
    /// # Returns
    ///
    /// The position consumption resumes from.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidState`] unless the source is `Cold`, and
    /// [`SourceError::Restore`] if the snapshot cannot be read under
    /// [`RestoreFailurePolicy::FailStartup`]. The repository is left empty
    /// and the source `Cold` in that case.
    pub async fn restore(&self) -> Result<OffsetVector, SourceError> {
        let inner = &self.inner;
        let claimed = inner.state.send_if_modified(|state| {
            if *state == SourceState::Cold {
                *state = SourceState::Restoring;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(SourceError::InvalidState {
                expected: SourceState::Cold,
                actual: self.state(),
            });
        }
        tracing::info!(stream = %inner.stream_name, "restoring state from latest snapshot");

        inner.repository.clear();
        match inner
            .reader
            .restore_latest(&inner.stream_name, &self.apply_handler())
            .await
        {
            Ok(Some((name, position))) => {
                tracing::info!(
                    stream = %inner.stream_name,
                    snapshot = %name,
                    entries = inner.repository.len(),
                    partitions = position.len(),
                    "restored from snapshot"
                );
                Ok(self.go_live(position))
            }
            Ok(None) => {
                tracing::info!(
                    stream = %inner.stream_name,
                    "no snapshot found, starting from the beginning of the log"
                );
                Ok(self.go_live(OffsetVector::empty()))
            }
            Err(e) => {
                inner.repository.clear();
                match inner.live_config.restore_failure_policy {
                    RestoreFailurePolicy::FailStartup => {
                        inner.state.send_replace(SourceState::Cold);
                        Err(SourceError::Restore(e))
                    }
                    RestoreFailurePolicy::StartEmpty => {
                        tracing::warn!(
                            stream = %inner.stream_name,
                            error = %e,
                            "snapshot restore failed, starting from empty state"
                        );
                        Ok(self.go_live(OffsetVector::empty()))
                    }
                }
            }
        }
    }

    fn go_live(&self, position: OffsetVector) -> OffsetVector {
        self.inner.position.send_replace(position.clone());
        self.inner.state.send_replace(SourceState::Live);
        tracing::info!(stream = %self.inner.stream_name, "source is live");
        position
    }

    /// Run one consumption round over every open partition, starting from
    /// [`position`](Self::position) and stopping per partition when `stop`
    /// fires.
    ///
    /// Each event is stored in the repository under its key, then
    /// dispatched to the registered consumers. Rounds never overlap.
    ///
    /// # Returns
    ///
    /// The new position, which also becomes the start of the next round.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidState`] unless the source is `Live` and
    /// [`SourceError::Consume`] if the round fails. The position is left
    /// unchanged on failure.
    pub async fn consume(&self, stop: StopPredicate<T>) -> Result<OffsetVector, SourceError> {
        self.require_live()?;
        let inner = &self.inner;
        let _round = inner.round_lock.lock().await;

        let start = self.position();
        let next = inner
            .log
            .consume_all(&start, stop, self.apply_handler())
            .await?;

        inner.position.send_replace(next.clone());
        tracing::debug!(
            stream = %inner.stream_name,
            partitions = next.len(),
            entries = inner.repository.len(),
            "consumption round finished"
        );
        Ok(next)
    }

    /// Write and upload a snapshot of the repository at the current
    /// position.
    ///
    /// The position is read before the repository, so the snapshot never
    /// claims events it does not contain. Snapshots of one source never run
    /// concurrently.
    ///
    /// # Returns
    ///
    /// The name of the uploaded snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidState`] unless the source is `Live` and
    /// [`SourceError::Snapshot`] if writing or uploading fails.
    pub async fn take_snapshot(&self) -> Result<String, SourceError> {
        self.require_live()?;
        let inner = &self.inner;
        let _guard = inner.snapshot_lock.lock().await;

        let position = self.position();
        inner
            .writer
            .take_snapshot(&inner.stream_name, &position, inner.repository.as_ref())
            .await
            .map_err(SourceError::Snapshot)
    }

    /// Spawn the live loop: restore if still `Cold`, then consume in rounds
    /// and snapshot periodically until shut down.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::AlreadyStarted`] if the loop was started
    /// before.
    pub async fn start_live(&self) -> Result<LiveHandle, SourceError> {
        let mut guard = self.inner.live_handle.lock().await;
        if guard.is_some() {
            return Err(SourceError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run_live_loop(
            self.clone(),
            shutdown_rx,
            Arc::clone(&stop_flag),
        ));

        let handle = LiveHandle {
            shutdown_tx,
            stop_flag,
            state_rx: self.inner.state.subscribe(),
            position_rx: self.inner.position.subscribe(),
            task: Arc::new(Mutex::new(Some(task))),
        };
        *guard = Some(handle.clone());
        Ok(handle)
    }

    fn require_live(&self) -> Result<(), SourceError> {
        match self.state() {
            SourceState::Live => Ok(()),
            actual => Err(SourceError::InvalidState {
                expected: SourceState::Live,
                actual,
            }),
        }
    }

    /// Handler applying an event to the repository and the registry.
    fn apply_handler(&self) -> EventHandler<T> {
        let repository = Arc::clone(&self.inner.repository);
        let registry = Arc::clone(&self.inner.registry);
        let stream = self.inner.stream_name.clone();
        handler(move |event: &Event<T>| {
            repository.put(event.key().to_owned(), event.payload().clone());
            registry.dispatch(&stream, event)?;
            Ok(())
        })
    }
}

/// Composition root for a [`CompactingEventSource`].
///
/// A log client, a blob store, and a codec are required. The repository
/// defaults to an [`InMemoryStateRepository`].
pub struct CompactingEventSourceBuilder<T, C: ?Sized> {
    stream_name: String,
    log_client: Option<Arc<dyn LogClient>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    codec: Option<Arc<C>>,
    repository: Option<Arc<dyn StateRepository<T>>>,
    registry: ConsumerRegistry<T>,
    snapshot_config: SnapshotConfig,
    live_config: LiveConfig,
}

impl<T, C> CompactingEventSourceBuilder<T, C>
where
    T: Clone + Send + Sync + 'static,
    C: Codec<T> + ?Sized + 'static,
{
    /// Create a builder for `stream_name` with default settings.
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            log_client: None,
            blob_store: None,
            codec: None,
            repository: None,
            registry: ConsumerRegistry::new(),
            snapshot_config: SnapshotConfig::default(),
            live_config: LiveConfig::default(),
        }
    }

    /// Set the client used to read the log.
    pub fn log_client(mut self, client: Arc<dyn LogClient>) -> Self {
        self.log_client = Some(client);
        self
    }

    /// Set the store snapshots are written to and read from.
    pub fn blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    /// Set the payload codec, shared by log records and snapshot entries.
    pub fn codec(mut self, codec: Arc<C>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Use `repository` instead of a fresh in-memory one.
    pub fn repository(mut self, repository: Arc<dyn StateRepository<T>>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Register a consumer for events of this stream whose key fully
    /// matches `key_pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidPattern`] if the pattern does not
    /// compile.
    pub fn consumer(
        mut self,
        key_pattern: &str,
        callback: impl Fn(&Event<T>) -> Result<(), ConsumerError> + Send + Sync + 'static,
    ) -> Result<Self, RegistryError> {
        self.registry
            .register(self.stream_name.clone(), key_pattern, callback)?;
        Ok(self)
    }

    /// Replace the consumer registry.
    pub fn registry(mut self, registry: ConsumerRegistry<T>) -> Self {
        self.registry = registry;
        self
    }

    /// Set the snapshot settings.
    pub fn snapshot_config(mut self, config: SnapshotConfig) -> Self {
        self.snapshot_config = config;
        self
    }

    /// Set the live loop settings, including the failure policies.
    pub fn live_config(mut self, config: LiveConfig) -> Self {
        self.live_config = config;
        self
    }

    /// Build the source in the `Cold` state.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] naming the first missing collaborator.
    pub fn build(self) -> Result<CompactingEventSource<T, C>, BuildError> {
        let log_client = self.log_client.ok_or(BuildError("log client"))?;
        let blob_store = self.blob_store.ok_or(BuildError("blob store"))?;
        let codec = self.codec.ok_or(BuildError("codec"))?;
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryStateRepository::new()));

        let log = LogEventSource::new(self.stream_name.clone(), log_client, Arc::clone(&codec))
            .with_poll_timeout(self.live_config.poll_timeout)
            .with_failure_policy(self.live_config.consumer_failure_policy);
        let reader = SnapshotReader::new(Arc::clone(&blob_store), Arc::clone(&codec))
            .with_temp_dir(self.snapshot_config.temp_dir.clone());
        let writer = SnapshotWriter::new(blob_store, codec).with_config(self.snapshot_config);

        let (state, _) = watch::channel(SourceState::Cold);
        let (position, _) = watch::channel(OffsetVector::empty());

        Ok(CompactingEventSource {
            inner: Arc::new(Inner {
                stream_name: self.stream_name,
                log,
                repository,
                registry: Arc::new(self.registry),
                writer,
                reader,
                live_config: self.live_config,
                state,
                position,
                round_lock: Mutex::new(()),
                snapshot_lock: Mutex::new(()),
                live_handle: Mutex::new(None),
            }),
        })
    }
}
