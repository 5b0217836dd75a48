//! Live loop configuration and runtime types.
//!
//! This module provides [`LiveConfig`] for tuning polling, snapshot cadence,
//! and failure policies of a [`CompactingEventSource`], and [`LiveHandle`]
//! for controlling the background loop started by
//! [`CompactingEventSource::start_live`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::codec::Codec;
use crate::compacting::{CompactingEventSource, RestoreFailurePolicy, SourceState};
use crate::error::SourceError;
use crate::partition::ConsumerFailurePolicy;
use crate::position::OffsetVector;
use crate::stop;

/// Configuration for the live loop and the consumption it drives.
///
/// All fields have defaults accessible via [`LiveConfig::default()`]. Pass
/// to [`CompactingEventSourceBuilder::live_config`](crate::CompactingEventSourceBuilder::live_config)
/// to customize.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use shardfold::LiveConfig;
///
/// let config = LiveConfig {
///     snapshot_interval: Some(Duration::from_secs(60)),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.snapshot_interval, Some(Duration::from_secs(60)));
/// assert_eq!(config.poll_timeout, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// How long a single partition read waits for a record before the
    /// partition counts as idle.
    ///
    /// Default: 1 second.
    pub poll_timeout: Duration,

    /// Pause between consumption rounds once every partition is caught up.
    ///
    /// Default: 1 second.
    pub idle_delay: Duration,

    /// How often the live loop takes a snapshot. `None` disables periodic
    /// snapshots.
    ///
    /// Default: 5 minutes.
    pub snapshot_interval: Option<Duration>,

    /// Take a final snapshot when the loop is shut down.
    ///
    /// Default: `true`.
    pub snapshot_on_shutdown: bool,

    /// What a consumption round does when a consumer fails.
    ///
    /// Default: [`ConsumerFailurePolicy::AbortPartition`].
    pub consumer_failure_policy: ConsumerFailurePolicy,

    /// What restore does when the latest snapshot is unreadable.
    ///
    /// Default: [`RestoreFailurePolicy::FailStartup`].
    pub restore_failure_policy: RestoreFailurePolicy,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            idle_delay: Duration::from_secs(1),
            snapshot_interval: Some(Duration::from_secs(300)),
            snapshot_on_shutdown: true,
            consumer_failure_policy: ConsumerFailurePolicy::default(),
            restore_failure_policy: RestoreFailurePolicy::default(),
        }
    }
}

/// Handle for controlling the live loop.
///
/// Dropping the handle does **not** stop the loop. Call
/// [`shutdown`](LiveHandle::shutdown) for graceful termination with a final
/// snapshot.
///
/// `Clone` is cheap: all fields are shared.
#[derive(Debug, Clone)]
pub struct LiveHandle {
    /// Sends `true` to signal the loop to stop.
    pub(crate) shutdown_tx: tokio::sync::watch::Sender<bool>,
    /// Observed by the stop predicate of the running round.
    pub(crate) stop_flag: Arc<AtomicBool>,
    pub(crate) state_rx: tokio::sync::watch::Receiver<SourceState>,
    pub(crate) position_rx: tokio::sync::watch::Receiver<OffsetVector>,
    /// Taken and awaited exactly once by [`shutdown`](LiveHandle::shutdown).
    pub(crate) task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), SourceError>>>>>,
}

impl LiveHandle {
    /// Returns `true` once the source has finished restoring.
    pub fn is_live(&self) -> bool {
        *self.state_rx.borrow() == SourceState::Live
    }

    /// Position reached by the last completed consumption round.
    pub fn position(&self) -> OffsetVector {
        self.position_rx.borrow().clone()
    }

    /// Wait until the source is live.
    ///
    /// # Returns
    ///
    /// `true` once live, `false` if the loop ended before getting there.
    pub async fn wait_until_live(&self) -> bool {
        let mut state_rx = self.state_rx.clone();
        loop {
            if *state_rx.borrow_and_update() == SourceState::Live {
                return true;
            }
            if self.is_finished().await {
                return false;
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    async fn is_finished(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_none_or(|task| task.is_finished())
    }

    /// Signal the live loop to stop and wait for it to finish.
    ///
    /// The running round stops at its next record or idle check. If
    /// configured, a final snapshot is taken before the loop exits.
    ///
    /// Calling `shutdown` more than once is safe; subsequent calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the loop (a failed restore, round, or
    /// final snapshot), or [`SourceError::TaskFailed`] if the loop panicked.
    pub async fn shutdown(&self) -> Result<(), SourceError> {
        self.stop_flag.store(true, Ordering::Release);
        // The receiver is gone if the loop already exited.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| SourceError::TaskFailed(e.to_string()))?,
            None => Ok(()),
        }
    }
}

/// Run the live loop.
///
/// Restores the source if it is still cold, then runs consumption rounds
/// that stop each partition once it is caught up, snapshotting whenever
/// `snapshot_interval` has elapsed and pausing `idle_delay` between rounds.
/// On shutdown a final snapshot is taken if configured.
///
/// # Errors
///
/// Returns the restore error, the error of the first failed round, or the
/// error of the final snapshot. Periodic snapshot failures are logged and
/// retried at the next interval.
pub(crate) async fn run_live_loop<T, C>(
    source: CompactingEventSource<T, C>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    stop_flag: Arc<AtomicBool>,
) -> Result<(), SourceError>
where
    T: Clone + Send + Sync + 'static,
    C: Codec<T> + ?Sized + 'static,
{
    let config = source.live_config().clone();
    let stream = source.stream_name().to_owned();

    if source.state() == SourceState::Cold {
        source.restore().await?;
    }
    tracing::info!(stream = %stream, "live loop started");

    let mut last_snapshot = Instant::now();
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let stop = stop::or(stop::when_caught_up(), stop::flag(Arc::clone(&stop_flag)));
        if let Err(e) = source.consume(stop).await {
            tracing::error!(stream = %stream, error = %e, "live loop: consumption round failed");
            return Err(e);
        }

        if let Some(interval) = config.snapshot_interval
            && last_snapshot.elapsed() >= interval
        {
            match source.take_snapshot().await {
                Ok(name) => tracing::debug!(stream = %stream, snapshot = %name, "periodic snapshot taken"),
                Err(e) => tracing::error!(stream = %stream, error = %e, "live loop: periodic snapshot failed"),
            }
            last_snapshot = Instant::now();
        }

        tokio::select! {
            _ = tokio::time::sleep(config.idle_delay) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    tracing::info!(stream = %stream, "live loop stopping");
    if config.snapshot_on_shutdown {
        let name = source.take_snapshot().await?;
        tracing::info!(stream = %stream, snapshot = %name, "final snapshot taken");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Utf8Codec;
    use crate::memory::InMemoryLog;
    use crate::snapshot;
    use crate::snapshot_writer::SnapshotConfig;
    use crate::storage::{BlobStore, InMemoryBlobStore};
    use crate::client::LogClient;
    use std::path::Path;

    #[test]
    fn live_config_defaults() {
        let config = LiveConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.idle_delay, Duration::from_secs(1));
        assert_eq!(config.snapshot_interval, Some(Duration::from_secs(300)));
        assert!(config.snapshot_on_shutdown);
        assert_eq!(config.consumer_failure_policy, ConsumerFailurePolicy::AbortPartition);
        assert_eq!(config.restore_failure_policy, RestoreFailurePolicy::FailStartup);
    }

    fn live_source(
        log: &Arc<InMemoryLog>,
        store: &Arc<InMemoryBlobStore>,
        dir: &Path,
        config: LiveConfig,
    ) -> CompactingEventSource<String, Utf8Codec> {
        CompactingEventSource::builder("orders")
            .log_client(Arc::clone(log) as Arc<dyn LogClient>)
            .blob_store(Arc::clone(store) as Arc<dyn BlobStore>)
            .codec(Arc::new(Utf8Codec))
            .snapshot_config(SnapshotConfig {
                temp_dir: dir.to_path_buf(),
                snapshots_to_keep: 10,
            })
            .live_config(config)
            .build()
            .expect("build should succeed")
    }

    fn fast() -> LiveConfig {
        LiveConfig {
            poll_timeout: Duration::from_millis(5),
            idle_delay: Duration::from_millis(5),
            snapshot_interval: None,
            ..LiveConfig::default()
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition should hold within timeout");
    }

    #[tokio::test]
    async fn live_loop_follows_appends_and_snapshots_on_shutdown() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = Arc::new(InMemoryLog::new());
        let store = Arc::new(InMemoryBlobStore::new());
        log.append("orders", "shard-1", "a", "1");
        let source = live_source(&log, &store, dir.path(), fast());

        let handle = source.start_live().await.expect("start should succeed");
        assert!(handle.wait_until_live().await);
        assert!(handle.is_live());

        let repo = source.repository();
        wait_for(|| repo.get("a").as_deref() == Some("1")).await;

        log.append("orders", "shard-1", "a", "2");
        log.append("orders", "shard-2", "b", "3");
        wait_for(|| handle.position() == OffsetVector::of([("shard-1", "2"), ("shard-2", "1")])).await;
        assert_eq!(repo.get("a").as_deref(), Some("2"));

        handle.shutdown().await.expect("shutdown should succeed");
        handle.shutdown().await.expect("second shutdown is a no-op");

        let names = store.list(&snapshot::snapshot_prefix("orders")).await.expect("list");
        assert_eq!(names.len(), 1, "final snapshot uploaded");
    }

    #[tokio::test]
    async fn start_live_twice_is_rejected() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let source = live_source(
            &Arc::new(InMemoryLog::new()),
            &Arc::new(InMemoryBlobStore::new()),
            dir.path(),
            LiveConfig {
                snapshot_on_shutdown: false,
                ..fast()
            },
        );

        let handle = source.start_live().await.expect("start should succeed");
        let err = source.start_live().await.expect_err("second start is rejected");
        assert!(matches!(err, SourceError::AlreadyStarted));
        assert!(format!("{handle:?}").starts_with("LiveHandle"));

        handle.shutdown().await.expect("shutdown should succeed");
    }

    #[tokio::test]
    async fn periodic_snapshots_are_taken() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let log = Arc::new(InMemoryLog::new());
        let store = Arc::new(InMemoryBlobStore::new());
        log.append("orders", "shard-1", "a", "1");
        let source = live_source(
            &log,
            &store,
            dir.path(),
            LiveConfig {
                snapshot_interval: Some(Duration::from_millis(20)),
                snapshot_on_shutdown: false,
                ..fast()
            },
        );

        let handle = source.start_live().await.expect("start should succeed");
        wait_for(|| !store.names().is_empty()).await;
        handle.shutdown().await.expect("shutdown should succeed");
    }

    #[tokio::test]
    async fn failed_restore_ends_the_loop() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = Arc::new(InMemoryBlobStore::new());
        store
            .put(&snapshot::snapshot_name("orders", 1_000), b"garbage\n")
            .await
            .expect("seed");
        let source = live_source(&Arc::new(InMemoryLog::new()), &store, dir.path(), fast());

        let handle = source.start_live().await.expect("start should succeed");
        assert!(!handle.wait_until_live().await);

        let err = handle.shutdown().await.expect_err("loop ended with the restore error");
        assert!(matches!(err, SourceError::Restore(_)));
        assert_eq!(source.state(), SourceState::Cold);
    }
}
