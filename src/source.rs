//! Fan-out consumption of every open partition of a stream.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use crate::client::LogClient;
use crate::codec::Codec;
use crate::error::ConsumeError;
use crate::partition::{ConsumerFailurePolicy, EventHandler, LogPartitionCursor, PartitionConsumer};
use crate::position::{OffsetVector, PartitionId};
use crate::stop::StopPredicate;

/// Default time a single read waits for a record before reporting idle.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Consumes a named stream by draining each open partition on its own task
/// and merging the resulting positions.
///
/// The source holds no position of its own; callers pass the vector to start
/// from and receive the vector to continue from.
pub struct LogEventSource<T, C: ?Sized> {
    stream_name: String,
    client: Arc<dyn LogClient>,
    codec: Arc<C>,
    poll_timeout: Duration,
    failure_policy: ConsumerFailurePolicy,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: ?Sized> Clone for LogEventSource<T, C> {
    fn clone(&self) -> Self {
        Self {
            stream_name: self.stream_name.clone(),
            client: Arc::clone(&self.client),
            codec: Arc::clone(&self.codec),
            poll_timeout: self.poll_timeout,
            failure_policy: self.failure_policy,
            _marker: PhantomData,
        }
    }
}

impl<T, C> LogEventSource<T, C>
where
    T: Send + 'static,
    C: Codec<T> + ?Sized + 'static,
{
    /// Create a source for `stream_name` reading through `client`.
    pub fn new(stream_name: impl Into<String>, client: Arc<dyn LogClient>, codec: Arc<C>) -> Self {
        Self {
            stream_name: stream_name.into(),
            client,
            codec,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            failure_policy: ConsumerFailurePolicy::default(),
            _marker: PhantomData,
        }
    }

    /// Set how long a single read may wait for a record.
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Set the policy applied when the event handler fails.
    pub fn with_failure_policy(mut self, policy: ConsumerFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// The stream this source reads.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Consume every open partition from its position in `start` until
    /// `stop` fires for it, delivering each event to `on_event`.
    ///
    /// Partitions are drained concurrently; events of one partition arrive in
    /// order, events of different partitions interleave arbitrarily. The call
    /// returns after every partition task has finished.
    ///
    /// # Returns
    ///
    /// A vector holding, for every open partition, the token of the last
    /// record consumed in this call or else its token from `start`.
    /// Partitions that are no longer open are dropped from the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Discovery`] if the partitions cannot be
    /// listed. Otherwise returns the error of the first failed partition in
    /// discovery order, after all partitions have stopped; positions gathered
    /// by the other partitions are discarded.
    pub async fn consume_all(
        &self,
        start: &OffsetVector,
        stop: StopPredicate<T>,
        on_event: EventHandler<T>,
    ) -> Result<OffsetVector, ConsumeError> {
        let partitions = self
            .client
            .list_open_partitions(&self.stream_name)
            .await
            .map_err(|source| ConsumeError::Discovery {
                stream: self.stream_name.clone(),
                source,
            })?;

        tracing::debug!(
            stream = %self.stream_name,
            partitions = partitions.len(),
            "consuming stream"
        );

        let abort = Arc::new(AtomicBool::new(false));
        let mut tasks: Vec<(PartitionId, tokio::task::JoinHandle<_>)> =
            Vec::with_capacity(partitions.len());

        for partition in partitions {
            let start_token = start.position_of(&partition).cloned();
            let mut cursor = LogPartitionCursor::new(
                Arc::clone(&self.client),
                self.stream_name.clone(),
                partition.clone(),
                start_token.clone(),
                self.poll_timeout,
            );
            let consumer = PartitionConsumer::new(Arc::clone(&self.codec))
                .with_failure_policy(self.failure_policy)
                .with_abort_flag(Arc::clone(&abort));
            let stop = Arc::clone(&stop);
            let on_event = Arc::clone(&on_event);
            let task_partition = partition.clone();

            let handle = tokio::spawn(async move {
                consumer
                    .consume(&task_partition, &mut cursor, start_token, &stop, &on_event)
                    .await
            });
            tasks.push((partition, handle));
        }

        let mut next = OffsetVector::empty();
        let mut first_error: Option<ConsumeError> = None;

        for (partition, handle) in tasks {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => Err(ConsumeError::TaskFailed {
                    partition: partition.clone(),
                    message: join_err.to_string(),
                }),
            };
            match outcome {
                Ok(Some(token)) => {
                    // Never behind the start, whatever the partition reported.
                    if let Some(previous) = start.position_of(&partition) {
                        next = next.advanced(partition.clone(), previous.clone());
                    }
                    next = next.advanced(partition, token);
                }
                Ok(None) => {}
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => {
                    tracing::warn!(
                        stream = %self.stream_name,
                        partition = %partition,
                        error = %e,
                        "additional partition failure"
                    );
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        Ok(next)
    }
}
