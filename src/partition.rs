//! Draining a single partition.
//!
//! [`PartitionConsumer::consume`] reads records from a [`RecordSource`] after
//! a start position, decodes each one, consults the stop predicate, and hands
//! the event to the handler, strictly in partition order. It returns the
//! token of the last record handed out so the caller can fold it into an
//! [`OffsetVector`](crate::OffsetVector).

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{Fetch, LogClient};
use crate::codec::Codec;
use crate::error::{ConsumeError, ConsumerError, TransportError};
use crate::event::Event;
use crate::position::{PartitionId, SequenceToken};
use crate::stop::StopPredicate;

/// Shared event handler invoked for every consumed event.
pub type EventHandler<T> = Arc<dyn Fn(&Event<T>) -> Result<(), ConsumerError> + Send + Sync>;

/// Wrap a closure as an [`EventHandler`].
pub fn handler<T>(
    f: impl Fn(&Event<T>) -> Result<(), ConsumerError> + Send + Sync + 'static,
) -> EventHandler<T> {
    Arc::new(f)
}

/// What happens when the event handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumerFailurePolicy {
    /// The failing partition stops; sibling partitions run to completion and
    /// the call fails once all of them have finished.
    #[default]
    AbortPartition,
    /// The failing partition stops and signals its siblings to stop at their
    /// next record or idle check. The call fails once all have finished.
    AbortStream,
    /// The failure is logged and the event counts as consumed.
    LogAndSkip,
}

/// A sequential supply of records for one partition.
#[async_trait]
pub trait RecordSource: Send {
    /// Fetch the next record, or report that the partition is idle or closed.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the underlying read fails.
    async fn next_record(&mut self) -> Result<Fetch, TransportError>;
}

/// [`RecordSource`] reading one partition of a stream through a [`LogClient`].
///
/// Tracks its own read position so that every call continues after the last
/// record it returned.
pub struct LogPartitionCursor {
    client: Arc<dyn LogClient>,
    stream: String,
    partition: PartitionId,
    position: Option<SequenceToken>,
    poll_timeout: Duration,
}

impl LogPartitionCursor {
    /// Create a cursor positioned after `start` (or at the partition start).
    pub fn new(
        client: Arc<dyn LogClient>,
        stream: impl Into<String>,
        partition: impl Into<PartitionId>,
        start: Option<SequenceToken>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            client,
            stream: stream.into(),
            partition: partition.into(),
            position: start,
            poll_timeout,
        }
    }
}

#[async_trait]
impl RecordSource for LogPartitionCursor {
    async fn next_record(&mut self) -> Result<Fetch, TransportError> {
        let fetch = self
            .client
            .read_from(
                &self.stream,
                &self.partition,
                self.position.as_ref(),
                self.poll_timeout,
            )
            .await?;
        if let Fetch::Record(record) = &fetch {
            self.position = Some(record.sequence.clone());
        }
        Ok(fetch)
    }
}

/// Consumes one partition with a fixed codec and failure policy.
pub struct PartitionConsumer<T, C: ?Sized> {
    codec: Arc<C>,
    failure_policy: ConsumerFailurePolicy,
    abort: Arc<AtomicBool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, C: Codec<T> + ?Sized> PartitionConsumer<T, C> {
    /// Create a consumer decoding payloads with `codec`.
    pub fn new(codec: Arc<C>) -> Self {
        Self {
            codec,
            failure_policy: ConsumerFailurePolicy::default(),
            abort: Arc::new(AtomicBool::new(false)),
            _marker: PhantomData,
        }
    }

    /// Set the policy applied when the event handler fails.
    pub fn with_failure_policy(mut self, policy: ConsumerFailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Share an abort flag with sibling partition consumers.
    ///
    /// The consumer stops at its next check once the flag is set, and sets it
    /// itself when it fails under [`ConsumerFailurePolicy::AbortStream`].
    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Drain `partition` from `source` until `stop` fires, the partition
    /// closes, or a failure occurs.
    ///
    /// `start` is the token of the last record consumed previously; it is
    /// returned unchanged if nothing is consumed.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumeError::Decode`] if a payload cannot be decoded (the
    /// record is not delivered), [`ConsumeError::Transport`] if the source
    /// fails, and [`ConsumeError::Consumer`] if the handler fails under an
    /// aborting policy.
    pub async fn consume<S: RecordSource + ?Sized>(
        &self,
        partition: &str,
        source: &mut S,
        start: Option<SequenceToken>,
        stop: &StopPredicate<T>,
        on_event: &EventHandler<T>,
    ) -> Result<Option<SequenceToken>, ConsumeError> {
        let result = self
            .drain(partition, source, start, stop, on_event)
            .await;
        if result.is_err() && self.failure_policy == ConsumerFailurePolicy::AbortStream {
            self.abort.store(true, Ordering::Release);
        }
        result
    }

    async fn drain<S: RecordSource + ?Sized>(
        &self,
        partition: &str,
        source: &mut S,
        start: Option<SequenceToken>,
        stop: &StopPredicate<T>,
        on_event: &EventHandler<T>,
    ) -> Result<Option<SequenceToken>, ConsumeError> {
        tracing::debug!(partition, start = ?start.as_ref().map(SequenceToken::as_str), "consuming partition");

        let mut last = start;
        let mut consumed: u64 = 0;

        loop {
            if self.abort.load(Ordering::Acquire) {
                tracing::debug!(partition, "sibling partition failed, stopping");
                break;
            }

            let fetch = source
                .next_record()
                .await
                .map_err(|source| ConsumeError::Transport {
                    partition: partition.to_owned(),
                    source,
                })?;

            match fetch {
                Fetch::Record(record) => {
                    let event = Event::decode(&record, &*self.codec).map_err(|source| {
                        ConsumeError::Decode {
                            partition: partition.to_owned(),
                            source,
                        }
                    })?;

                    if stop(Some(&event)) {
                        break;
                    }

                    if let Err(e) = on_event(&event) {
                        if self.failure_policy != ConsumerFailurePolicy::LogAndSkip {
                            return Err(ConsumeError::Consumer {
                                partition: partition.to_owned(),
                                source: e,
                            });
                        }
                        tracing::warn!(
                            partition,
                            key = %event.key(),
                            sequence = %event.sequence(),
                            error = %e,
                            "consumer failed, skipping event"
                        );
                    }

                    last = Some(record.sequence);
                    consumed += 1;
                }
                Fetch::Idle => {
                    if stop(None) {
                        break;
                    }
                }
                Fetch::Closed => {
                    tracing::debug!(partition, "partition closed");
                    break;
                }
            }
        }

        tracing::debug!(partition, consumed, "partition consumption finished");
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, Utf8Codec};
    use crate::event::Record;
    use crate::stop;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted source: yields the queued fetches, then `Idle` forever.
    struct Scripted {
        fetches: VecDeque<Result<Fetch, TransportError>>,
        reads: usize,
    }

    impl Scripted {
        fn new(fetches: Vec<Result<Fetch, TransportError>>) -> Self {
            Self {
                fetches: fetches.into(),
                reads: 0,
            }
        }
    }

    #[async_trait]
    impl RecordSource for Scripted {
        async fn next_record(&mut self) -> Result<Fetch, TransportError> {
            self.reads += 1;
            self.fetches.pop_front().unwrap_or(Ok(Fetch::Idle))
        }
    }

    fn record(seq: u64, data: &str) -> Result<Fetch, TransportError> {
        Ok(Fetch::Record(Record::new(format!("key-{seq}"), data.as_bytes(), seq, 0)))
    }

    fn collecting() -> (Arc<Mutex<Vec<String>>>, EventHandler<String>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_event = handler(move |e: &Event<String>| {
            sink.lock().unwrap().push(e.payload().clone());
            Ok(())
        });
        (seen, on_event)
    }

    #[tokio::test]
    async fn consumes_in_order_until_caught_up() {
        let mut source = Scripted::new(vec![record(1, "a"), record(2, "b"), record(3, "c")]);
        let (seen, on_event) = collecting();
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec));

        let last = consumer
            .consume("p1", &mut source, None, &stop::when_caught_up(), &on_event)
            .await
            .expect("consume should succeed");

        assert_eq!(last, Some(SequenceToken::from(3u64)));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn returns_start_token_when_nothing_consumed() {
        let mut source = Scripted::new(vec![]);
        let (seen, on_event) = collecting();
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec));

        let last = consumer
            .consume(
                "p1",
                &mut source,
                Some(SequenceToken::from("41")),
                &stop::when_caught_up(),
                &on_event,
            )
            .await
            .expect("consume should succeed");

        assert_eq!(last, Some(SequenceToken::from("41")));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_predicate_sees_event_before_handler() {
        let mut source = Scripted::new(vec![record(1, "a"), record(2, "stop"), record(3, "c")]);
        let (seen, on_event) = collecting();
        let stop = stop::predicate(|e: Option<&Event<String>>| {
            e.is_some_and(|e| e.payload() == "stop")
        });
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec));

        let last = consumer
            .consume("p1", &mut source, None, &stop, &on_event)
            .await
            .expect("consume should succeed");

        assert_eq!(last, Some(SequenceToken::from(1u64)));
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn idle_sentinel_is_evaluated_between_records() {
        let mut source = Scripted::new(vec![
            record(1, "a"),
            Ok(Fetch::Idle),
            record(2, "b"),
            Ok(Fetch::Idle),
        ]);
        let (seen, on_event) = collecting();
        let idle_calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&idle_calls);
        // Stop on the second idle read.
        let stop = stop::predicate(move |e: Option<&Event<String>>| {
            if e.is_none() {
                let mut n = counter.lock().unwrap();
                *n += 1;
                *n >= 2
            } else {
                false
            }
        });
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec));

        let last = consumer
            .consume("p1", &mut source, None, &stop, &on_event)
            .await
            .expect("consume should succeed");

        assert_eq!(last, Some(SequenceToken::from(2u64)));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(*idle_calls.lock().unwrap(), 2);
        assert_eq!(source.reads, 4);
    }

    #[tokio::test]
    async fn closed_partition_ends_consumption_without_idle_read() {
        let mut source = Scripted::new(vec![record(1, "a"), Ok(Fetch::Closed)]);
        let (seen, on_event) = collecting();
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec));

        let last = consumer
            .consume("p1", &mut source, None, &stop::never(), &on_event)
            .await
            .expect("consume should succeed");

        assert_eq!(last, Some(SequenceToken::from(1u64)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn decode_failure_is_fatal_and_delivers_nothing() {
        let mut source = Scripted::new(vec![record(1, "{\"ok\":1}"), record(2, "{broken")]);
        let delivered = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&delivered);
        let on_event = handler(move |_: &Event<serde_json::Value>| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        let consumer = PartitionConsumer::new(Arc::new(JsonCodec::<serde_json::Value>::new()));

        let err = consumer
            .consume("p1", &mut source, None, &stop::when_caught_up(), &on_event)
            .await
            .expect_err("decode failure should propagate");

        assert!(matches!(err, ConsumeError::Decode { ref partition, .. } if partition == "p1"));
        assert_eq!(*delivered.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn transport_failure_propagates() {
        let mut source = Scripted::new(vec![Err(TransportError::new("connection reset"))]);
        let (_, on_event) = collecting();
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec));

        let err = consumer
            .consume("p1", &mut source, None, &stop::when_caught_up(), &on_event)
            .await
            .expect_err("transport failure should propagate");

        assert!(matches!(err, ConsumeError::Transport { .. }));
    }

    #[tokio::test]
    async fn handler_failure_aborts_partition_by_default() {
        let mut source = Scripted::new(vec![record(1, "a"), record(2, "b")]);
        let on_event = handler(|_: &Event<String>| Err(ConsumerError::new("boom")));
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec));

        let err = consumer
            .consume("p1", &mut source, None, &stop::when_caught_up(), &on_event)
            .await
            .expect_err("handler failure should propagate");

        assert!(matches!(err, ConsumeError::Consumer { .. }));
        assert_eq!(source.reads, 1);
    }

    #[tokio::test]
    async fn log_and_skip_policy_continues_past_failures() {
        let mut source = Scripted::new(vec![record(1, "bad"), record(2, "good")]);
        let (seen, sink) = collecting();
        let on_event = handler(move |e: &Event<String>| {
            if e.payload() == "bad" {
                return Err(ConsumerError::new("rejected"));
            }
            sink(e)
        });
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec))
            .with_failure_policy(ConsumerFailurePolicy::LogAndSkip);

        let last = consumer
            .consume("p1", &mut source, None, &stop::when_caught_up(), &on_event)
            .await
            .expect("skipping policy should not fail");

        assert_eq!(last, Some(SequenceToken::from(2u64)));
        assert_eq!(*seen.lock().unwrap(), vec!["good"]);
    }

    #[tokio::test]
    async fn abort_stream_policy_raises_shared_flag() {
        let abort = Arc::new(AtomicBool::new(false));
        let mut source = Scripted::new(vec![record(1, "a")]);
        let on_event = handler(|_: &Event<String>| Err(ConsumerError::new("boom")));
        let consumer = PartitionConsumer::new(Arc::new(Utf8Codec))
            .with_failure_policy(ConsumerFailurePolicy::AbortStream)
            .with_abort_flag(Arc::clone(&abort));

        consumer
            .consume("p1", &mut source, None, &stop::never(), &on_event)
            .await
            .expect_err("handler failure should propagate");
        assert!(abort.load(Ordering::Acquire));

        // A sibling sharing the flag stops before reading anything.
        let mut sibling_source = Scripted::new(vec![record(1, "x")]);
        let (seen, on_event) = collecting();
        let sibling = PartitionConsumer::new(Arc::new(Utf8Codec)).with_abort_flag(abort);
        let last = sibling
            .consume("p2", &mut sibling_source, None, &stop::never(), &on_event)
            .await
            .expect("aborted sibling returns normally");
        assert_eq!(last, None);
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(sibling_source.reads, 0);
    }
}
