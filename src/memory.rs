//! In-process partitioned log.
//!
//! [`InMemoryLog`] implements [`LogClient`] over plain vectors. Sequence
//! tokens are the 1-based record index within the partition. Reads block up
//! to the poll timeout for an append, so a live loop over it behaves like one
//! over a real log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::client::{Fetch, LogClient};
use crate::error::TransportError;
use crate::event::Record;
use crate::position::{PartitionId, SequenceToken};

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<Record>,
    closed: bool,
}

/// A partitioned, append-only log held in memory.
#[derive(Debug, Default)]
pub struct InMemoryLog {
    streams: Mutex<HashMap<String, BTreeMap<PartitionId, PartitionLog>>>,
    appended: Notify,
    fail_listing: AtomicBool,
}

impl InMemoryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record stamped with the current time, creating the stream and
    /// partition on first use.
    ///
    /// # Returns
    ///
    /// The sequence token assigned to the record.
    pub fn append(
        &self,
        stream: &str,
        partition: &str,
        key: &str,
        data: impl Into<Vec<u8>>,
    ) -> SequenceToken {
        self.append_at(stream, partition, key, data, now_millis())
    }

    /// Append a record with an explicit arrival timestamp (epoch millis).
    ///
    /// A record's lag is computed at read time as the distance between its
    /// arrival timestamp and that of the partition head.
    pub fn append_at(
        &self,
        stream: &str,
        partition: &str,
        key: &str,
        data: impl Into<Vec<u8>>,
        arrival_timestamp: u64,
    ) -> SequenceToken {
        let token = {
            let mut streams = self.lock();
            let log = streams
                .entry(stream.to_owned())
                .or_default()
                .entry(partition.to_owned())
                .or_default();
            let token = SequenceToken::from(log.records.len() as u64 + 1);
            log.records
                .push(Record::new(key, data, token.clone(), arrival_timestamp));
            token
        };
        self.appended.notify_waiters();
        token
    }

    /// Close a partition. It stays readable until drained but is no longer
    /// listed as open.
    pub fn close_partition(&self, stream: &str, partition: &str) {
        if let Some(log) = self
            .lock()
            .get_mut(stream)
            .and_then(|partitions| partitions.get_mut(partition))
        {
            log.closed = true;
        }
        self.appended.notify_waiters();
    }

    /// Number of records in a partition.
    pub fn len(&self, stream: &str, partition: &str) -> usize {
        self.lock()
            .get(stream)
            .and_then(|partitions| partitions.get(partition))
            .map_or(0, |log| log.records.len())
    }

    /// Make partition listing fail, simulating an unreachable log.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::Release);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<PartitionId, PartitionLog>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_read(
        &self,
        stream: &str,
        partition: &str,
        after: Option<&SequenceToken>,
    ) -> Result<Option<Fetch>, TransportError> {
        let streams = self.lock();
        let log = streams
            .get(stream)
            .and_then(|partitions| partitions.get(partition))
            .ok_or_else(|| {
                TransportError::new(format!("unknown partition '{partition}' of stream '{stream}'"))
            })?;

        let next = match after {
            None => log.records.first(),
            Some(token) => {
                let idx = log.records.partition_point(|r| r.sequence <= *token);
                log.records.get(idx)
            }
        };

        match next {
            Some(record) => {
                let head = log
                    .records
                    .last()
                    .map_or(record.arrival_timestamp, |r| r.arrival_timestamp);
                let behind = Duration::from_millis(head.saturating_sub(record.arrival_timestamp));
                Ok(Some(Fetch::Record(record.clone().with_behind_latest(behind))))
            }
            None if log.closed => Ok(Some(Fetch::Closed)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LogClient for InMemoryLog {
    async fn list_open_partitions(&self, stream: &str) -> Result<Vec<PartitionId>, TransportError> {
        if self.fail_listing.load(Ordering::Acquire) {
            return Err(TransportError::new("partition listing unavailable"));
        }
        Ok(self
            .lock()
            .get(stream)
            .map(|partitions| {
                partitions
                    .iter()
                    .filter(|(_, log)| !log.closed)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_from(
        &self,
        stream: &str,
        partition: &str,
        after: Option<&SequenceToken>,
        timeout: Duration,
    ) -> Result<Fetch, TransportError> {
        let notified = self.appended.notified();
        tokio::pin!(notified);
        // Register before checking so an append in between is not missed.
        notified.as_mut().enable();

        if let Some(fetch) = self.try_read(stream, partition, after)? {
            return Ok(fetch);
        }

        let _ = tokio::time::timeout(timeout, notified).await;
        Ok(self
            .try_read(stream, partition, after)?
            .unwrap_or(Fetch::Idle))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn reads_records_in_order_then_idles() {
        let log = InMemoryLog::new();
        let first = log.append("s", "p", "k", "a");
        log.append("s", "p", "k", "b");

        let fetch = log
            .read_from("s", "p", None, Duration::ZERO)
            .await
            .expect("read should succeed");
        assert!(matches!(fetch, Fetch::Record(ref r) if r.data == b"a"));

        let fetch = log
            .read_from("s", "p", Some(&first), Duration::ZERO)
            .await
            .expect("read should succeed");
        let Fetch::Record(second) = fetch else {
            panic!("expected a record, got {fetch:?}");
        };
        assert_eq!(second.data, b"b");

        let fetch = log
            .read_from("s", "p", Some(&second.sequence), Duration::from_millis(1))
            .await
            .expect("read should succeed");
        assert_eq!(fetch, Fetch::Idle);
    }

    #[tokio::test]
    async fn closed_partition_is_unlisted_and_reports_closed_when_drained() {
        let log = InMemoryLog::new();
        let token = log.append("s", "p1", "k", "a");
        log.append("s", "p2", "k", "b");
        log.close_partition("s", "p1");

        let open = log.list_open_partitions("s").await.expect("list should succeed");
        assert_eq!(open, vec!["p2".to_string()]);

        let fetch = log
            .read_from("s", "p1", Some(&token), Duration::ZERO)
            .await
            .expect("read should succeed");
        assert_eq!(fetch, Fetch::Closed);
    }

    #[tokio::test]
    async fn lag_is_distance_to_partition_head() {
        let log = InMemoryLog::new();
        log.append_at("s", "p", "k", "old", 1_000);
        log.append_at("s", "p", "k", "new", 61_000);

        let fetch = log
            .read_from("s", "p", None, Duration::ZERO)
            .await
            .expect("read should succeed");
        let Fetch::Record(record) = fetch else {
            panic!("expected a record, got {fetch:?}");
        };
        assert_eq!(record.behind_latest, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let log = Arc::new(InMemoryLog::new());
        let token = log.append("s", "p", "k", "a");

        let reader = Arc::clone(&log);
        let read = tokio::spawn(async move {
            reader
                .read_from("s", "p", Some(&token), Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("s", "p", "k", "b");

        let fetch = read
            .await
            .expect("task should not panic")
            .expect("read should succeed");
        assert!(matches!(fetch, Fetch::Record(ref r) if r.data == b"b"));
    }

    #[tokio::test]
    async fn reads_after_a_mid_partition_token() {
        let log = InMemoryLog::new();
        for i in 1..=120u64 {
            log.append("s", "p", "k", format!("v{i}"));
        }

        for after in [1u64, 9, 57, 99, 119] {
            let fetch = log
                .read_from("s", "p", Some(&SequenceToken::from(after)), Duration::ZERO)
                .await
                .expect("read should succeed");
            let Fetch::Record(record) = fetch else {
                panic!("expected a record after {after}, got {fetch:?}");
            };
            assert_eq!(record.sequence, SequenceToken::from(after + 1));
            assert_eq!(record.data, format!("v{}", after + 1).into_bytes());
        }

        let fetch = log
            .read_from("s", "p", Some(&SequenceToken::from(120u64)), Duration::ZERO)
            .await
            .expect("read should succeed");
        assert_eq!(fetch, Fetch::Idle);
    }

    #[tokio::test]
    async fn unknown_partition_is_a_transport_error() {
        let log = InMemoryLog::new();
        let result = log.read_from("s", "nope", None, Duration::ZERO).await;
        assert!(result.is_err());
    }
}
