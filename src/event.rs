//! Log records and decoded events.
//!
//! A [`Record`] is what the transport hands out: opaque payload bytes plus
//! the partition key and position. An [`Event`] is the decoded form delivered
//! to stop predicates, handlers, and registered consumers. Neither is mutated
//! after construction.

use std::time::Duration;

use crate::codec::Codec;
use crate::error::DecodeError;
use crate::position::SequenceToken;

/// A raw record as read from one partition of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Partition key the producer wrote the record with; becomes the event key.
    pub key: String,
    /// Encoded payload bytes.
    pub data: Vec<u8>,
    /// Position of the record within its partition.
    pub sequence: SequenceToken,
    /// Time the log accepted the record (Unix epoch milliseconds).
    pub arrival_timestamp: u64,
    /// How far behind the head of the partition this record was when read.
    pub behind_latest: Duration,
}

impl Record {
    /// Create a record that is at the head of its partition.
    pub fn new(
        key: impl Into<String>,
        data: impl Into<Vec<u8>>,
        sequence: impl Into<SequenceToken>,
        arrival_timestamp: u64,
    ) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
            sequence: sequence.into(),
            arrival_timestamp,
            behind_latest: Duration::ZERO,
        }
    }

    /// Returns the record with its approximate lag set.
    pub fn with_behind_latest(mut self, behind_latest: Duration) -> Self {
        self.behind_latest = behind_latest;
        self
    }
}

/// A decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    key: String,
    payload: T,
    arrival_timestamp: u64,
    sequence: SequenceToken,
    lag: Duration,
}

impl<T> Event<T> {
    /// Assemble an event from already-decoded parts.
    pub fn new(
        key: impl Into<String>,
        payload: T,
        arrival_timestamp: u64,
        sequence: impl Into<SequenceToken>,
        lag: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            payload,
            arrival_timestamp,
            sequence: sequence.into(),
            lag,
        }
    }

    /// Decode `record` with `codec`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the codec rejects the payload.
    pub fn decode<C: Codec<T> + ?Sized>(record: &Record, codec: &C) -> Result<Self, DecodeError> {
        let payload = codec.decode(&record.data)?;
        Ok(Self {
            key: record.key.clone(),
            payload,
            arrival_timestamp: record.arrival_timestamp,
            sequence: record.sequence.clone(),
            lag: record.behind_latest,
        })
    }

    /// The event key (the record's partition key).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The decoded payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the event, returning its payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Time the log accepted the record (Unix epoch milliseconds).
    pub fn arrival_timestamp(&self) -> u64 {
        self.arrival_timestamp
    }

    /// Position of the record within its partition.
    pub fn sequence(&self) -> &SequenceToken {
        &self.sequence
    }

    /// Approximate distance from the head of the partition at read time.
    pub fn lag(&self) -> Duration {
        self.lag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, Utf8Codec};

    #[test]
    fn decodes_record_into_event() {
        let record = Record::new("42", "ßome dätä".as_bytes(), "00001", 1_700_000_000_000)
            .with_behind_latest(Duration::from_millis(250));

        let event = Event::decode(&record, &Utf8Codec).expect("decode should succeed");

        assert_eq!(event.key(), "42");
        assert_eq!(event.payload(), "ßome dätä");
        assert_eq!(event.arrival_timestamp(), 1_700_000_000_000);
        assert_eq!(event.sequence().as_str(), "00001");
        assert_eq!(event.lag(), Duration::from_millis(250));
    }

    #[test]
    fn decode_failure_produces_no_event() {
        let record = Record::new("k", b"not json".to_vec(), "1", 0);
        let result = Event::<serde_json::Value>::decode(&record, &JsonCodec::new());
        assert!(result.is_err());
    }

    #[test]
    fn into_payload_moves_value_out() {
        let event = Event::new("k", vec![1u8, 2, 3], 0, "7", Duration::ZERO);
        assert_eq!(event.into_payload(), vec![1, 2, 3]);
    }
}
