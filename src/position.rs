//! Per-partition log positions.
//!
//! An [`OffsetVector`] maps each consumed partition to the [`SequenceToken`]
//! of the last record consumed from it. It is the checkpoint that snapshots
//! persist and that consumption resumes from.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a partition (shard) of a stream.
pub type PartitionId = String;

/// Opaque, per-partition position marker.
///
/// Tokens are only comparable within the partition that issued them. Their
/// ordering treats the token as an unsigned decimal-like string: a longer token
/// sorts after a shorter one, equal lengths compare lexically. This is the
/// natural order of the big-integer sequence numbers most partitioned logs hand
/// out, and of any zero-padded counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceToken(String);

impl SequenceToken {
    /// Create a token from its string form.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The token as issued by the log.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for SequenceToken {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for SequenceToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SequenceToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for SequenceToken {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Immutable map of partition id to the last consumed [`SequenceToken`].
///
/// An empty vector denotes "start of log". Equality is structural map
/// equality; iteration order is by partition id.
///
/// Serialized as a plain JSON object: `{"shard-1": "1234", "shard-2": "abcde"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OffsetVector {
    positions: BTreeMap<PartitionId, SequenceToken>,
}

impl OffsetVector {
    /// The empty vector: every partition starts from its beginning.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a vector from `(partition, token)` pairs.
    ///
    /// # Examples
    ///
    /// ```
    /// use shardfold::OffsetVector;
    ///
    /// let v = OffsetVector::of([("shard1", "1234"), ("shard2", "abcde")]);
    /// assert_eq!(v.len(), 2);
    /// assert_eq!(v.position_of("shard1").map(|t| t.as_str()), Some("1234"));
    /// ```
    pub fn of<P, T, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, T)>,
        P: Into<PartitionId>,
        T: Into<SequenceToken>,
    {
        Self {
            positions: entries
                .into_iter()
                .map(|(p, t)| (p.into(), t.into()))
                .collect(),
        }
    }

    /// The token to resume `partition` from, or `None` for start of partition.
    pub fn position_of(&self, partition: &str) -> Option<&SequenceToken> {
        self.positions.get(partition)
    }

    /// Returns `true` if no partition has been consumed yet.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of partitions carrying a position.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Iterate `(partition, token)` pairs in partition order.
    pub fn iter(&self) -> impl Iterator<Item = (&PartitionId, &SequenceToken)> {
        self.positions.iter()
    }

    /// Returns a new vector with `partition` moved to `token`.
    ///
    /// Tokens only move forward: if the vector already holds a later token for
    /// the partition it is kept.
    pub fn advanced(&self, partition: impl Into<PartitionId>, token: SequenceToken) -> Self {
        let mut next = self.clone();
        let partition = partition.into();
        match next.positions.get(&partition) {
            Some(current) if *current >= token => {}
            _ => {
                next.positions.insert(partition, token);
            }
        }
        next
    }

    /// Returns `true` if no partition of `self` is behind its position in
    /// `earlier`. Partitions absent from `self` are not considered.
    pub fn is_at_or_after(&self, earlier: &OffsetVector) -> bool {
        self.positions.iter().all(|(partition, token)| {
            earlier
                .position_of(partition)
                .is_none_or(|previous| token >= previous)
        })
    }
}

impl FromIterator<(PartitionId, SequenceToken)> for OffsetVector {
    fn from_iter<I: IntoIterator<Item = (PartitionId, SequenceToken)>>(iter: I) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}
