//! Snapshot naming and on-disk format.
//!
//! A snapshot is a JSON-lines object named
//! `compaction-<stream>-snapshot-<suffix>.jsonl`. The suffix encodes the
//! creation time inverted (`i64::MAX - epoch_millis`, base 36, zero-padded to
//! 13 digits), so an ascending listing returns the newest snapshot first.
//!
//! Every line is a [`SnapshotEntry`]:
//!
//! ```text
//! {"key":"__snapshot_position__","sequence":0,"data":"<base64 of OffsetVector JSON>"}
//! {"key":"order-1","sequence":1,"data":"<base64 of encoded value>"}
//! {"key":"order-2","sequence":2,"data":"<base64 of encoded value>"}
//! ```
//!
//! The first line is always the position header. Entries after it carry one
//! repository key each; `sequence` is the entry ordinal.

use std::io::{self, Write};

use base64::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::position::OffsetVector;

/// Key of the header entry carrying the snapshot's [`OffsetVector`].
pub const HEADER_KEY: &str = "__snapshot_position__";

/// File extension of snapshot objects.
pub const SNAPSHOT_EXTENSION: &str = ".jsonl";

const SUFFIX_WIDTH: usize = 13;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Prefix shared by every snapshot of `stream`.
///
/// # Examples
///
/// ```
/// assert_eq!(
///     shardfold::snapshot::snapshot_prefix("orders"),
///     "compaction-orders-snapshot-"
/// );
/// ```
pub fn snapshot_prefix(stream: &str) -> String {
    format!("compaction-{stream}-snapshot-")
}

/// Name of a snapshot of `stream` created at `epoch_millis`.
pub fn snapshot_name(stream: &str, epoch_millis: u64) -> String {
    format!(
        "{}{}{SNAPSHOT_EXTENSION}",
        snapshot_prefix(stream),
        inverted_suffix(epoch_millis)
    )
}

/// Recover the creation time encoded in a snapshot name of `stream`.
///
/// Returns `None` if the name does not belong to `stream` or is malformed.
pub fn snapshot_timestamp(stream: &str, name: &str) -> Option<u64> {
    let suffix = name
        .strip_prefix(&snapshot_prefix(stream))?
        .strip_suffix(SNAPSHOT_EXTENSION)?;
    if suffix.len() != SUFFIX_WIDTH || !suffix.bytes().all(|b| BASE36.contains(&b)) {
        return None;
    }
    let inverted = i64::from_str_radix(suffix, 36).ok()?;
    u64::try_from(i64::MAX.checked_sub(inverted)?).ok()
}

fn inverted_suffix(epoch_millis: u64) -> String {
    let millis = i64::try_from(epoch_millis).unwrap_or(i64::MAX);
    let mut n = (i64::MAX - millis) as u64;
    let mut digits = [b'0'; SUFFIX_WIDTH];
    for slot in digits.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }
    digits.iter().map(|&b| b as char).collect()
}

/// One line of a snapshot object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Repository key, or [`HEADER_KEY`] for the position header.
    pub key: String,
    /// Ordinal of the entry within the snapshot; the header is `0`.
    pub sequence: u64,
    /// Base64-encoded value bytes.
    pub data: String,
}

impl SnapshotEntry {
    /// Header entry carrying `position`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the vector cannot be serialized.
    pub fn header(position: &OffsetVector) -> Result<Self, EncodeError> {
        let json = serde_json::to_vec(position).map_err(EncodeError::new)?;
        Ok(Self {
            key: HEADER_KEY.to_owned(),
            sequence: 0,
            data: BASE64_STANDARD.encode(json),
        })
    }

    /// State entry for `key` holding already encoded `bytes`.
    pub fn state(key: impl Into<String>, sequence: u64, bytes: &[u8]) -> Self {
        Self {
            key: key.into(),
            sequence,
            data: BASE64_STANDARD.encode(bytes),
        }
    }

    /// Returns `true` for the position header.
    pub fn is_header(&self) -> bool {
        self.key == HEADER_KEY
    }

    /// Parse one line of a snapshot object.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the line is not a valid entry.
    pub fn parse(line: &str) -> Result<Self, DecodeError> {
        serde_json::from_str(line).map_err(DecodeError::new)
    }

    /// The raw value bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if `data` is not valid base64.
    pub fn bytes(&self) -> Result<Vec<u8>, DecodeError> {
        BASE64_STANDARD.decode(&self.data).map_err(DecodeError::new)
    }

    /// The position carried by a header entry.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload is not an encoded vector.
    pub fn position(&self) -> Result<OffsetVector, DecodeError> {
        serde_json::from_slice(&self.bytes()?).map_err(DecodeError::new)
    }

    /// Append this entry as one line to `writer`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if writing fails.
    pub fn write_line<W: Write>(&self, mut writer: W) -> io::Result<()> {
        serde_json::to_writer(&mut writer, self).map_err(io::Error::other)?;
        writer.write_all(b"\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_has_stream_prefix_and_fixed_width_suffix() {
        let name = snapshot_name("teststream", 1_700_000_000_000);
        assert!(name.starts_with("compaction-teststream-snapshot-"));
        assert!(name.ends_with(".jsonl"));
        let suffix = &name["compaction-teststream-snapshot-".len()..name.len() - ".jsonl".len()];
        assert_eq!(suffix.len(), 13);
    }

    #[test]
    fn newer_snapshots_sort_first() {
        let older = snapshot_name("s", 1_000);
        let newer = snapshot_name("s", 2_000);
        let mut names = vec![older.clone(), newer.clone()];
        names.sort();
        assert_eq!(names, vec![newer, older]);
    }

    #[test]
    fn timestamp_round_trips_through_name() {
        let name = snapshot_name("orders", 1_712_345_678_901);
        assert_eq!(snapshot_timestamp("orders", &name), Some(1_712_345_678_901));
        assert_eq!(snapshot_timestamp("payments", &name), None);
        assert_eq!(snapshot_timestamp("orders", "compaction-orders-snapshot-zz.jsonl"), None);
    }

    #[test]
    fn signed_or_foreign_suffixes_are_rejected() {
        for suffix in ["-000000000001", "+000000000001", "00000000000Z1", "0000000000 01"] {
            let name = format!("compaction-orders-snapshot-{suffix}.jsonl");
            assert_eq!(snapshot_timestamp("orders", &name), None, "suffix {suffix:?}");
        }
    }

    #[test]
    fn epoch_zero_encodes_max_value() {
        let name = snapshot_name("s", 0);
        assert_eq!(name, "compaction-s-snapshot-1y2p0ij32e8e7.jsonl");
    }

    #[test]
    fn header_carries_position() {
        let position = OffsetVector::of([("shard1", "1234"), ("shard2", "abcde")]);
        let header = SnapshotEntry::header(&position).expect("header should encode");
        assert!(header.is_header());
        assert_eq!(header.sequence, 0);
        assert_eq!(header.position().expect("position should decode"), position);
    }

    #[test]
    fn state_entry_writes_one_json_line() {
        let entry = SnapshotEntry::state("k", 3, b"\x00\xffvalue");
        let mut buf = Vec::new();
        entry.write_line(&mut buf).expect("write should succeed");

        let text = String::from_utf8(buf).expect("line is utf-8");
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);

        let parsed = SnapshotEntry::parse(text.trim_end()).expect("parse should succeed");
        assert_eq!(parsed, entry);
        assert_eq!(parsed.bytes().expect("valid base64"), b"\x00\xffvalue");
    }

    #[test]
    fn corrupt_lines_are_decode_errors() {
        assert!(SnapshotEntry::parse("{not json").is_err());
        let entry = SnapshotEntry {
            key: "k".into(),
            sequence: 1,
            data: "***".into(),
        };
        assert!(entry.bytes().is_err());
    }
}
