//! Shared data types for the prism time-series engine.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod chunk;
mod filter;
mod partition_key;
mod record;
mod schema;

pub use chunk::{ChunkId, ChunkInfo, ChunkInfoError, CHUNK_INFO_ENCODED_LEN};
pub use filter::{ColumnFilter, FilterOp};
pub use partition_key::PartitionKey;
pub use record::{
    ColumnValue, IngestRecord, RecordContainer, RecordContainerBuilder, RecordError,
};
pub use schema::{
    BucketScheme, ColumnDef, ColumnType, Dataset, DatasetSchema, HistogramValue, SchemaError,
};

/// Unique identifier of a shard: a contiguous slice of the partition-key
/// hash space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(u16);

impl ShardId {
    /// Construct from a raw shard number.
    pub const fn new(v: u16) -> Self {
        Self(v)
    }

    /// The raw shard number.
    pub const fn get(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a partition within one shard. Dense, assigned at partition
/// creation, and used as the value space of the inverted index bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Construct from a raw id.
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// The raw id.
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive range of user time, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start of the range (inclusive).
    pub start: i64,
    /// End of the range (inclusive).
    pub end: i64,
}

impl TimeRange {
    /// The full time axis.
    pub const ALL: Self = Self {
        start: i64::MIN,
        end: i64::MAX,
    };

    /// Construct a range; `start` must not exceed `end`.
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start <= end, "invalid time range [{start}, {end}]");
        Self { start, end }
    }

    /// Whether `ts` falls inside the range.
    pub fn contains(&self, ts: i64) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Whether this range and `[start, end]` share at least one instant.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start <= end && start <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_overlaps() {
        let r = TimeRange::new(100, 200);
        assert!(r.overlaps(200, 300));
        assert!(r.overlaps(0, 100));
        assert!(r.overlaps(150, 160));
        assert!(!r.overlaps(201, 300));
        assert!(!r.overlaps(0, 99));
        assert!(TimeRange::ALL.overlaps(i64::MIN, i64::MIN));
    }

    #[test]
    #[should_panic(expected = "invalid time range")]
    fn test_time_range_rejects_reversed() {
        TimeRange::new(10, 9);
    }
}
