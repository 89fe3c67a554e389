//! The remote wide-column store interface consumed by the engine.
//!
//! The persistence backend itself is an external collaborator; the engine
//! sees it only through [`ChunkSink`] (writes) and [`ChunkSource`] (reads).
//! Two tables back the contract:
//!
//! * chunk table `(partition BLOB, chunk_id i64, info BLOB, chunks BLOB)`,
//!   primary key `(partition, chunk_id)`
//! * index table `(partition BLOB, ingestion_time i64, start_time i64,
//!   info BLOB)`, primary key `(partition, ingestion_time, start_time)`
//!
//! A chunk set counts as written only when both its chunk row and its index
//! row succeeded.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod mem;

pub use mem::MemColumnStore;

use async_trait::async_trait;
use data_types::{ChunkInfo, PartitionKey, ShardId};
use futures::stream::BoxStream;
use snafu::{ensure, Snafu};

/// Errors surfaced by store implementations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum StoreError {
    #[snafu(display("remote write timed out after {} ms", timeout_millis))]
    WriteTimeout { timeout_millis: u64 },

    #[snafu(display("remote store rejected write: {}", reason))]
    WriteRejected { reason: String },

    #[snafu(display("remote read failed: {}", reason))]
    ReadFailed { reason: String },

    #[snafu(display("dataset '{}' is not initialized", dataset))]
    UnknownDataset { dataset: String },

    #[snafu(display("chunk blob malformed: {}", reason))]
    MalformedChunkBlob { reason: String },
}

/// Store result.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// One chunk set headed for the remote store: the partition it belongs to,
/// its metadata, and the encoded columns (timestamps first).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSetData {
    /// Owning series.
    pub partition: PartitionKey,
    /// Chunk set metadata; also the source of the index row.
    pub info: ChunkInfo,
    /// Encoded column chunks, timestamp column first.
    pub columns: Vec<Vec<u8>>,
}

impl ChunkSetData {
    /// Frame the columns into the single `chunks` blob of the chunk table:
    /// a `u16` column count, `u32` lengths, then the column bytes.
    pub fn encode_columns_blob(&self) -> Vec<u8> {
        let total: usize = self.columns.iter().map(|c| c.len()).sum();
        let mut buf = Vec::with_capacity(2 + self.columns.len() * 4 + total);
        buf.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        for col in &self.columns {
            buf.extend_from_slice(&(col.len() as u32).to_le_bytes());
        }
        for col in &self.columns {
            buf.extend_from_slice(col);
        }
        buf
    }

    /// Split a `chunks` blob back into per-column bytes.
    pub fn decode_columns_blob(blob: &[u8]) -> Result<Vec<Vec<u8>>> {
        ensure!(
            blob.len() >= 2,
            MalformedChunkBlobSnafu {
                reason: "missing column count",
            }
        );
        let num_cols = u16::from_le_bytes(blob[0..2].try_into().unwrap()) as usize;
        let lens_end = 2 + num_cols * 4;
        ensure!(
            blob.len() >= lens_end,
            MalformedChunkBlobSnafu {
                reason: "truncated length table",
            }
        );
        let lens: Vec<usize> = (0..num_cols)
            .map(|i| u32::from_le_bytes(blob[2 + i * 4..6 + i * 4].try_into().unwrap()) as usize)
            .collect();
        let mut pos = lens_end;
        let mut out = Vec::with_capacity(num_cols);
        for len in lens {
            ensure!(
                blob.len() >= pos + len,
                MalformedChunkBlobSnafu {
                    reason: "truncated column bytes",
                }
            );
            out.push(blob[pos..pos + len].to_vec());
            pos += len;
        }
        Ok(out)
    }
}

/// One chunk set read back from the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunkSetData {
    /// Decoded chunk set metadata.
    pub info: ChunkInfo,
    /// Encoded column chunks, timestamp column first.
    pub columns: Vec<Vec<u8>>,
}

/// All chunk sets of one partition returned by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPartData {
    /// The partition's serialized key.
    pub partition: PartitionKey,
    /// Chunk sets ordered by chunk id.
    pub chunk_sets: Vec<RawChunkSetData>,
}

/// A persisted partition-key directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartKeyRecord {
    /// Serialized partition key.
    pub part_key: PartitionKey,
    /// User time of the series' first sample.
    pub start_time: i64,
    /// User time of the last sample, or `i64::MAX` while the series is
    /// live. Live entries are written without a TTL.
    pub end_time: i64,
}

/// A token-range split of the partition key space, tagged with replica
/// locality hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSplit {
    /// First token of the range (inclusive).
    pub token_start: u64,
    /// Last token of the range (inclusive).
    pub token_end: u64,
    /// Hosts holding replicas of this range.
    pub replica_hosts: Vec<String>,
}

/// Which partitions a scan should visit.
#[derive(Debug, Clone, PartialEq)]
pub enum PartScan {
    /// Every partition of one shard.
    Shard(ShardId),
    /// An explicit list of partition keys.
    Keys(Vec<PartitionKey>),
}

/// Which chunks of each visited partition a scan should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkScan {
    /// All chunks.
    All,
    /// Chunks overlapping `[start, end]` in user time.
    UserTime {
        /// Range start (inclusive).
        start: i64,
        /// Range end (inclusive).
        end: i64,
    },
}

/// Write half of the remote store.
#[async_trait]
pub trait ChunkSink: std::fmt::Debug + Send + Sync + 'static {
    /// Create the dataset's tables. Idempotent.
    async fn initialize(&self, dataset: &str, num_shards: u16) -> Result<()>;

    /// Remove all rows of the dataset. Idempotent.
    async fn truncate(&self, dataset: &str) -> Result<()>;

    /// Drop the dataset's tables. Idempotent.
    async fn drop_dataset(&self, dataset: &str) -> Result<()>;

    /// Write a stream of chunk sets under `ttl_seconds`, returning how many
    /// were durably written. Each chunk set lands as its chunk row plus its
    /// index row; a set missing either is not counted.
    async fn write_chunks(
        &self,
        dataset: &str,
        chunk_sets: BoxStream<'static, ChunkSetData>,
        ttl_seconds: u32,
    ) -> Result<usize>;

    /// Write partition-key directory entries. Records with
    /// `end_time == i64::MAX` are written without a TTL.
    async fn write_part_keys(
        &self,
        dataset: &str,
        shard: ShardId,
        records: Vec<PartKeyRecord>,
        ttl_seconds: u32,
    ) -> Result<()>;
}

/// Read half of the remote store.
#[async_trait]
pub trait ChunkSource: std::fmt::Debug + Send + Sync + 'static {
    /// Scan raw partitions. Chunks are filtered to
    /// `[start - max_chunk_time, end]` in user time so that the chunk
    /// containing the earliest relevant sample is always included.
    async fn read_raw_partitions(
        &self,
        dataset: &str,
        max_chunk_time: i64,
        part_scan: PartScan,
        chunk_scan: ChunkScan,
    ) -> Result<BoxStream<'static, Result<RawPartData>>>;

    /// Scan chunk sets by ingestion time for downsampling and repair.
    /// `ing_end` and `user_end` are exclusive. Partitions are emitted in
    /// batches of at most `batch_size`.
    #[allow(clippy::too_many_arguments)]
    async fn chunks_by_ingestion_time(
        &self,
        dataset: &str,
        splits: Vec<ScanSplit>,
        ing_start: i64,
        ing_end: i64,
        user_start: i64,
        user_end: i64,
        max_chunk_time: i64,
        batch_size: usize,
    ) -> Result<BoxStream<'static, Result<Vec<RawPartData>>>>;

    /// Token-range splits covering the whole key space, disjoint, tagged
    /// with replica hosts.
    async fn scan_splits(&self, dataset: &str, splits_per_node: usize) -> Result<Vec<ScanSplit>>;

    /// Stream the partition-key directory of one shard, for index rebuild.
    async fn scan_part_keys(
        &self,
        dataset: &str,
        shard: ShardId,
    ) -> Result<BoxStream<'static, Result<PartKeyRecord>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::ChunkId;

    #[test]
    fn test_columns_blob_round_trip() {
        let data = ChunkSetData {
            partition: PartitionKey::from_labels([("a", "1")]),
            info: ChunkInfo {
                chunk_id: ChunkId::new(100, 0),
                start_time: 100,
                end_time: 200,
                ingestion_time: 300,
                num_rows: 2,
            },
            columns: vec![vec![1, 2, 3], vec![], vec![9, 9]],
        };
        let blob = data.encode_columns_blob();
        let cols = ChunkSetData::decode_columns_blob(&blob).unwrap();
        assert_eq!(cols, data.columns);
    }

    #[test]
    fn test_columns_blob_rejects_truncation() {
        let data = ChunkSetData {
            partition: PartitionKey::from_labels([("a", "1")]),
            info: ChunkInfo {
                chunk_id: ChunkId::new(100, 0),
                start_time: 100,
                end_time: 200,
                ingestion_time: 300,
                num_rows: 2,
            },
            columns: vec![vec![1, 2, 3]],
        };
        let mut blob = data.encode_columns_blob();
        blob.truncate(blob.len() - 1);
        assert_matches!(
            ChunkSetData::decode_columns_blob(&blob),
            Err(StoreError::MalformedChunkBlob { .. })
        );
    }
}
