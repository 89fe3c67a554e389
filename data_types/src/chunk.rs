//! Chunk identity and metadata.

use snafu::{ensure, Snafu};

/// Number of low bits of a [`ChunkId`] reserved for the sequence counter.
const SEQ_BITS: u32 = 10;
const SEQ_MASK: i64 = (1 << SEQ_BITS) - 1;

/// Serialized length of a [`ChunkInfo`].
pub const CHUNK_INFO_ENCODED_LEN: usize = 36;

/// Identifier of one chunk set within a partition.
///
/// Time-encoded: the chunk's user-time start occupies the high bits, a
/// per-partition sequence counter the low [`SEQ_BITS`] bits, so for any two
/// chunks `id(t1) > id(t2) ⇔ t1 > t2` and ids stay unique when several
/// chunks share a start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(i64);

impl ChunkId {
    /// Build an id from a chunk start time (epoch ms) and a sequence number.
    pub fn new(start_time: i64, seq: u16) -> Self {
        Self((start_time << SEQ_BITS) | (i64::from(seq) & SEQ_MASK))
    }

    /// Reconstruct from the raw encoded value.
    pub fn from_i64(v: i64) -> Self {
        Self(v)
    }

    /// The raw encoded value.
    pub fn get(&self) -> i64 {
        self.0
    }

    /// The user-time start encoded in the id.
    pub fn start_time(&self) -> i64 {
        self.0 >> SEQ_BITS
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decode errors for [`ChunkInfo`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ChunkInfoError {
    #[snafu(display("chunk info blob has length {}, expected {}", len, CHUNK_INFO_ENCODED_LEN))]
    BadLength { len: usize },
}

/// Metadata shared by all column chunks of one chunk set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Monotonic, time-encoded chunk identifier.
    pub chunk_id: ChunkId,
    /// User time of the first row (inclusive).
    pub start_time: i64,
    /// User time of the last row (inclusive).
    pub end_time: i64,
    /// Wall-clock time the data entered the system.
    pub ingestion_time: i64,
    /// Number of rows in each column chunk of the set.
    pub num_rows: u32,
}

impl ChunkInfo {
    /// Serialize to the fixed-layout `info` blob stored in the remote index
    /// row: four little-endian `i64`s followed by a `u32`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CHUNK_INFO_ENCODED_LEN);
        buf.extend_from_slice(&self.chunk_id.get().to_le_bytes());
        buf.extend_from_slice(&self.start_time.to_le_bytes());
        buf.extend_from_slice(&self.end_time.to_le_bytes());
        buf.extend_from_slice(&self.ingestion_time.to_le_bytes());
        buf.extend_from_slice(&self.num_rows.to_le_bytes());
        buf
    }

    /// Decode an `info` blob.
    pub fn decode(buf: &[u8]) -> Result<Self, ChunkInfoError> {
        ensure!(
            buf.len() == CHUNK_INFO_ENCODED_LEN,
            BadLengthSnafu { len: buf.len() }
        );
        let i64_at = |off: usize| i64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        Ok(Self {
            chunk_id: ChunkId::from_i64(i64_at(0)),
            start_time: i64_at(8),
            end_time: i64_at(16),
            ingestion_time: i64_at(24),
            num_rows: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_chunk_id_monotonic_with_time() {
        let a = ChunkId::new(1_000, 5);
        let b = ChunkId::new(2_000, 0);
        assert!(b > a);
        assert_eq!(a.start_time(), 1_000);
        assert_eq!(b.start_time(), 2_000);
    }

    #[test]
    fn test_chunk_id_seq_breaks_ties() {
        let a = ChunkId::new(1_000, 0);
        let b = ChunkId::new(1_000, 1);
        assert!(b > a);
        assert_eq!(a.start_time(), b.start_time());
    }

    #[test]
    fn test_chunk_info_round_trip() {
        let info = ChunkInfo {
            chunk_id: ChunkId::new(10_000, 3),
            start_time: 10_000,
            end_time: 19_990,
            ingestion_time: 25_000,
            num_rows: 720,
        };
        let blob = info.encode();
        assert_eq!(blob.len(), CHUNK_INFO_ENCODED_LEN);
        assert_eq!(ChunkInfo::decode(&blob).unwrap(), info);
    }

    #[test]
    fn test_chunk_info_rejects_bad_length() {
        assert_matches!(
            ChunkInfo::decode(&[0u8; 7]),
            Err(ChunkInfoError::BadLength { len: 7 })
        );
    }
}
