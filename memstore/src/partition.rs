//! The in-memory residency of one time series on one shard.
//!
//! A partition holds an ordered map of sealed, read-only chunk sets plus at
//! most one mutable write-buffer set accepting appends. Chunk sets move
//! through `Filling → Sealed → Encoded → Persisted`; only `Encoded` and
//! later states are visible to readers other than the partition's own.

use crate::{Error, OutOfOrderSampleSnafu, Result};
use chunk_format::block::{BlockManager, BlockRef};
use chunk_format::pool::{BufferPool, ValueKind, ValueReader, WriteBufferSet};
use chunk_format::TimestampReader;
use chunk_store::{ChunkSetData, RawChunkSetData};
use data_types::{ChunkId, ChunkInfo, PartitionId, PartitionKey, TimeRange};
use observability_deps::tracing::{debug, trace};
use parking_lot::{Mutex, RwLock};
use snafu::ensure;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Lifecycle state of one chunk set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Sealed and compressed into block memory; queryable, not yet durable.
    Encoded,
    /// Written to the remote store; evictable once cold.
    Persisted,
}

/// One sealed chunk set with its decoded-on-demand column readers.
///
/// Holds the encoded column bytes (timestamps first) alongside the parsed
/// readers; the refs keep the backing block resident for as long as any
/// reader of this chunk set is alive.
#[derive(Debug)]
pub struct ChunkSetReaders {
    /// Shared chunk set metadata.
    pub info: ChunkInfo,
    /// Timestamp column reader.
    pub timestamps: TimestampReader,
    /// Value column readers, in schema order.
    pub values: Vec<ValueReader>,
    column_refs: Vec<BlockRef>,
    state: Mutex<ChunkState>,
}

impl ChunkSetReaders {
    /// Current lifecycle state.
    pub fn state(&self) -> ChunkState {
        *self.state.lock()
    }

    fn mark_persisted(&self) {
        *self.state.lock() = ChunkState::Persisted;
    }

    fn columns_copy(&self) -> Vec<Vec<u8>> {
        self.column_refs
            .iter()
            .map(|r| r.as_slice().to_vec())
            .collect()
    }
}

/// Result of opening a partition reader over a time range.
#[derive(Debug)]
pub struct PartitionChunks {
    /// Chunk sets overlapping the range, ordered by chunk id. Includes a
    /// snapshot of the live write buffer when it overlaps.
    pub chunks: Vec<Arc<ChunkSetReaders>>,
    /// True when the range extends earlier than the in-memory frontier and
    /// the remote store may hold further chunks.
    pub missing_earlier: bool,
}

#[derive(Debug, Default)]
struct PartitionState {
    buffer: Option<WriteBufferSet>,
    buffer_ingestion_time: i64,
    /// Buffers sealed without encoding. Closed to appends and still
    /// invisible to readers until an encoding `switch_buffers` runs.
    sealed: Vec<(WriteBufferSet, i64)>,
    chunks: BTreeMap<ChunkId, Arc<ChunkSetReaders>>,
    chunk_seq: u16,
    /// Earliest user time this partition has ever held in memory; reads
    /// before it require on-demand paging.
    frontier: i64,
    flush_listeners: Vec<oneshot::Sender<()>>,
}

/// One time series resident on one shard.
#[derive(Debug)]
pub struct Partition {
    key: PartitionKey,
    id: PartitionId,
    value_kinds: Vec<ValueKind>,
    state: RwLock<PartitionState>,
    last_ingested: AtomicI64,
    /// Wall-clock ms of the last query touching this partition; drives the
    /// shard's least-recently-queried eviction.
    last_queried: AtomicI64,
}

impl Partition {
    /// A new, empty partition.
    pub fn new(key: PartitionKey, id: PartitionId, value_kinds: Vec<ValueKind>) -> Self {
        Self {
            key,
            id,
            value_kinds,
            state: RwLock::new(PartitionState {
                frontier: i64::MAX,
                ..Default::default()
            }),
            last_ingested: AtomicI64::new(i64::MIN),
            last_queried: AtomicI64::new(0),
        }
    }

    /// The series key.
    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    /// The dense partition id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// User time of the last accepted sample.
    pub fn last_ingested(&self) -> i64 {
        self.last_ingested.load(Ordering::Relaxed)
    }

    /// Record a query touch for eviction ordering.
    pub fn touch(&self, now_ms: i64) {
        self.last_queried.store(now_ms, Ordering::Relaxed);
    }

    /// Wall-clock ms of the last query touch.
    pub fn last_queried(&self) -> i64 {
        self.last_queried.load(Ordering::Relaxed)
    }

    /// Whether a live or sealed write buffer holds rows awaiting encode.
    pub fn has_buffered_rows(&self) -> bool {
        let state = self.state.read();
        !state.sealed.is_empty()
            || state.buffer.as_ref().map(|b| !b.is_empty()).unwrap_or(false)
    }

    /// Number of resident chunk sets.
    pub fn num_chunks(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// Append one row.
    ///
    /// Timestamps must be strictly increasing; violations are rejected with
    /// [`Error::OutOfOrderSample`] and leave no trace. A histogram bucket
    /// scheme change seals the current buffer and retries on a fresh one.
    pub fn ingest(
        &self,
        ts: i64,
        values: &[data_types::ColumnValue],
        ingestion_time: i64,
        pool: &BufferPool,
        blocks: &BlockManager,
    ) -> Result<Option<ChunkSetData>> {
        let last = self.last_ingested.load(Ordering::Relaxed);
        ensure!(
            ts > last,
            OutOfOrderSampleSnafu {
                partition: self.key.to_string(),
                ts,
                last,
            }
        );

        let mut sealed = None;
        let mut state = self.state.write();
        if state.buffer.is_none() {
            let buffer = pool.acquire().ok_or(Error::BufferPoolExhausted)?;
            state.buffer = Some(buffer);
            state.buffer_ingestion_time = ingestion_time;
        }

        let buffer = state.buffer.as_mut().expect("buffer just ensured");
        match buffer.append_row(ts, values) {
            Ok(()) => {}
            Err(chunk_format::CodecError::SchemeMismatch { .. }) => {
                // seal the old scheme's chunk, then retry on a fresh buffer
                trace!(partition=%self.key, "bucket scheme changed, sealing chunk");
                sealed = self.seal_locked(&mut state, pool, blocks, ingestion_time)?;
                if state.buffer.is_none() {
                    let b = pool.acquire().ok_or(Error::BufferPoolExhausted)?;
                    state.buffer_ingestion_time = ingestion_time;
                    state.buffer = Some(b);
                }
                state
                    .buffer
                    .as_mut()
                    .expect("buffer just ensured")
                    .append_row(ts, values)
                    .map_err(|source| Error::Codec { source })?;
            }
            Err(source) => return Err(Error::Codec { source }),
        }

        let first_ts = state.buffer.as_ref().expect("buffer present").first_ts();
        state.frontier = state.frontier.min(first_ts);
        drop(state);

        self.last_ingested.store(ts, Ordering::Relaxed);
        Ok(sealed)
    }

    /// Rows currently in the live write buffer.
    pub fn buffered_rows(&self) -> u32 {
        self.state
            .read()
            .buffer
            .as_ref()
            .map(|b| b.num_rows())
            .unwrap_or(0)
    }

    /// Seal the current write buffers. With `encode`, also compress every
    /// sealed buffer into block memory and append the resulting chunk sets
    /// to the chunk map; without it, buffers close to appends but stay
    /// invisible to readers until a later encoding call.
    ///
    /// Safe to call concurrently with readers; new chunks become visible
    /// atomically with the buffer hand-back.
    pub fn switch_buffers(
        &self,
        encode: bool,
        pool: &BufferPool,
        blocks: &BlockManager,
        ingestion_time: i64,
    ) -> Result<Vec<ChunkSetData>> {
        let mut state = self.state.write();

        if !encode {
            if let Some(buffer) = state.buffer.take() {
                if buffer.is_empty() {
                    pool.release(buffer);
                } else {
                    let sealed_at = state.buffer_ingestion_time;
                    state.sealed.push((buffer, sealed_at));
                }
            }
            return Ok(vec![]);
        }

        let mut out = Vec::new();
        let pending: Vec<_> = state.sealed.drain(..).collect();
        for (buffer, sealed_at) in pending {
            if let Some(cs) =
                self.encode_locked(&mut state, buffer, sealed_at, pool, blocks)?
            {
                out.push(cs);
            }
        }
        if let Some(buffer) = state.buffer.take() {
            if buffer.is_empty() {
                pool.release(buffer);
            } else {
                let sealed_at = state.buffer_ingestion_time.max(ingestion_time);
                if let Some(cs) =
                    self.encode_locked(&mut state, buffer, sealed_at, pool, blocks)?
                {
                    out.push(cs);
                }
            }
        }
        Ok(out)
    }

    /// Seal and encode the current buffer only; used when a scheme change
    /// forces a chunk cut mid-ingest.
    fn seal_locked(
        &self,
        state: &mut PartitionState,
        pool: &BufferPool,
        blocks: &BlockManager,
        ingestion_time: i64,
    ) -> Result<Option<ChunkSetData>> {
        let Some(buffer) = state.buffer.take() else {
            return Ok(None);
        };
        if buffer.is_empty() {
            pool.release(buffer);
            return Ok(None);
        }
        let sealed_at = state.buffer_ingestion_time.max(ingestion_time);
        self.encode_locked(state, buffer, sealed_at, pool, blocks)
    }

    fn encode_locked(
        &self,
        state: &mut PartitionState,
        buffer: WriteBufferSet,
        ingestion_time: i64,
        pool: &BufferPool,
        blocks: &BlockManager,
    ) -> Result<Option<ChunkSetData>> {
        let info = ChunkInfo {
            chunk_id: ChunkId::new(buffer.first_ts(), state.chunk_seq),
            start_time: buffer.first_ts(),
            end_time: buffer.last_ts(),
            ingestion_time,
            num_rows: buffer.num_rows(),
        };
        state.chunk_seq = state.chunk_seq.wrapping_add(1);

        let columns = buffer.encode_columns();
        let refs = blocks.store(&columns).map_err(|source| Error::BlockMemory { source })?;
        let readers = Self::build_readers(info, &self.value_kinds, refs)?;

        state.chunks.insert(info.chunk_id, Arc::new(readers));
        state.frontier = state.frontier.min(info.start_time);
        pool.release(buffer);

        debug!(
            partition = %self.key,
            chunk_id = %info.chunk_id,
            num_rows = info.num_rows,
            "sealed write buffer into chunk"
        );

        Ok(Some(ChunkSetData {
            partition: self.key.clone(),
            info,
            columns,
        }))
    }

    fn build_readers(
        info: ChunkInfo,
        value_kinds: &[ValueKind],
        refs: Vec<BlockRef>,
    ) -> Result<ChunkSetReaders> {
        let timestamps = TimestampReader::new(refs[0].clone())
            .map_err(|source| Error::Codec { source })?;
        let values = value_kinds
            .iter()
            .zip(refs.iter().skip(1))
            .map(|(kind, r)| ValueReader::new(*kind, r.clone()))
            .collect::<chunk_format::Result<Vec<_>>>()
            .map_err(|source| Error::Codec { source })?;
        Ok(ChunkSetReaders {
            info,
            timestamps,
            values,
            column_refs: refs,
            state: Mutex::new(ChunkState::Encoded),
        })
    }

    /// Install a chunk set paged in from the remote store. Idempotent:
    /// an already-resident chunk id wins.
    pub fn rehydrate(&self, raw: RawChunkSetData) -> Result<()> {
        let mut state = self.state.write();
        if state.chunks.contains_key(&raw.info.chunk_id) {
            return Ok(());
        }
        let mut columns = raw.columns;
        ensure!(
            columns.len() == self.value_kinds.len() + 1,
            crate::SchemaMismatchSnafu {
                reason: format!(
                    "paged chunk has {} columns, schema expects {}",
                    columns.len(),
                    self.value_kinds.len() + 1
                ),
            }
        );
        let refs: Vec<BlockRef> = columns.drain(..).map(BlockRef::unmanaged).collect();
        let readers = Self::build_readers(raw.info, &self.value_kinds, refs)?;
        // paged bytes come off the wire: decode eagerly to surface corruption
        for v in &readers.values {
            v.validate().map_err(|source| Error::Codec { source })?;
        }
        readers.mark_persisted();
        state.frontier = state.frontier.min(raw.info.start_time);
        state.chunks.insert(raw.info.chunk_id, Arc::new(readers));
        Ok(())
    }

    /// Open a reader over all chunk sets overlapping `range`, including a
    /// snapshot of the live write buffer.
    pub fn reader(&self, range: TimeRange) -> Result<PartitionChunks> {
        let state = self.state.read();
        let mut chunks: Vec<Arc<ChunkSetReaders>> = state
            .chunks
            .values()
            .filter(|c| range.overlaps(c.info.start_time, c.info.end_time))
            .map(Arc::clone)
            .collect();

        if let Some(buffer) = &state.buffer {
            if !buffer.is_empty() && range.overlaps(buffer.first_ts(), buffer.last_ts()) {
                let (timestamps, values) = buffer
                    .snapshot_readers()
                    .map_err(|source| Error::Codec { source })?;
                chunks.push(Arc::new(ChunkSetReaders {
                    info: ChunkInfo {
                        chunk_id: ChunkId::new(buffer.first_ts(), u16::MAX),
                        start_time: buffer.first_ts(),
                        end_time: buffer.last_ts(),
                        ingestion_time: state.buffer_ingestion_time,
                        num_rows: buffer.num_rows(),
                    },
                    timestamps,
                    values,
                    column_refs: Vec::new(),
                    state: Mutex::new(ChunkState::Encoded),
                }));
            }
        }

        let missing_earlier = range.start < state.frontier;
        Ok(PartitionChunks {
            chunks,
            missing_earlier,
        })
    }

    /// Register a single-shot callback fired when the next persistence
    /// write for this partition succeeds.
    pub fn register_flush_listener(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.state.write().flush_listeners.push(tx);
        rx
    }

    /// Mark a chunk set durable and fire flush listeners.
    pub fn mark_persisted(&self, chunk_id: ChunkId) {
        let mut state = self.state.write();
        if let Some(chunk) = state.chunks.get(&chunk_id) {
            chunk.mark_persisted();
        }
        for listener in state.flush_listeners.drain(..) {
            let _ = listener.send(());
        }
    }

    /// Chunk sets in `Encoded` state awaiting persistence, as writable
    /// chunk set data (columns copied back out of block memory).
    pub fn unpersisted(&self) -> Vec<ChunkSetData> {
        let state = self.state.read();
        state
            .chunks
            .values()
            .filter(|c| c.state() == ChunkState::Encoded)
            .map(|c| ChunkSetData {
                partition: self.key.clone(),
                info: c.info,
                columns: c.columns_copy(),
            })
            .collect()
    }

    /// Drop all persisted chunk sets, keeping the partition as an
    /// index-resident stub. Returns how many chunk sets were dropped;
    /// chunks not yet persisted are retained.
    pub fn evict_chunks(&self) -> usize {
        let mut state = self.state.write();
        let before = state.chunks.len();
        state
            .chunks
            .retain(|_, c| c.state() != ChunkState::Persisted);
        let dropped = before - state.chunks.len();
        if state.chunks.is_empty() && state.buffer.is_none() {
            state.frontier = i64::MAX;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk_format::pool::ValueKind;
    use data_types::ColumnValue;

    fn fixture() -> (Partition, BufferPool, BlockManager) {
        let partition = Partition::new(
            PartitionKey::from_labels([("app", "x")]),
            PartitionId::new(0),
            vec![ValueKind::Double],
        );
        let pool = BufferPool::new(4, vec![ValueKind::Double]);
        let blocks = BlockManager::new(1024 * 1024);
        (partition, pool, blocks)
    }

    #[test]
    fn test_seal_without_encode_hides_rows() {
        let (partition, pool, blocks) = fixture();
        partition
            .ingest(1_000, &[ColumnValue::Double(1.0)], 10, &pool, &blocks)
            .unwrap();

        // seal only: rows leave the live buffer but are not yet readable
        let sealed = partition
            .switch_buffers(false, &pool, &blocks, 20)
            .unwrap();
        assert!(sealed.is_empty());
        assert!(partition.has_buffered_rows());
        let chunks = partition.reader(TimeRange::ALL).unwrap();
        assert!(chunks.chunks.is_empty());

        // ingest continues into a fresh buffer meanwhile
        partition
            .ingest(2_000, &[ColumnValue::Double(2.0)], 30, &pool, &blocks)
            .unwrap();

        // the encoding switch publishes both the pending sealed buffer
        // and the current one, in order
        let encoded = partition
            .switch_buffers(true, &pool, &blocks, 40)
            .unwrap();
        assert_eq!(encoded.len(), 2);
        assert!(encoded[0].info.chunk_id < encoded[1].info.chunk_id);
        let chunks = partition.reader(TimeRange::ALL).unwrap();
        assert_eq!(chunks.chunks.len(), 2);
    }

    #[test]
    fn test_rehydrate_is_idempotent() {
        let (partition, pool, blocks) = fixture();
        partition
            .ingest(1_000, &[ColumnValue::Double(1.0)], 10, &pool, &blocks)
            .unwrap();
        let encoded = partition
            .switch_buffers(true, &pool, &blocks, 20)
            .unwrap();
        let raw = RawChunkSetData {
            info: encoded[0].info,
            columns: encoded[0].columns.clone(),
        };

        // re-installing a resident chunk id is a no-op
        partition.rehydrate(raw.clone()).unwrap();
        assert_eq!(partition.num_chunks(), 1);

        // after eviction the same bytes hydrate back
        partition.mark_persisted(raw.info.chunk_id);
        assert_eq!(partition.evict_chunks(), 1);
        partition.rehydrate(raw).unwrap();
        assert_eq!(partition.num_chunks(), 1);
        let chunks = partition.reader(TimeRange::ALL).unwrap();
        assert_eq!(chunks.chunks[0].state(), ChunkState::Persisted);
    }

    #[test]
    fn test_out_of_order_rejected_across_seal() {
        let (partition, pool, blocks) = fixture();
        partition
            .ingest(2_000, &[ColumnValue::Double(1.0)], 10, &pool, &blocks)
            .unwrap();
        partition
            .switch_buffers(true, &pool, &blocks, 20)
            .unwrap();

        // ordering is enforced against the partition, not just the buffer
        let err = partition
            .ingest(1_500, &[ColumnValue::Double(2.0)], 30, &pool, &blocks)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfOrderSample { .. }));
    }
}

