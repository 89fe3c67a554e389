//! A shard: one contiguous slice of the partition-key hash space.
//!
//! Ingest is single-writer per shard; reads are concurrent. The shard owns
//! the partition directory, the inverted index, the write-buffer pool and
//! block memory, and the flush-group schedule.

use crate::index::PartKeyIndex;
use crate::partition::{ChunkState, Partition, PartitionChunks};
use crate::{
    ChunkScanMethod, Error, PartLookupMethod, Result, StoreConfig, TooManyPartitionsSnafu,
};
use backoff::{Backoff, BackoffConfig};
use chunk_format::block::BlockManager;
use chunk_format::pool::{BufferPool, ValueKind};
use chunk_store::{ChunkScan, ChunkSink, ChunkSource, PartKeyRecord, PartScan};
use croaring::Bitmap;
use dashmap::DashMap;
use data_types::{
    ColumnType, Dataset, IngestRecord, PartitionId, PartitionKey, RecordContainer, ShardId,
    TimeRange,
};
use futures::stream::{self, StreamExt};
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use prism_time::TimeProvider;
use snafu::ensure;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Plain counters tracking non-fatal ingest events. Logged at flush
/// boundaries rather than thrown.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// Rows accepted.
    pub rows_ingested: AtomicU64,
    /// Rows dropped for violating timestamp order.
    pub rows_out_of_order: AtomicU64,
    /// Rows dropped for not matching the schema's value columns.
    pub rows_schema_mismatch: AtomicU64,
    /// Flush rounds that wrote all their chunk sets.
    pub flushes_completed: AtomicU64,
    /// Flush rounds abandoned after retries.
    pub flush_failures: AtomicU64,
    /// Chunk sets written to the remote store.
    pub chunks_flushed: AtomicU64,
    /// Partitions created.
    pub partitions_created: AtomicU64,
    /// Partitions whose chunks were evicted.
    pub partitions_evicted: AtomicU64,
    /// On-demand paging reads served.
    pub odp_reads: AtomicU64,
}

/// Everything the query engine needs from one matched partition.
#[derive(Debug)]
pub struct PartitionReadHandle {
    /// The series key.
    pub key: PartitionKey,
    /// Dense partition id.
    pub id: PartitionId,
    /// Decoded label pairs.
    pub labels: BTreeMap<String, String>,
    /// Chunk sets overlapping the scan range, ordered by chunk id.
    pub chunks: Vec<Arc<crate::partition::ChunkSetReaders>>,
}

/// One shard of a dataset.
pub struct Shard {
    dataset: Dataset,
    shard_id: ShardId,
    config: StoreConfig,
    value_kinds: Vec<ValueKind>,
    time_provider: Arc<dyn TimeProvider>,

    partitions: DashMap<PartitionKey, Arc<Partition>>,
    by_id: DashMap<PartitionId, Arc<Partition>>,
    next_partition_id: AtomicU32,

    index: PartKeyIndex,
    pool: BufferPool,
    blocks: BlockManager,

    sink: Arc<dyn ChunkSink>,
    source: Option<Arc<dyn ChunkSource>>,

    /// Directory entries created since the last flush, persisted with it.
    pending_part_keys: Mutex<Vec<PartKeyRecord>>,
    /// Per-group pause flags set by the flush supervisor after persistent
    /// write failure.
    group_paused: Vec<AtomicBool>,

    /// Ingest and flush counters.
    pub metrics: IngestMetrics,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("dataset", &self.dataset.name)
            .field("shard_id", &self.shard_id)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl Shard {
    /// Build a shard for `dataset`.
    pub fn new(
        dataset: Dataset,
        shard_id: ShardId,
        config: StoreConfig,
        sink: Arc<dyn ChunkSink>,
        source: Option<Arc<dyn ChunkSource>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self> {
        let value_kinds = dataset
            .schema
            .value_columns()
            .map(|(_, c)| match c.column_type {
                ColumnType::Double => Ok(ValueKind::Double),
                ColumnType::Histogram => Ok(ValueKind::Histogram),
                other => Err(Error::UnsupportedValueColumn {
                    column: c.name.clone(),
                    column_type: other,
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        let pool = BufferPool::new(config.num_buffer_sets(), value_kinds.clone());
        let blocks = BlockManager::new(config.shard_mem_size);
        let group_paused = (0..config.groups_per_shard.max(1))
            .map(|_| AtomicBool::new(false))
            .collect();

        Ok(Self {
            dataset,
            shard_id,
            config,
            value_kinds,
            time_provider,
            partitions: DashMap::new(),
            by_id: DashMap::new(),
            next_partition_id: AtomicU32::new(0),
            index: PartKeyIndex::new(),
            pool,
            blocks,
            sink,
            source,
            pending_part_keys: Mutex::new(Vec::new()),
            group_paused,
            metrics: IngestMetrics::default(),
        })
    }

    /// The shard id.
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Number of partitions in the directory (resident or stub).
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Number of flush groups the shard staggers its flushes across.
    pub fn num_flush_groups(&self) -> usize {
        self.config.groups_per_shard.max(1)
    }

    fn group_of(&self, id: PartitionId) -> usize {
        id.get() as usize % self.config.groups_per_shard.max(1)
    }

    fn get_or_create_partition(&self, record: &IngestRecord) -> Result<Arc<Partition>> {
        let key = record.partition_key();
        if let Some(p) = self.partitions.get(&key) {
            return Ok(Arc::clone(&p));
        }

        ensure!(
            self.partitions.len() < self.config.max_num_partitions,
            TooManyPartitionsSnafu {
                limit: self.config.max_num_partitions,
            }
        );

        let partition = Arc::clone(
            self.partitions
                .entry(key.clone())
                .or_insert_with(|| {
                    let id = PartitionId::new(
                        self.next_partition_id.fetch_add(1, Ordering::Relaxed),
                    );
                    let partition =
                        Arc::new(Partition::new(key.clone(), id, self.value_kinds.clone()));
                    self.index.add_partition(id, record.labels.clone());
                    self.pending_part_keys.lock().push(PartKeyRecord {
                        part_key: key.clone(),
                        start_time: record.timestamp,
                        end_time: i64::MAX,
                    });
                    self.metrics.partitions_created.fetch_add(1, Ordering::Relaxed);
                    partition
                })
                .value(),
        );
        self.by_id.insert(partition.id(), Arc::clone(&partition));
        Ok(partition)
    }

    /// Ingest one record container. Out-of-order and schema-mismatch rows
    /// are counted and dropped; pool exhaustion and paused flush groups
    /// surface as errors so the caller can apply backpressure.
    pub fn ingest(&self, container: &RecordContainer) -> Result<()> {
        let records = container
            .records()
            .map_err(|source| Error::Record { source })?;
        let ingestion_time = self.time_provider.now().timestamp_millis();

        for record in &records {
            if record.values.len() != self.value_kinds.len() {
                self.metrics
                    .rows_schema_mismatch
                    .fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let partition = self.get_or_create_partition(record)?;
            let group = self.group_of(partition.id());
            ensure!(
                !self.group_paused[group].load(Ordering::Relaxed),
                crate::FlushGroupPausedSnafu { group }
            );

            match partition.ingest(
                record.timestamp,
                &record.values,
                ingestion_time,
                &self.pool,
                &self.blocks,
            ) {
                Ok(_sealed) => {
                    self.metrics.rows_ingested.fetch_add(1, Ordering::Relaxed);
                }
                Err(Error::OutOfOrderSample { .. }) => {
                    self.metrics
                        .rows_out_of_order
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }

            // cap chunk size; sealed chunks wait for the group flush
            if partition.buffered_rows() >= self.config.max_chunks_size {
                partition.switch_buffers(true, &self.pool, &self.blocks, ingestion_time)?;
            }
        }

        // container boundaries are the index commit points
        self.index.commit();
        Ok(())
    }

    /// Seal and persist every dirty partition of one flush group.
    pub async fn flush_group(&self, group: usize) -> Result<usize> {
        let ingestion_time = self.time_provider.now().timestamp_millis();

        let members: Vec<Arc<Partition>> = self
            .partitions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .filter(|p| self.group_of(p.id()) == group)
            .collect();

        let mut chunk_sets = Vec::new();
        for partition in &members {
            if partition.has_buffered_rows() {
                partition.switch_buffers(true, &self.pool, &self.blocks, ingestion_time)?;
            }
            chunk_sets.extend(partition.unpersisted());
        }

        let part_keys: Vec<PartKeyRecord> =
            std::mem::take(&mut *self.pending_part_keys.lock());

        if chunk_sets.is_empty() && part_keys.is_empty() {
            return Ok(0);
        }

        let ttl = self.config.disk_ttl.as_secs() as u32;
        let dataset = self.dataset.name.clone();

        if !part_keys.is_empty() {
            let sink = Arc::clone(&self.sink);
            let shard_id = self.shard_id;
            let result = Backoff::new(&BackoffConfig::default())
                .retry_all_errors("write_part_keys", || {
                    let sink = Arc::clone(&sink);
                    let dataset = dataset.clone();
                    let part_keys = part_keys.clone();
                    async move {
                        sink.write_part_keys(&dataset, shard_id, part_keys, ttl)
                            .await
                    }
                })
                .await;
            if let Err(e) = result {
                // keys go back for the next round; chunk flush continues
                warn!(shard=%self.shard_id, error=%e, "part key write failed, requeueing");
                self.pending_part_keys.lock().extend(part_keys);
            }
        }

        let written = {
            let sink = Arc::clone(&self.sink);
            let sets = chunk_sets.clone();
            Backoff::new(&BackoffConfig::default())
                .retry_all_errors("write_chunks", || {
                    let sink = Arc::clone(&sink);
                    let dataset = dataset.clone();
                    let sets = sets.clone();
                    async move {
                        sink.write_chunks(&dataset, stream::iter(sets).boxed(), ttl)
                            .await
                    }
                })
                .await
        };

        match written {
            Ok(count) => {
                for set in &chunk_sets {
                    if let Some(p) = self.partitions.get(&set.partition) {
                        p.mark_persisted(set.info.chunk_id);
                    }
                }
                self.group_paused[group].store(false, Ordering::Relaxed);
                self.metrics
                    .flushes_completed
                    .fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .chunks_flushed
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(
                    shard = %self.shard_id,
                    group,
                    chunks = count,
                    "flush group persisted"
                );
                self.maybe_evict();
                Ok(count)
            }
            Err(e) => {
                // persistent failure: pause the group until a flush succeeds
                self.group_paused[group].store(true, Ordering::Relaxed);
                self.metrics.flush_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    shard = %self.shard_id,
                    group,
                    error = %e,
                    "flush group failed after retries, pausing ingest for group"
                );
                Err(Error::FlushFailed {
                    group,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Evict least-recently-queried partitions once resident chunk counts
    /// cross the configured thresholds. Evicted partitions stay in the
    /// index as stubs and re-hydrate through on-demand paging.
    fn maybe_evict(&self) {
        let total_chunks: usize = self
            .partitions
            .iter()
            .map(|e| e.value().num_chunks())
            .sum();
        let max_chunks = self.config.chunks_to_keep * self.partitions.len().max(1);
        if total_chunks <= max_chunks && self.blocks.used_bytes() <= self.config.shard_mem_size {
            return;
        }

        let mut candidates: Vec<Arc<Partition>> = self
            .partitions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .filter(|p| p.num_chunks() > 0)
            .collect();
        candidates.sort_by_key(|p| p.last_queried());

        let mut to_free = total_chunks.saturating_sub(max_chunks).max(1);
        for partition in candidates {
            if to_free == 0 {
                break;
            }
            let dropped = partition.evict_chunks();
            if dropped > 0 {
                to_free = to_free.saturating_sub(dropped);
                self.metrics
                    .partitions_evicted
                    .fetch_add(1, Ordering::Relaxed);
                debug!(partition = %partition.key(), dropped, "evicted chunks");
            }
        }
    }

    /// Install an index-only stub for a partition known to the remote
    /// store but absent from the directory; on-demand paging fills it.
    fn create_stub(&self, key: &PartitionKey) -> Arc<Partition> {
        let partition = Arc::clone(
            self.partitions
                .entry(key.clone())
                .or_insert_with(|| {
                    let id = PartitionId::new(
                        self.next_partition_id.fetch_add(1, Ordering::Relaxed),
                    );
                    let partition =
                        Arc::new(Partition::new(key.clone(), id, self.value_kinds.clone()));
                    self.index.add_partition(
                        id,
                        key.labels().into_iter().collect(),
                    );
                    partition
                })
                .value(),
        );
        self.by_id.insert(partition.id(), Arc::clone(&partition));
        self.index.commit();
        partition
    }

    fn lookup_by_method(&self, method: &PartLookupMethod) -> Result<Vec<Arc<Partition>>> {
        let stub_missing = self.config.demand_paging_enabled && self.config.multi_partition_odp;
        let lookup = |key: &PartitionKey| -> Option<Arc<Partition>> {
            match self.partitions.get(key) {
                Some(p) => Some(Arc::clone(&p)),
                None if stub_missing => Some(self.create_stub(key)),
                None => None,
            }
        };
        match method {
            PartLookupMethod::Single(key) => Ok(lookup(key).into_iter().collect()),
            PartLookupMethod::Multi(keys) => Ok(keys.iter().filter_map(lookup).collect()),
            PartLookupMethod::Filtered(filters) => {
                let snapshot = self.index.snapshot();
                let ids: Bitmap = snapshot.resolve(filters)?;
                Ok(ids
                    .iter()
                    .filter_map(|id| {
                        self.by_id
                            .get(&PartitionId::new(id))
                            .map(|p| Arc::clone(&p))
                    })
                    .collect())
            }
        }
    }

    /// Scan partitions for the query engine, paging evicted chunks back in
    /// from the remote store when the range requires it.
    pub async fn scan(
        &self,
        part_method: &PartLookupMethod,
        chunk_method: &ChunkScanMethod,
    ) -> Result<Vec<PartitionReadHandle>> {
        let range = match chunk_method {
            ChunkScanMethod::All => TimeRange::ALL,
            ChunkScanMethod::TimeRange(r) => *r,
        };
        let now = self.time_provider.now().timestamp_millis();
        let max_chunk_time = self.config.flush_interval.as_millis() as i64;

        let partitions = self.lookup_by_method(part_method)?;
        let mut handles = Vec::with_capacity(partitions.len());
        for partition in partitions {
            partition.touch(now);
            let mut chunks = partition.reader(range)?;

            if chunks.missing_earlier && self.config.demand_paging_enabled {
                if let Some(source) = &self.source {
                    self.page_in(source, &partition, range, max_chunk_time)
                        .await?;
                    chunks = partition.reader(range)?;
                }
            }

            handles.push(self.handle_for(&partition, chunks));
        }
        Ok(handles)
    }

    async fn page_in(
        &self,
        source: &Arc<dyn ChunkSource>,
        partition: &Arc<Partition>,
        range: TimeRange,
        max_chunk_time: i64,
    ) -> Result<()> {
        self.metrics.odp_reads.fetch_add(1, Ordering::Relaxed);
        info!(partition = %partition.key(), "paging chunks from remote store");

        let mut parts = source
            .read_raw_partitions(
                &self.dataset.name,
                max_chunk_time,
                PartScan::Keys(vec![partition.key().clone()]),
                ChunkScan::UserTime {
                    start: range.start,
                    end: range.end,
                },
            )
            .await
            .map_err(|source| Error::Store { source })?;

        while let Some(raw) = parts.next().await {
            let raw = raw.map_err(|source| Error::Store { source })?;
            for chunk_set in raw.chunk_sets {
                partition.rehydrate(chunk_set)?;
            }
        }
        Ok(())
    }

    fn handle_for(
        &self,
        partition: &Arc<Partition>,
        chunks: PartitionChunks,
    ) -> PartitionReadHandle {
        let mut visible: Vec<_> = chunks
            .chunks
            .into_iter()
            .filter(|c| matches!(c.state(), ChunkState::Encoded | ChunkState::Persisted))
            .collect();
        visible.sort_by_key(|c| c.info.chunk_id);
        PartitionReadHandle {
            key: partition.key().clone(),
            id: partition.id(),
            labels: partition.key().labels(),
            chunks: visible,
        }
    }

    /// Drop one partition's persisted chunks now, leaving an index stub.
    /// Operational hook; the scheduled eviction normally does this.
    pub fn evict_partition_chunks(&self, key: &PartitionKey) -> usize {
        let Some(partition) = self.partitions.get(key).map(|p| Arc::clone(&p)) else {
            return 0;
        };
        let dropped = partition.evict_chunks();
        if dropped > 0 {
            self.metrics
                .partitions_evicted
                .fetch_add(1, Ordering::Relaxed);
        }
        dropped
    }

    /// Committed values of one label.
    pub fn label_values(&self, label: &str) -> Vec<String> {
        self.index.snapshot().label_values(label)
    }

    /// Partition keys matching the filters in the committed index.
    pub fn part_keys_by_filters(
        &self,
        filters: &[data_types::ColumnFilter],
    ) -> Result<Vec<PartitionKey>> {
        let snapshot = self.index.snapshot();
        let ids = snapshot.resolve(filters)?;
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.by_id
                    .get(&PartitionId::new(id))
                    .map(|p| p.value().key().clone())
            })
            .collect())
    }

    /// Register a flush listener on a partition; fires on its next
    /// successful persistence write.
    pub fn flush_listener(
        &self,
        key: &PartitionKey,
    ) -> Option<tokio::sync::oneshot::Receiver<()>> {
        self.partitions.get(key).map(|p| p.register_flush_listener())
    }

    /// Rebuild the index from the remote partition-key directory,
    /// installing stubs for every series this shard has ever persisted.
    /// Used on restart before serving queries.
    pub async fn recover_index(&self) -> Result<usize> {
        let Some(source) = &self.source else {
            return Ok(0);
        };
        let mut records = source
            .scan_part_keys(&self.dataset.name, self.shard_id)
            .await
            .map_err(|source| Error::Store { source })?;

        let mut recovered = 0;
        while let Some(record) = records.next().await {
            let record = record.map_err(|source| Error::Store { source })?;
            self.create_stub(&record.part_key);
            recovered += 1;
        }
        info!(shard = %self.shard_id, recovered, "index recovered from part keys");
        Ok(recovered)
    }

    /// Drive the staggered flush schedule until cancelled. One group
    /// flushes every `flush_interval / groups`.
    pub async fn run_flush_schedule(self: Arc<Self>, cancel: CancellationToken) {
        let groups = self.config.groups_per_shard.max(1);
        let tick = self.config.flush_interval / groups as u32;
        let mut group = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(shard = %self.shard_id, "flush schedule stopping");
                    return;
                }
                _ = tokio::time::sleep(tick) => {}
            }
            if let Err(e) = self.flush_group(group).await {
                warn!(shard = %self.shard_id, group, error = %e, "scheduled flush failed");
            }
            group = (group + 1) % groups;
        }
    }
}
