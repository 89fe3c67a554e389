//! The write-ahead in-memory store: datasets → shards → partitions.
//!
//! Samples land in per-partition write buffers, seal into compressed
//! columnar chunks on flush deadlines, persist asynchronously to the remote
//! column store, and remain queryable in memory until evicted. Evicted
//! chunks come back through on-demand paging.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod index;
pub mod partition;
pub mod shard;

pub use index::{IndexSnapshot, PartKeyIndex};
pub use partition::{ChunkSetReaders, ChunkState, Partition};
pub use shard::{IngestMetrics, PartitionReadHandle, Shard};

use chunk_store::{ChunkSink, ChunkSource};
use data_types::{
    ColumnFilter, ColumnType, Dataset, PartitionKey, RecordContainer, ShardId, TimeRange,
};
use futures::stream::{BoxStream, StreamExt};
use observability_deps::tracing::{info, warn};
use parking_lot::RwLock;
use prism_time::TimeProvider;
use snafu::Snafu;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Memstore errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "out of order sample for partition {}: ts {} <= last ingested {}",
        partition,
        ts,
        last
    ))]
    OutOfOrderSample {
        partition: String,
        ts: i64,
        last: i64,
    },

    #[snafu(display("schema mismatch: {}", reason))]
    SchemaMismatch { reason: String },

    #[snafu(display("write buffer pool exhausted"))]
    BufferPoolExhausted,

    #[snafu(display("flush group {} is paused after persistent flush failure", group))]
    FlushGroupPaused { group: usize },

    #[snafu(display("flush of group {} failed: {}", group, reason))]
    FlushFailed { group: usize, reason: String },

    #[snafu(display("partition limit {} reached", limit))]
    TooManyPartitions { limit: usize },

    #[snafu(display("dataset '{}' is not set up", dataset))]
    UnknownDataset { dataset: String },

    #[snafu(display("shard {} of dataset '{}' is not set up", shard, dataset))]
    UnknownShard { dataset: String, shard: ShardId },

    #[snafu(display(
        "column '{}' of type {:?} is not a supported value column",
        column,
        column_type
    ))]
    UnsupportedValueColumn {
        column: String,
        column_type: ColumnType,
    },

    #[snafu(display("invalid label regex '{}': {}", pattern, source))]
    BadRegex {
        pattern: String,
        source: regex::Error,
    },

    #[snafu(display("chunk codec error: {}", source))]
    Codec { source: chunk_format::CodecError },

    #[snafu(display("block memory error: {}", source))]
    BlockMemory {
        source: chunk_format::block::BlockError,
    },

    #[snafu(display("record container error: {}", source))]
    Record { source: data_types::RecordError },

    #[snafu(display("remote store error: {}", source))]
    Store { source: chunk_store::StoreError },
}

/// Memstore result.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which partitions a scan should visit.
#[derive(Debug, Clone, PartialEq)]
pub enum PartLookupMethod {
    /// One partition by key.
    Single(PartitionKey),
    /// An explicit key list.
    Multi(Vec<PartitionKey>),
    /// All partitions matching the filters in the committed index.
    Filtered(Vec<ColumnFilter>),
}

/// Which chunks of each visited partition a scan should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkScanMethod {
    /// Everything resident plus whatever paging brings back.
    All,
    /// Chunks overlapping the range.
    TimeRange(TimeRange),
}

/// Tuning knobs for one shard of a dataset.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Target interval between flushes of any one flush group.
    pub flush_interval: Duration,
    /// TTL applied to persisted chunks.
    pub disk_ttl: Duration,
    /// Block memory budget per shard, in bytes.
    pub shard_mem_size: usize,
    /// Memory set aside for write buffers, in bytes; sizes the pool.
    pub ingestion_buffer_mem_size: usize,
    /// Whether reads may page evicted chunks back from the remote store.
    pub demand_paging_enabled: bool,
    /// Whether reads may page in partitions absent from the directory.
    pub multi_partition_odp: bool,
    /// Resident chunk sets to keep per partition before eviction starts.
    pub chunks_to_keep: usize,
    /// Maximum rows per chunk; fuller write buffers seal early.
    pub max_chunks_size: u32,
    /// Hard cap on partitions per shard.
    pub max_num_partitions: usize,
    /// Number of staggered flush groups per shard.
    pub groups_per_shard: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(3600),
            disk_ttl: Duration::from_secs(3 * 24 * 3600),
            shard_mem_size: 256 * 1024 * 1024,
            ingestion_buffer_mem_size: 64 * 1024 * 1024,
            demand_paging_enabled: true,
            multi_partition_odp: false,
            chunks_to_keep: 12,
            max_chunks_size: 400,
            max_num_partitions: 100_000,
            groups_per_shard: 60,
        }
    }
}

impl StoreConfig {
    /// Rough per-buffer-set footprint used to size the pool.
    const EST_BUFFER_SET_BYTES: usize = 32 * 1024;

    /// Number of write buffer sets the ingestion budget affords.
    pub fn num_buffer_sets(&self) -> usize {
        (self.ingestion_buffer_mem_size / Self::EST_BUFFER_SET_BYTES).clamp(2, 65_536)
    }
}

struct ShardEntry {
    shard: Arc<Shard>,
    cancel: CancellationToken,
}

struct DatasetShards {
    dataset: Dataset,
    num_shards: u16,
    shards: HashMap<u16, ShardEntry>,
}

/// Handle to a running ingest stream; dropping it does not stop the
/// stream, cancel it explicitly.
#[derive(Debug)]
pub struct IngestStreamHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl IngestStreamHandle {
    /// Stop consuming the stream.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the consumer task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Top-level directory of (dataset → shard → partition).
pub struct TimeSeriesMemStore {
    sink: Arc<dyn ChunkSink>,
    source: Option<Arc<dyn ChunkSource>>,
    time_provider: Arc<dyn TimeProvider>,
    datasets: RwLock<HashMap<String, DatasetShards>>,
}

impl std::fmt::Debug for TimeSeriesMemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesMemStore")
            .field("datasets", &self.datasets.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TimeSeriesMemStore {
    /// Build a memstore over the given persistence backend.
    pub fn new(
        sink: Arc<dyn ChunkSink>,
        source: Option<Arc<dyn ChunkSource>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            sink,
            source,
            time_provider,
            datasets: RwLock::new(HashMap::new()),
        }
    }

    /// Set up one shard of a dataset. Idempotent; must run inside a tokio
    /// runtime (it spawns the shard's flush schedule).
    pub async fn setup(
        &self,
        dataset: Dataset,
        num_shards: u16,
        shard_id: ShardId,
        config: StoreConfig,
    ) -> Result<()> {
        {
            let datasets = self.datasets.read();
            if let Some(ds) = datasets.get(&dataset.name) {
                if ds.shards.contains_key(&shard_id.get()) {
                    return Ok(());
                }
            }
        }

        self.sink
            .initialize(&dataset.name, num_shards)
            .await
            .map_err(|source| Error::Store { source })?;

        let shard = Arc::new(Shard::new(
            dataset.clone(),
            shard_id,
            config,
            Arc::clone(&self.sink),
            self.source.clone(),
            Arc::clone(&self.time_provider),
        )?);
        let cancel = CancellationToken::new();

        let flush_task = {
            let mut datasets = self.datasets.write();
            let entry = datasets
                .entry(dataset.name.clone())
                .or_insert_with(|| DatasetShards {
                    dataset,
                    num_shards,
                    shards: HashMap::new(),
                });
            if entry.shards.contains_key(&shard_id.get()) {
                // lost a concurrent setup; the winner's flush task runs
                None
            } else {
                entry.shards.insert(
                    shard_id.get(),
                    ShardEntry {
                        shard: Arc::clone(&shard),
                        cancel: cancel.clone(),
                    },
                );
                Some(Arc::clone(&shard).run_flush_schedule(cancel))
            }
        };
        if let Some(task) = flush_task {
            tokio::spawn(task);
            info!(shard = %shard_id, "memstore shard ready");
        }
        Ok(())
    }

    /// Look up a shard.
    pub fn shard(&self, dataset: &str, shard_id: ShardId) -> Result<Arc<Shard>> {
        let datasets = self.datasets.read();
        let ds = datasets.get(dataset).ok_or_else(|| Error::UnknownDataset {
            dataset: dataset.to_string(),
        })?;
        ds.shards
            .get(&shard_id.get())
            .map(|e| Arc::clone(&e.shard))
            .ok_or_else(|| Error::UnknownShard {
                dataset: dataset.to_string(),
                shard: shard_id,
            })
    }

    /// The dataset definition, if set up.
    pub fn dataset(&self, dataset: &str) -> Option<Dataset> {
        self.datasets.read().get(dataset).map(|d| d.dataset.clone())
    }

    /// Number of shards the dataset was set up with.
    pub fn num_shards(&self, dataset: &str) -> Option<u16> {
        self.datasets.read().get(dataset).map(|d| d.num_shards)
    }

    /// Shard ids of this dataset resident on this node.
    pub fn local_shards(&self, dataset: &str) -> Vec<ShardId> {
        self.datasets
            .read()
            .get(dataset)
            .map(|d| {
                let mut ids: Vec<_> = d.shards.keys().map(|s| ShardId::new(*s)).collect();
                ids.sort();
                ids
            })
            .unwrap_or_default()
    }

    /// Ingest one record container into a shard.
    pub fn ingest(
        &self,
        dataset: &str,
        shard_id: ShardId,
        container: &RecordContainer,
    ) -> Result<()> {
        self.shard(dataset, shard_id)?.ingest(container)
    }

    /// Consume a stream of record containers until it ends or is
    /// cancelled. Ingest errors go to `error_cb`; the stream keeps going.
    pub fn ingest_stream(
        &self,
        dataset: &str,
        shard_id: ShardId,
        mut containers: BoxStream<'static, RecordContainer>,
        error_cb: Box<dyn Fn(Error) + Send + Sync>,
    ) -> Result<IngestStreamHandle> {
        let shard = self.shard(dataset, shard_id)?;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    next = containers.next() => {
                        let Some(container) = next else { return };
                        if let Err(e) = shard.ingest(&container) {
                            warn!(shard = %shard_id, error = %e, "ingest stream error");
                            error_cb(e);
                        }
                    }
                }
            }
        });

        Ok(IngestStreamHandle { cancel, task })
    }

    /// Scan one shard's partitions for the query engine.
    pub async fn scan(
        &self,
        dataset: &str,
        shard_id: ShardId,
        part_method: &PartLookupMethod,
        chunk_method: &ChunkScanMethod,
    ) -> Result<Vec<PartitionReadHandle>> {
        self.shard(dataset, shard_id)?
            .scan(part_method, chunk_method)
            .await
    }

    /// Committed values of one label on one shard.
    pub fn label_values(
        &self,
        dataset: &str,
        shard_id: ShardId,
        label: &str,
    ) -> Result<Vec<String>> {
        Ok(self.shard(dataset, shard_id)?.label_values(label))
    }

    /// Partition keys matching filters on one shard.
    pub fn part_keys_by_filters(
        &self,
        dataset: &str,
        shard_id: ShardId,
        filters: &[ColumnFilter],
    ) -> Result<Vec<PartitionKey>> {
        self.shard(dataset, shard_id)?.part_keys_by_filters(filters)
    }

    /// Rebuild one shard's index from the remote partition-key directory.
    pub async fn recover_index(&self, dataset: &str, shard_id: ShardId) -> Result<usize> {
        self.shard(dataset, shard_id)?.recover_index().await
    }

    /// Seal and persist every flush group of one shard now. Operational
    /// and test hook; the scheduled flush normally does this.
    pub async fn flush_all(&self, dataset: &str, shard_id: ShardId) -> Result<usize> {
        let shard = self.shard(dataset, shard_id)?;
        let mut total = 0;
        for group in 0..shard.num_flush_groups() {
            total += shard.flush_group(group).await?;
        }
        Ok(total)
    }

    /// Stop all flush schedules.
    pub fn shutdown(&self) {
        let datasets = self.datasets.read();
        for ds in datasets.values() {
            for entry in ds.shards.values() {
                entry.cancel.cancel();
            }
        }
    }
}

impl Drop for TimeSeriesMemStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
