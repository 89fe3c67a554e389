//! A deterministic in-memory column store.
//!
//! Backs the test suites and serves as the demand-paging source in
//! single-node deployments. Honors the same table layouts and write
//! atomicity as a real wide-column backend: a chunk set is visible only
//! with both its chunk row and its index row present.

use crate::{
    ChunkScan, ChunkSetData, ChunkSink, ChunkSource, PartKeyRecord, PartScan, RawChunkSetData,
    RawPartData, Result, ScanSplit, StoreError, UnknownDatasetSnafu,
};
use async_trait::async_trait;
use data_types::{ChunkInfo, PartitionKey, ShardId};
use futures::stream::{self, BoxStream, StreamExt};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use snafu::OptionExt;
use std::collections::BTreeMap;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Tables {
    num_shards: u16,
    /// `(partition, chunk_id) -> chunks blob`
    chunks: BTreeMap<(Vec<u8>, i64), Vec<u8>>,
    /// `(partition, ingestion_time, start_time) -> info blob`
    index: BTreeMap<(Vec<u8>, i64, i64), Vec<u8>>,
    /// `(shard, partition) -> directory record`
    part_keys: BTreeMap<(u16, Vec<u8>), PartKeyRecord>,
}

/// In-memory [`ChunkSink`] + [`ChunkSource`].
#[derive(Debug, Default)]
pub struct MemColumnStore {
    datasets: Mutex<HashMap<String, Tables>>,
}

impl MemColumnStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<R>(
        &self,
        dataset: &str,
        f: impl FnOnce(&mut Tables) -> R,
    ) -> Result<R> {
        let mut datasets = self.datasets.lock();
        let tables = datasets
            .get_mut(dataset)
            .context(UnknownDatasetSnafu { dataset })?;
        Ok(f(tables))
    }

    /// Number of chunk rows currently stored for a dataset. Test hook.
    pub fn chunk_row_count(&self, dataset: &str) -> usize {
        self.datasets
            .lock()
            .get(dataset)
            .map(|t| t.chunks.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChunkSink for MemColumnStore {
    async fn initialize(&self, dataset: &str, num_shards: u16) -> Result<()> {
        let mut datasets = self.datasets.lock();
        datasets
            .entry(dataset.to_string())
            .or_insert_with(|| Tables {
                num_shards,
                ..Default::default()
            });
        Ok(())
    }

    async fn truncate(&self, dataset: &str) -> Result<()> {
        let mut datasets = self.datasets.lock();
        if let Some(tables) = datasets.get_mut(dataset) {
            tables.chunks.clear();
            tables.index.clear();
            tables.part_keys.clear();
        }
        Ok(())
    }

    async fn drop_dataset(&self, dataset: &str) -> Result<()> {
        self.datasets.lock().remove(dataset);
        Ok(())
    }

    async fn write_chunks(
        &self,
        dataset: &str,
        chunk_sets: BoxStream<'static, ChunkSetData>,
        _ttl_seconds: u32,
    ) -> Result<usize> {
        let chunk_sets: Vec<_> = chunk_sets.collect().await;
        let count = chunk_sets.len();
        self.with_tables(dataset, |tables| {
            for set in chunk_sets {
                let part = set.partition.as_bytes().to_vec();
                let blob = set.encode_columns_blob();
                // chunk row and index row land together under the lock;
                // partial writes are not representable here
                tables
                    .chunks
                    .insert((part.clone(), set.info.chunk_id.get()), blob);
                tables.index.insert(
                    (part, set.info.ingestion_time, set.info.start_time),
                    set.info.encode(),
                );
            }
        })?;
        debug!(dataset, count, "wrote chunk sets");
        Ok(count)
    }

    async fn write_part_keys(
        &self,
        dataset: &str,
        shard: ShardId,
        records: Vec<PartKeyRecord>,
        _ttl_seconds: u32,
    ) -> Result<()> {
        self.with_tables(dataset, |tables| {
            for record in records {
                tables
                    .part_keys
                    .insert((shard.get(), record.part_key.as_bytes().to_vec()), record);
            }
        })
    }
}

fn chunk_sets_for(
    tables: &Tables,
    part: &[u8],
    min_start: i64,
    max_start: i64,
) -> Vec<RawChunkSetData> {
    tables
        .chunks
        .range((part.to_vec(), i64::MIN)..=(part.to_vec(), i64::MAX))
        .filter_map(|((_, chunk_id), blob)| {
            let info_bytes = tables
                .index
                .iter()
                .find(|((p, _, _), info)| {
                    p.as_slice() == part
                        && ChunkInfo::decode(info)
                            .map(|i| i.chunk_id.get() == *chunk_id)
                            .unwrap_or(false)
                })
                .map(|(_, info)| info.clone())?;
            let info = ChunkInfo::decode(&info_bytes).ok()?;
            if info.start_time < min_start || info.start_time > max_start {
                return None;
            }
            let columns = ChunkSetData::decode_columns_blob(blob).ok()?;
            Some(RawChunkSetData { info, columns })
        })
        .collect()
}

#[async_trait]
impl ChunkSource for MemColumnStore {
    async fn read_raw_partitions(
        &self,
        dataset: &str,
        max_chunk_time: i64,
        part_scan: PartScan,
        chunk_scan: ChunkScan,
    ) -> Result<BoxStream<'static, Result<RawPartData>>> {
        let (min_start, max_start) = match chunk_scan {
            ChunkScan::All => (i64::MIN, i64::MAX),
            ChunkScan::UserTime { start, end } => (start.saturating_sub(max_chunk_time), end),
        };

        let parts = self.with_tables(dataset, |tables| {
            let keys: Vec<PartitionKey> = match part_scan {
                PartScan::Keys(keys) => keys,
                PartScan::Shard(shard) => {
                    let num_shards = tables.num_shards.max(1);
                    tables
                        .chunks
                        .keys()
                        .map(|(p, _)| p.clone())
                        .collect::<std::collections::BTreeSet<_>>()
                        .into_iter()
                        .map(PartitionKey::from_bytes)
                        .filter(|k| k.shard(num_shards) == shard)
                        .collect()
                }
            };

            keys.into_iter()
                .filter_map(|key| {
                    let chunk_sets =
                        chunk_sets_for(tables, key.as_bytes(), min_start, max_start);
                    if chunk_sets.is_empty() {
                        return None;
                    }
                    Some(Ok(RawPartData {
                        partition: key,
                        chunk_sets,
                    }))
                })
                .collect::<Vec<_>>()
        })?;

        Ok(stream::iter(parts).boxed())
    }

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
    ) -> Result<BoxStream<'static, Result<Vec<RawPartData>>>> {
        let min_start = user_start.saturating_sub(max_chunk_time);

        let parts = self.with_tables(dataset, |tables| {
            // partitions with at least one index row in the ingestion window
            let mut by_part: BTreeMap<Vec<u8>, Vec<ChunkInfo>> = BTreeMap::new();
            for ((part, ing, _), info_bytes) in &tables.index {
                if *ing < ing_start || *ing >= ing_end {
                    continue;
                }
                let Ok(info) = ChunkInfo::decode(info_bytes) else {
                    continue;
                };
                if info.start_time < min_start || info.start_time >= user_end {
                    continue;
                }
                let token = PartitionKey::from_bytes(part.clone()).hash();
                if !splits.is_empty()
                    && !splits
                        .iter()
                        .any(|s| s.token_start <= token && token <= s.token_end)
                {
                    continue;
                }
                by_part.entry(part.clone()).or_default().push(info);
            }

            by_part
                .into_iter()
                .map(|(part, infos)| {
                    let chunk_sets = infos
                        .into_iter()
                        .filter_map(|info| {
                            let blob =
                                tables.chunks.get(&(part.clone(), info.chunk_id.get()))?;
                            let columns = ChunkSetData::decode_columns_blob(blob).ok()?;
                            Some(RawChunkSetData { info, columns })
                        })
                        .collect();
                    RawPartData {
                        partition: PartitionKey::from_bytes(part),
                        chunk_sets,
                    }
                })
                .collect::<Vec<_>>()
        })?;

        let batches: Vec<Result<Vec<RawPartData>>> = parts
            .chunks(batch_size.max(1))
            .map(|batch| Ok(batch.to_vec()))
            .collect();
        Ok(stream::iter(batches).boxed())
    }

    async fn scan_splits(&self, dataset: &str, splits_per_node: usize) -> Result<Vec<ScanSplit>> {
        // dataset existence check only; the in-memory key space is flat
        self.with_tables(dataset, |_| ())?;
        let n = splits_per_node.max(1) as u64;
        let width = u64::MAX / n;
        Ok((0..n)
            .map(|i| ScanSplit {
                token_start: i * width,
                token_end: if i == n - 1 { u64::MAX } else { (i + 1) * width - 1 },
                replica_hosts: vec!["localhost".to_string()],
            })
            .collect())
    }

    async fn scan_part_keys(
        &self,
        dataset: &str,
        shard: ShardId,
    ) -> Result<BoxStream<'static, Result<PartKeyRecord>>> {
        let records = self.with_tables(dataset, |tables| {
            tables
                .part_keys
                .iter()
                .filter(|((s, _), _)| *s == shard.get())
                .map(|(_, r)| Ok(r.clone()))
                .collect::<Vec<_>>()
        })?;
        Ok(stream::iter(records).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::ChunkId;

    fn chunk_set(key: &PartitionKey, start: i64, ing: i64) -> ChunkSetData {
        ChunkSetData {
            partition: key.clone(),
            info: ChunkInfo {
                chunk_id: ChunkId::new(start, 0),
                start_time: start,
                end_time: start + 990,
                ingestion_time: ing,
                num_rows: 100,
            },
            columns: vec![vec![1, 2], vec![3]],
        }
    }

    #[tokio::test]
    async fn test_unknown_dataset_errors() {
        let store = MemColumnStore::new();
        let err = store
            .write_chunks("nope", stream::iter(vec![]).boxed(), 0)
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::UnknownDataset { .. });
    }

    #[tokio::test]
    async fn test_write_and_read_raw_partitions() {
        let store = MemColumnStore::new();
        store.initialize("prom", 4).await.unwrap();

        let key = PartitionKey::from_labels([("app", "x")]);
        let sets = vec![chunk_set(&key, 1_000, 50_000), chunk_set(&key, 2_000, 51_000)];
        let written = store
            .write_chunks("prom", stream::iter(sets.clone()).boxed(), 86_400)
            .await
            .unwrap();
        assert_eq!(written, 2);

        let mut results = store
            .read_raw_partitions(
                "prom",
                0,
                PartScan::Keys(vec![key.clone()]),
                ChunkScan::All,
            )
            .await
            .unwrap();
        let part = results.next().await.unwrap().unwrap();
        assert_eq!(part.partition, key);
        assert_eq!(part.chunk_sets.len(), 2);
        assert_eq!(part.chunk_sets[0].columns, sets[0].columns);
        assert!(results.next().await.is_none());
    }

    #[tokio::test]
    async fn test_time_range_scan_widens_by_max_chunk_time() {
        let store = MemColumnStore::new();
        store.initialize("prom", 1).await.unwrap();
        let key = PartitionKey::from_labels([("app", "x")]);
        store
            .write_chunks(
                "prom",
                stream::iter(vec![chunk_set(&key, 1_000, 1)]).boxed(),
                0,
            )
            .await
            .unwrap();

        // query range starting after the chunk start would miss it
        // without the widening
        let results = store
            .read_raw_partitions(
                "prom",
                3_600_000,
                PartScan::Keys(vec![key.clone()]),
                ChunkScan::UserTime {
                    start: 1_500,
                    end: 2_000,
                },
            )
            .await
            .unwrap();
        let parts: Vec<_> = results.collect().await;
        assert_eq!(parts.len(), 1);

        // and a scan entirely before the chunk returns nothing
        let results = store
            .read_raw_partitions(
                "prom",
                0,
                PartScan::Keys(vec![key]),
                ChunkScan::UserTime { start: 0, end: 500 },
            )
            .await
            .unwrap();
        assert_eq!(results.collect::<Vec<_>>().await.len(), 0);
    }

    #[tokio::test]
    async fn test_ingestion_time_scan_is_half_open() {
        let store = MemColumnStore::new();
        store.initialize("prom", 1).await.unwrap();
        let key = PartitionKey::from_labels([("app", "x")]);
        store
            .write_chunks(
                "prom",
                stream::iter(vec![
                    chunk_set(&key, 1_000, 100),
                    chunk_set(&key, 2_000, 200),
                ])
                .boxed(),
                0,
            )
            .await
            .unwrap();

        let splits = store.scan_splits("prom", 2).await.unwrap();
        let stream = store
            .chunks_by_ingestion_time("prom", splits, 100, 200, 0, i64::MAX, 0, 10)
            .await
            .unwrap();
        let batches: Vec<_> = stream.collect().await;
        assert_eq!(batches.len(), 1);
        let parts = batches[0].as_ref().unwrap();
        assert_eq!(parts.len(), 1);
        // ing_end exclusive: only the ing=100 chunk qualifies
        assert_eq!(parts[0].chunk_sets.len(), 1);
        assert_eq!(parts[0].chunk_sets[0].info.ingestion_time, 100);
    }

    #[tokio::test]
    async fn test_part_keys_round_trip() {
        let store = MemColumnStore::new();
        store.initialize("prom", 2).await.unwrap();
        let record = PartKeyRecord {
            part_key: PartitionKey::from_labels([("app", "x")]),
            start_time: 1_000,
            end_time: i64::MAX,
        };
        store
            .write_part_keys("prom", ShardId::new(1), vec![record.clone()], 0)
            .await
            .unwrap();

        let keys: Vec<_> = store
            .scan_part_keys("prom", ShardId::new(1))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(keys.len(), 1);
        assert_eq!(*keys[0].as_ref().unwrap(), record);

        // other shard is empty
        let keys: Vec<_> = store
            .scan_part_keys("prom", ShardId::new(0))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_scan_splits_cover_token_space() {
        let store = MemColumnStore::new();
        store.initialize("prom", 1).await.unwrap();
        let splits = store.scan_splits("prom", 4).await.unwrap();
        assert_eq!(splits.len(), 4);
        assert_eq!(splits[0].token_start, 0);
        assert_eq!(splits[3].token_end, u64::MAX);
        for w in splits.windows(2) {
            assert_eq!(w[0].token_end + 1, w[1].token_start);
        }
    }
}
