//! End-to-end memstore behavior over the in-memory column store.

use chunk_format::pool::ValueReader;
use chunk_store::{ChunkSink, ChunkSource, MemColumnStore};
use data_types::{
    ColumnDef, ColumnFilter, ColumnType, ColumnValue, Dataset, DatasetSchema, IngestRecord,
    PartitionKey, RecordContainer, RecordContainerBuilder, ShardId, TimeRange,
};
use memstore::{
    ChunkScanMethod, PartLookupMethod, PartitionReadHandle, StoreConfig, TimeSeriesMemStore,
};
use prism_time::{MockProvider, Time};
use std::sync::Arc;
use std::time::Duration;

const SHARD: ShardId = ShardId::new(0);

fn prom_dataset() -> Dataset {
    let schema = DatasetSchema::new(
        vec![
            ColumnDef::new("tags", ColumnType::IntMap),
            ColumnDef::new("timestamp", ColumnType::TimestampLong),
            ColumnDef::new("value", ColumnType::Double),
        ],
        1,
    )
    .unwrap();
    Dataset::new("prom", schema)
}

fn test_config() -> StoreConfig {
    StoreConfig {
        flush_interval: Duration::from_secs(3600),
        groups_per_shard: 2,
        max_chunks_size: 100,
        ..Default::default()
    }
}

fn container(labels: &[(&str, &str)], samples: &[(i64, f64)]) -> RecordContainer {
    let mut builder = RecordContainerBuilder::new();
    for (ts, v) in samples {
        builder.push(&IngestRecord {
            labels: labels
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            timestamp: *ts,
            values: vec![ColumnValue::Double(*v)],
        });
    }
    builder.build()
}

async fn store_with(
    backend: &Arc<MemColumnStore>,
    config: StoreConfig,
) -> TimeSeriesMemStore {
    let time = Arc::new(MockProvider::new(Time::from_timestamp_millis(1_000_000)));
    let store = TimeSeriesMemStore::new(
        Arc::clone(backend) as Arc<dyn ChunkSink>,
        Some(Arc::clone(backend) as Arc<dyn ChunkSource>),
        time,
    );
    store
        .setup(prom_dataset(), 1, SHARD, config)
        .await
        .unwrap();
    store
}

fn collect_samples(handle: &PartitionReadHandle) -> Vec<(i64, f64)> {
    let mut out = Vec::new();
    for chunk in &handle.chunks {
        let ValueReader::Double(values) = &chunk.values[0] else {
            panic!("expected double column");
        };
        for (ts, v) in chunk.timestamps.iterate(0).zip(values.iterate(0)) {
            out.push((ts, v));
        }
    }
    out
}

async fn scan_all(store: &TimeSeriesMemStore, labels: &[(&str, &str)]) -> Vec<(i64, f64)> {
    let key = PartitionKey::from_labels(labels.iter().copied());
    let handles = store
        .scan(
            "prom",
            SHARD,
            &PartLookupMethod::Single(key),
            &ChunkScanMethod::All,
        )
        .await
        .unwrap();
    assert_eq!(handles.len(), 1);
    collect_samples(&handles[0])
}

#[tokio::test]
async fn test_single_series_roundtrip() {
    test_helpers::maybe_start_logging();
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    let start = 1_600_000_000_000i64;
    let samples: Vec<(i64, f64)> = (0..720).map(|i| (start + i * 10_000, i as f64)).collect();
    store
        .ingest("prom", SHARD, &container(&[("app", "x")], &samples))
        .unwrap();

    let got = scan_all(&store, &[("app", "x")]).await;
    assert_eq!(got, samples);

    // timestamps strictly increasing across all returned chunks
    for w in got.windows(2) {
        assert!(w[0].0 < w[1].0);
    }
}

#[tokio::test]
async fn test_out_of_order_samples_dropped_not_fatal() {
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    store
        .ingest(
            "prom",
            SHARD,
            &container(
                &[("app", "x")],
                &[(1_000, 1.0), (2_000, 2.0), (1_500, 9.0), (3_000, 3.0)],
            ),
        )
        .unwrap();

    let got = scan_all(&store, &[("app", "x")]).await;
    assert_eq!(got, vec![(1_000, 1.0), (2_000, 2.0), (3_000, 3.0)]);

    let shard = store.shard("prom", SHARD).unwrap();
    assert_eq!(
        shard
            .metrics
            .rows_out_of_order
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn test_buffered_samples_visible_before_flush() {
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    store
        .ingest(
            "prom",
            SHARD,
            &container(&[("app", "x")], &[(1_000, 1.0), (2_000, 2.0)]),
        )
        .unwrap();

    // nothing flushed yet, but the live buffer is readable
    assert_eq!(backend.chunk_row_count("prom"), 0);
    let got = scan_all(&store, &[("app", "x")]).await;
    assert_eq!(got, vec![(1_000, 1.0), (2_000, 2.0)]);
}

#[tokio::test]
async fn test_flush_persists_and_fires_listener() {
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    store
        .ingest(
            "prom",
            SHARD,
            &container(&[("app", "x")], &[(1_000, 1.0), (2_000, 2.0)]),
        )
        .unwrap();

    let shard = store.shard("prom", SHARD).unwrap();
    let key = PartitionKey::from_labels([("app", "x")]);
    let listener = shard.flush_listener(&key).unwrap();

    let flushed = store.flush_all("prom", SHARD).await.unwrap();
    assert_eq!(flushed, 1);
    assert_eq!(backend.chunk_row_count("prom"), 1);
    listener.await.expect("flush listener fired");

    // data remains queryable after flush
    let got = scan_all(&store, &[("app", "x")]).await;
    assert_eq!(got, vec![(1_000, 1.0), (2_000, 2.0)]);
}

#[tokio::test]
async fn test_chunk_seals_at_max_rows() {
    let backend = Arc::new(MemColumnStore::new());
    let mut config = test_config();
    config.max_chunks_size = 10;
    let store = store_with(&backend, config).await;

    let samples: Vec<(i64, f64)> = (0..25).map(|i| (i * 1_000, i as f64)).collect();
    store
        .ingest("prom", SHARD, &container(&[("app", "x")], &samples))
        .unwrap();

    let key = PartitionKey::from_labels([("app", "x")]);
    let handles = store
        .scan(
            "prom",
            SHARD,
            &PartLookupMethod::Single(key),
            &ChunkScanMethod::All,
        )
        .await
        .unwrap();
    // 25 rows with 10-row chunks: two sealed chunks + live buffer of 5
    assert_eq!(handles[0].chunks.len(), 3);
    assert_eq!(collect_samples(&handles[0]), samples);
}

#[tokio::test]
async fn test_filtered_scan_via_index() {
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    store
        .ingest(
            "prom",
            SHARD,
            &container(&[("app", "x"), ("dc", "eu")], &[(1_000, 1.0)]),
        )
        .unwrap();
    store
        .ingest(
            "prom",
            SHARD,
            &container(&[("app", "y"), ("dc", "eu")], &[(1_000, 2.0)]),
        )
        .unwrap();

    let handles = store
        .scan(
            "prom",
            SHARD,
            &PartLookupMethod::Filtered(vec![ColumnFilter::equals("app", "x")]),
            &ChunkScanMethod::All,
        )
        .await
        .unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].labels["app"], "x");

    let handles = store
        .scan(
            "prom",
            SHARD,
            &PartLookupMethod::Filtered(vec![ColumnFilter::equals("dc", "eu")]),
            &ChunkScanMethod::All,
        )
        .await
        .unwrap();
    assert_eq!(handles.len(), 2);
}

#[tokio::test]
async fn test_time_range_scan_excludes_disjoint_chunks() {
    let backend = Arc::new(MemColumnStore::new());
    let mut config = test_config();
    config.max_chunks_size = 10;
    let store = store_with(&backend, config).await;

    let samples: Vec<(i64, f64)> = (0..30).map(|i| (i * 1_000, i as f64)).collect();
    store
        .ingest("prom", SHARD, &container(&[("app", "x")], &samples))
        .unwrap();

    let key = PartitionKey::from_labels([("app", "x")]);
    let handles = store
        .scan(
            "prom",
            SHARD,
            &PartLookupMethod::Single(key),
            &ChunkScanMethod::TimeRange(TimeRange::new(12_000, 14_000)),
        )
        .await
        .unwrap();
    // only the middle chunk (rows 10..20) overlaps
    assert_eq!(handles[0].chunks.len(), 1);
    let samples = collect_samples(&handles[0]);
    assert_eq!(samples.first().unwrap().0, 10_000);
    assert_eq!(samples.last().unwrap().0, 19_000);
}

#[tokio::test]
async fn test_eviction_and_demand_paging() {
    test_helpers::maybe_start_logging();
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    store
        .ingest(
            "prom",
            SHARD,
            &container(&[("app", "x")], &[(1_000, 1.0), (2_000, 2.0)]),
        )
        .unwrap();
    store.flush_all("prom", SHARD).await.unwrap();

    // evict the persisted chunks, leaving an index stub
    let shard = store.shard("prom", SHARD).unwrap();
    let key = PartitionKey::from_labels([("app", "x")]);
    assert_eq!(shard.evict_partition_chunks(&key), 1);

    // the stub is still searchable
    let keys = shard
        .part_keys_by_filters(&[ColumnFilter::equals("app", "x")])
        .unwrap();
    assert_eq!(keys, vec![key.clone()]);

    // a read over the evicted range pages the chunk back in
    let got = scan_all(&store, &[("app", "x")]).await;
    assert_eq!(got, vec![(1_000, 1.0), (2_000, 2.0)]);
    assert!(
        shard
            .metrics
            .odp_reads
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
}

#[tokio::test]
async fn test_schema_mismatch_rows_counted() {
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    let mut builder = RecordContainerBuilder::new();
    builder.push(&IngestRecord {
        labels: vec![("app".into(), "x".into())],
        timestamp: 1_000,
        values: vec![ColumnValue::Double(1.0), ColumnValue::Double(2.0)],
    });
    builder.push(&IngestRecord {
        labels: vec![("app".into(), "x".into())],
        timestamp: 2_000,
        values: vec![ColumnValue::Double(1.0)],
    });
    store.ingest("prom", SHARD, &builder.build()).unwrap();

    let shard = store.shard("prom", SHARD).unwrap();
    assert_eq!(
        shard
            .metrics
            .rows_schema_mismatch
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    let got = scan_all(&store, &[("app", "x")]).await;
    assert_eq!(got, vec![(2_000, 1.0)]);
}

#[tokio::test]
async fn test_ingest_stream_cancellation() {
    use futures::StreamExt;
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    let containers: Vec<RecordContainer> = (0..3)
        .map(|i| container(&[("app", "x")], &[((i + 1) * 1_000, i as f64)]))
        .collect();
    let handle = store
        .ingest_stream(
            "prom",
            SHARD,
            futures::stream::iter(containers).boxed(),
            Box::new(|e| panic!("unexpected ingest error: {e}")),
        )
        .unwrap();
    handle.join().await;

    let got = scan_all(&store, &[("app", "x")]).await;
    assert_eq!(got.len(), 3);
}

#[tokio::test]
async fn test_label_values_after_commit() {
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;

    store
        .ingest(
            "prom",
            SHARD,
            &container(&[("app", "x"), ("dc", "eu")], &[(1_000, 1.0)]),
        )
        .unwrap();
    store
        .ingest(
            "prom",
            SHARD,
            &container(&[("app", "y"), ("dc", "us")], &[(1_000, 1.0)]),
        )
        .unwrap();

    assert_eq!(
        store.label_values("prom", SHARD, "app").unwrap(),
        vec!["x", "y"]
    );
    let keys = store
        .part_keys_by_filters("prom", SHARD, &[ColumnFilter::equals("dc", "us")])
        .unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].labels()["app"], "y");
}

#[tokio::test]
async fn test_index_recovery_from_part_keys() {
    let backend = Arc::new(MemColumnStore::new());

    // first life: ingest and flush, which persists the part key directory
    {
        let store = store_with(&backend, test_config()).await;
        store
            .ingest(
                "prom",
                SHARD,
                &container(&[("app", "x"), ("dc", "eu")], &[(1_000, 1.0)]),
            )
            .unwrap();
        store.flush_all("prom", SHARD).await.unwrap();
    }

    // second life: fresh memstore, recover the index, query through ODP
    let store = store_with(&backend, test_config()).await;
    let recovered = store.recover_index("prom", SHARD).await.unwrap();
    assert_eq!(recovered, 1);

    let handles = store
        .scan(
            "prom",
            SHARD,
            &PartLookupMethod::Filtered(vec![ColumnFilter::equals("app", "x")]),
            &ChunkScanMethod::All,
        )
        .await
        .unwrap();
    assert_eq!(handles.len(), 1);
    assert_eq!(collect_samples(&handles[0]), vec![(1_000, 1.0)]);
}

#[tokio::test]
async fn test_setup_is_idempotent() {
    let backend = Arc::new(MemColumnStore::new());
    let store = store_with(&backend, test_config()).await;
    // second setup of the same shard is a no-op
    store
        .setup(prom_dataset(), 1, SHARD, test_config())
        .await
        .unwrap();
    store
        .ingest("prom", SHARD, &container(&[("app", "x")], &[(1_000, 1.0)]))
        .unwrap();
    assert_eq!(scan_all(&store, &[("app", "x")]).await.len(), 1);
}
