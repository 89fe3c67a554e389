//! Leaf exec nodes: per-shard scans against the memstore.

use crate::exec::{
    ExecPlan, ExecResult, InProcessPlanDispatcher, PlanDispatcher, RangeVectorTransformer,
};
use crate::{QuerySession, RangeVector, RangeVectorKey, ResultSchema, Result, RowData};
use async_trait::async_trait;
use chunk_format::pool::ValueReader;
use data_types::{ColumnFilter, ShardId, TimeRange};
use memstore::{ChunkScanMethod, PartLookupMethod, PartitionReadHandle, TimeSeriesMemStore};
use std::sync::Arc;

/// Scans one shard's partitions matching the filters and emits one range
/// vector per partition.
///
/// The scan range is widened on the left by `max_chunk_time` so the chunk
/// containing the earliest relevant sample is always opened; emitted rows
/// are still clipped to the query range.
#[derive(Debug)]
pub struct SelectRawPartitionsExec {
    dataset: String,
    shard: ShardId,
    filters: Vec<ColumnFilter>,
    range: TimeRange,
    max_chunk_time: i64,
    /// Index of the selected column among the schema's value columns.
    value_idx: usize,
    is_histogram: bool,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
}

impl SelectRawPartitionsExec {
    /// Build a leaf scan.
    pub fn new(
        dataset: String,
        shard: ShardId,
        filters: Vec<ColumnFilter>,
        range: TimeRange,
        max_chunk_time: i64,
        value_idx: usize,
        is_histogram: bool,
    ) -> Self {
        Self {
            dataset,
            shard,
            filters,
            range,
            max_chunk_time,
            value_idx,
            is_histogram,
            transformers: vec![],
        }
    }

    /// Attach a transformer stage.
    pub fn add_range_vector_transformer(&mut self, t: Arc<dyn RangeVectorTransformer>) {
        self.transformers.push(t);
    }

    fn vector_for(&self, handle: &PartitionReadHandle) -> RangeVector {
        let key = RangeVectorKey::from_labels(
            handle.labels.iter().map(|(n, v)| (n.as_str(), v.as_str())),
        );
        if self.is_histogram {
            let mut rows = Vec::new();
            for chunk in &handle.chunks {
                if let Some(ValueReader::Histogram(values)) = chunk.values.get(self.value_idx) {
                    for (row, ts) in chunk.timestamps.iterate(0).enumerate() {
                        if self.range.contains(ts) {
                            rows.push((ts, values.apply(row as u32).clone()));
                        }
                    }
                }
            }
            RangeVector::histograms(key, rows)
        } else {
            let mut rows = Vec::new();
            for chunk in &handle.chunks {
                if let Some(ValueReader::Double(values)) = chunk.values.get(self.value_idx) {
                    for (ts, v) in chunk.timestamps.iterate(0).zip(values.iterate(0)) {
                        if self.range.contains(ts) {
                            rows.push((ts, v));
                        }
                    }
                }
            }
            RangeVector::doubles(key, rows)
        }
    }
}

#[async_trait]
impl ExecPlan for SelectRawPartitionsExec {
    fn name(&self) -> &'static str {
        "SelectRawPartitionsExec"
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        // leaves dispatch to their shard-owning node; in-process here
        Arc::new(InProcessPlanDispatcher)
    }

    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &self.transformers
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        let scan_range = TimeRange::new(
            self.range.start.saturating_sub(self.max_chunk_time),
            self.range.end,
        );
        let handles = store
            .scan(
                &self.dataset,
                self.shard,
                &PartLookupMethod::Filtered(self.filters.clone()),
                &ChunkScanMethod::TimeRange(scan_range),
            )
            .await?;

        let mut vectors = Vec::with_capacity(handles.len());
        for handle in &handles {
            session.check_deadline()?;
            vectors.push(self.vector_for(handle));
        }

        let schema = if self.is_histogram {
            ResultSchema::histogram_series()
        } else {
            ResultSchema::time_series()
        };
        Ok(ExecResult::from_vectors(schema, vectors))
    }
}

/// Emits one vector per partition carrying `(chunk start, num rows)` rows,
/// for chunk-layout introspection.
#[derive(Debug)]
pub struct RawChunkMetaExec {
    dataset: String,
    shard: ShardId,
    filters: Vec<ColumnFilter>,
    range: TimeRange,
}

impl RawChunkMetaExec {
    /// Build a chunk-metadata scan.
    pub fn new(
        dataset: String,
        shard: ShardId,
        filters: Vec<ColumnFilter>,
        range: TimeRange,
    ) -> Self {
        Self {
            dataset,
            shard,
            filters,
            range,
        }
    }
}

#[async_trait]
impl ExecPlan for RawChunkMetaExec {
    fn name(&self) -> &'static str {
        "RawChunkMetaExec"
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::new(InProcessPlanDispatcher)
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        _session: &QuerySession,
    ) -> Result<ExecResult> {
        let handles = store
            .scan(
                &self.dataset,
                self.shard,
                &PartLookupMethod::Filtered(self.filters.clone()),
                &ChunkScanMethod::TimeRange(self.range),
            )
            .await?;

        let vectors = handles
            .iter()
            .map(|handle| {
                let key = RangeVectorKey::from_labels(
                    handle.labels.iter().map(|(n, v)| (n.as_str(), v.as_str())),
                );
                let rows = handle
                    .chunks
                    .iter()
                    .map(|c| (c.info.start_time, f64::from(c.info.num_rows)))
                    .collect();
                RangeVector {
                    key,
                    rows: RowData::Doubles(rows),
                }
            })
            .collect();

        Ok(ExecResult::from_vectors(
            ResultSchema {
                columns: vec!["chunk_start".into(), "num_rows".into()],
                is_time_series: false,
                is_histogram: false,
            },
            vectors,
        ))
    }
}

/// Metadata leaf: committed values of one label, one empty-rowed vector
/// per value.
#[derive(Debug)]
pub struct LabelValuesExec {
    dataset: String,
    shard: ShardId,
    label: String,
}

impl LabelValuesExec {
    /// Build a label-values scan.
    pub fn new(dataset: String, shard: ShardId, label: String) -> Self {
        Self {
            dataset,
            shard,
            label,
        }
    }
}

#[async_trait]
impl ExecPlan for LabelValuesExec {
    fn name(&self) -> &'static str {
        "LabelValuesExec"
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::new(InProcessPlanDispatcher)
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        _session: &QuerySession,
    ) -> Result<ExecResult> {
        let values = store.label_values(&self.dataset, self.shard, &self.label)?;
        let vectors = values
            .iter()
            .map(|v| {
                RangeVector::doubles(
                    RangeVectorKey::from_labels([(self.label.as_str(), v.as_str())]),
                    vec![],
                )
            })
            .collect();
        Ok(ExecResult::from_vectors(ResultSchema::metadata(), vectors))
    }
}

/// Metadata leaf: series keys matching filters, one empty-rowed vector per
/// series.
#[derive(Debug)]
pub struct PartKeysExec {
    dataset: String,
    shard: ShardId,
    filters: Vec<ColumnFilter>,
}

impl PartKeysExec {
    /// Build a series-key scan.
    pub fn new(dataset: String, shard: ShardId, filters: Vec<ColumnFilter>) -> Self {
        Self {
            dataset,
            shard,
            filters,
        }
    }
}

#[async_trait]
impl ExecPlan for PartKeysExec {
    fn name(&self) -> &'static str {
        "PartKeysExec"
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::new(InProcessPlanDispatcher)
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        _session: &QuerySession,
    ) -> Result<ExecResult> {
        let keys = store.part_keys_by_filters(&self.dataset, self.shard, &self.filters)?;
        let vectors = keys
            .iter()
            .map(|key| {
                let labels = key.labels();
                RangeVector::doubles(
                    RangeVectorKey::from_labels(
                        labels.iter().map(|(n, v)| (n.as_str(), v.as_str())),
                    ),
                    vec![],
                )
            })
            .collect();
        Ok(ExecResult::from_vectors(ResultSchema::metadata(), vectors))
    }
}
