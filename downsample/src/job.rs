//! The batch downsample job.
//!
//! Reads raw chunks from the remote store over a bounded ingestion-time
//! window, applies the configured downsamplers per period, and writes one
//! output chunk per source chunk per resolution. Output chunk identity is
//! derived entirely from the source data, so re-running a window rewrites
//! byte-identical rows.

use crate::downsamplers::{DownsamplerKind, DownsamplerSpec};
use crate::marker::{counter_period_ends, default_period_ends};
use crate::{DownsamplerConfig, Error, PeriodMarkerMismatchSnafu, Result};
use chunk_format::block::BlockRef;
use chunk_format::pool::{ValueKind, ValueReader, WriteBufferSet};
use chunk_format::TimestampReader;
use chunk_store::{ChunkSetData, ChunkSink, ChunkSource, RawChunkSetData};
use data_types::{ChunkId, ChunkInfo, ColumnType, Dataset, PartitionKey};
use futures::stream::{self, StreamExt};
use observability_deps::tracing::{debug, info};
use std::sync::Arc;

/// Counters for one downsample run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DownsampleSummary {
    /// Source chunk sets read; accumulates once per resolution pass, so a
    /// two-resolution config counts each source chunk twice.
    pub chunks_read: usize,
    /// Output chunk sets written, across all resolutions.
    pub chunks_written: usize,
}

/// A deterministic, idempotent downsample batch job for one raw dataset.
#[derive(Debug)]
pub struct DownsampleJob {
    config: DownsamplerConfig,
    raw_dataset: String,
    num_shards: u16,
    value_kinds: Vec<ValueKind>,
    /// Index (within value columns) of the counter column driving the
    /// counter period marker, when the schema declares one.
    counter_column: Option<usize>,
    specs: Vec<DownsamplerSpec>,
    source: Arc<dyn ChunkSource>,
    sink: Arc<dyn ChunkSink>,
}

impl DownsampleJob {
    /// Build a job for `raw_dataset` with the given downsamplers.
    pub fn new(
        config: DownsamplerConfig,
        raw_dataset: &Dataset,
        num_shards: u16,
        specs: Vec<DownsamplerSpec>,
        source: Arc<dyn ChunkSource>,
        sink: Arc<dyn ChunkSink>,
    ) -> Result<Self> {
        config.validate()?;
        let value_kinds: Vec<ValueKind> = raw_dataset
            .schema
            .value_columns()
            .map(|(_, c)| match c.column_type {
                ColumnType::Histogram => ValueKind::Histogram,
                _ => ValueKind::Double,
            })
            .collect();
        let counter_column = raw_dataset
            .schema
            .value_columns()
            .enumerate()
            .find(|(_, (_, c))| c.counter)
            .map(|(i, _)| i);

        Ok(Self {
            config,
            raw_dataset: raw_dataset.name.clone(),
            num_shards,
            value_kinds,
            counter_column,
            specs,
            source,
            sink,
        })
    }

    fn output_kinds(&self) -> Vec<ValueKind> {
        self.specs
            .iter()
            .filter(|s| s.kind != DownsamplerKind::Timestamp)
            .map(|s| match s.kind {
                DownsamplerKind::HistogramSum => ValueKind::Histogram,
                _ => ValueKind::Double,
            })
            .collect()
    }

    fn parse_chunk(&self, raw: &RawChunkSetData) -> Result<(TimestampReader, Vec<ValueReader>)> {
        let ts_bytes = raw.columns.first().cloned().unwrap_or_default();
        let timestamps = TimestampReader::new(BlockRef::unmanaged(ts_bytes))
            .map_err(|source| Error::Codec { source })?;
        let values = self
            .value_kinds
            .iter()
            .zip(raw.columns.iter().skip(1))
            .map(|(kind, bytes)| {
                let reader = ValueReader::new(*kind, BlockRef::unmanaged(bytes.clone()))?;
                reader.validate()?;
                Ok(reader)
            })
            .collect::<chunk_format::Result<Vec<_>>>()
            .map_err(|source| Error::Codec { source })?;
        Ok((timestamps, values))
    }

    fn period_ends(
        &self,
        timestamps: &TimestampReader,
        values: &[ValueReader],
        r_ms: i64,
    ) -> Result<Vec<u32>> {
        match self.counter_column {
            None => Ok(default_period_ends(timestamps, r_ms)),
            Some(col) => match values.get(col) {
                Some(ValueReader::Double(doubles)) => {
                    Ok(counter_period_ends(timestamps, doubles, r_ms))
                }
                _ => PeriodMarkerMismatchSnafu { column: col }.fail(),
            },
        }
    }

    /// Downsample one source chunk into one output chunk for `r_ms`.
    fn downsample_chunk(
        &self,
        partition: &PartitionKey,
        raw: &RawChunkSetData,
        r_ms: i64,
    ) -> Result<Option<ChunkSetData>> {
        let (timestamps, values) = self.parse_chunk(raw)?;
        if timestamps.num_rows() == 0 {
            return Ok(None);
        }
        let ends = self.period_ends(&timestamps, &values, r_ms)?;

        let mut out = WriteBufferSet::new(&self.output_kinds());
        let mut prev_end: i64 = -1;
        for end in ends {
            let start = (prev_end + 1) as u32;
            prev_end = i64::from(end);

            let out_ts = timestamps.apply(end);
            let mut row = Vec::with_capacity(self.specs.len());
            for spec in &self.specs {
                if spec.kind == DownsamplerKind::Timestamp {
                    continue;
                }
                row.push(spec.compute(&timestamps, &values, start, end)?);
            }
            out.append_row(out_ts, &row)
                .map_err(|source| Error::Codec { source })?;
        }

        if out.is_empty() {
            return Ok(None);
        }
        let info = ChunkInfo {
            chunk_id: ChunkId::new(out.first_ts(), 0),
            start_time: out.first_ts(),
            end_time: out.last_ts(),
            ingestion_time: self
                .config
                .user_time_override
                .unwrap_or(raw.info.ingestion_time),
            num_rows: out.num_rows(),
        };
        Ok(Some(ChunkSetData {
            partition: partition.clone(),
            info,
            columns: out.encode_columns(),
        }))
    }

    /// Run the job over `[ing_start, ing_end)` (exclusive end), widened by
    /// the configured slack on both sides.
    pub async fn run(&self, ing_start: i64, ing_end: i64) -> Result<DownsampleSummary> {
        let widen = self.config.widen_ingestion_time_range_by.as_millis() as i64;
        let ing_start = ing_start.saturating_sub(widen);
        let ing_end = ing_end.saturating_add(widen);
        info!(
            dataset = %self.raw_dataset,
            ing_start,
            ing_end,
            "downsample run starting"
        );

        for (resolution, _) in self.config.retention_pairs() {
            let output = DownsamplerConfig::output_dataset(&self.raw_dataset, resolution);
            self.sink
                .initialize(&output, self.num_shards)
                .await
                .map_err(|source| Error::Store { source })?;
        }

        let splits = self
            .source
            .scan_splits(&self.raw_dataset, 1)
            .await
            .map_err(|source| Error::Store { source })?;

        let mut summary = DownsampleSummary::default();
        for (resolution, ttl) in self.config.retention_pairs() {
            let r_ms = resolution.as_millis() as i64;
            let output_dataset = DownsamplerConfig::output_dataset(&self.raw_dataset, resolution);

            let mut batches = self
                .source
                .chunks_by_ingestion_time(
                    &self.raw_dataset,
                    splits.clone(),
                    ing_start,
                    ing_end,
                    i64::MIN,
                    i64::MAX,
                    r_ms,
                    self.config.num_partitions_per_write.max(1),
                )
                .await
                .map_err(|source| Error::Store { source })?;

            while let Some(batch) = batches.next().await {
                let batch = batch.map_err(|source| Error::Store { source })?;
                let mut outputs = Vec::new();
                for part in &batch {
                    for chunk_set in &part.chunk_sets {
                        summary.chunks_read += 1;
                        if let Some(out) =
                            self.downsample_chunk(&part.partition, chunk_set, r_ms)?
                        {
                            outputs.push(out);
                        }
                    }
                }
                if outputs.is_empty() {
                    continue;
                }
                let written = self
                    .sink
                    .write_chunks(
                        &output_dataset,
                        stream::iter(outputs).boxed(),
                        ttl.as_secs() as u32,
                    )
                    .await
                    .map_err(|source| Error::Store { source })?;
                summary.chunks_written += written;
                debug!(
                    output = %output_dataset,
                    written,
                    "downsample batch flushed"
                );
            }
        }

        info!(
            dataset = %self.raw_dataset,
            chunks_read = summary.chunks_read,
            chunks_written = summary.chunks_written,
            "downsample run complete"
        );
        Ok(summary)
    }
}

/// The standard gauge downsampler set: min/max/sum/count over the value
/// column plus the period timestamp.
pub fn gauge_specs(value_column: usize) -> Vec<DownsamplerSpec> {
    vec![
        DownsamplerSpec::new(DownsamplerKind::Min, value_column),
        DownsamplerSpec::new(DownsamplerKind::Max, value_column),
        DownsamplerSpec::new(DownsamplerKind::Sum, value_column),
        DownsamplerSpec::new(DownsamplerKind::Count, value_column),
        DownsamplerSpec::timestamp(),
    ]
}

/// The counter downsampler set: the period's closing value plus the period
/// timestamp.
pub fn counter_specs(value_column: usize) -> Vec<DownsamplerSpec> {
    vec![
        DownsamplerSpec::new(DownsamplerKind::LastValue, value_column),
        DownsamplerSpec::timestamp(),
    ]
}
