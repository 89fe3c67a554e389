//! The materializer: logical plan → physical exec tree.
//!
//! Leaves fan out across the shards whose partitions the filters can
//! match, one `SelectRawPartitionsExec` per shard under a concatenation
//! node. Distributable stages (periodic sampling, instant functions,
//! partial aggregation) stay on the per-shard subplans; global-vision
//! stages (joins, sort, absent, scalar extraction, histogram-bucket
//! grouping) sit above the concatenation point.

use crate::exec::aggregate::AggregateExec;
use crate::exec::binary_join::{BinaryJoinExec, SetOperatorExec};
use crate::exec::histogram::{HistToPromSeriesMapper, HistogramQuantileMapper};
use crate::exec::periodic::{PeriodicSamplesMapper, DEFAULT_STALENESS_MS};
use crate::exec::select::{
    LabelValuesExec, PartKeysExec, RawChunkMetaExec, SelectRawPartitionsExec,
};
use crate::exec::transformers::{
    AbsentExec, InstantVectorFunctionMapper, ScalarBinaryOpExec, ScalarFixedExec,
    ScalarFromVectorExec, ScalarTimeExec, ScalarVectorOpExec, SortExec, VectorExec,
};
use crate::exec::{
    ExecPlan, LocalPartitionDistConcatExec, RangeVectorTransformer, TransformExec,
};
use crate::logical::{InstantFunction, LogicalPlan, MiscFunction, StepRange};
use crate::{BadQuerySnafu, QueryError, Result, UndefinedColumnSnafu, UnknownDatasetSnafu};
use data_types::{ColumnFilter, ColumnType, Dataset, ShardId, TimeRange};
use memstore::TimeSeriesMemStore;
use snafu::OptionExt;
use std::sync::Arc;

/// Widening applied to leaf scans so the chunk holding the earliest
/// relevant sample is always opened. Matches the store's flush interval
/// bound on chunk length.
const MAX_CHUNK_TIME_MS: i64 = 3_600_000;

/// Either a still-distributable set of per-shard subplans or an already
/// gathered single node.
enum Materialized {
    PerShard(Vec<Arc<dyn ExecPlan>>),
    Single(Arc<dyn ExecPlan>),
}

impl Materialized {
    fn gather(self) -> Arc<dyn ExecPlan> {
        match self {
            Self::Single(node) => node,
            Self::PerShard(nodes) => Arc::new(LocalPartitionDistConcatExec::new(nodes)),
        }
    }

    fn map_each(
        self,
        f: impl Fn(Arc<dyn ExecPlan>) -> Arc<dyn ExecPlan>,
    ) -> Self {
        match self {
            Self::PerShard(nodes) => Self::PerShard(nodes.into_iter().map(f).collect()),
            Self::Single(node) => Self::Single(f(node)),
        }
    }
}

/// Materializes logical plans against one dataset of a memstore.
#[derive(Debug)]
pub struct Planner {
    store: Arc<TimeSeriesMemStore>,
    dataset: String,
}

impl Planner {
    /// Build a planner for `dataset`.
    pub fn new(store: Arc<TimeSeriesMemStore>, dataset: impl Into<String>) -> Self {
        Self {
            store,
            dataset: dataset.into(),
        }
    }

    fn dataset(&self) -> Result<Dataset> {
        self.store
            .dataset(&self.dataset)
            .context(UnknownDatasetSnafu {
                dataset: &self.dataset,
            })
    }

    fn shards(&self) -> Result<Vec<ShardId>> {
        let shards = self.store.local_shards(&self.dataset);
        if shards.is_empty() {
            return UnknownDatasetSnafu {
                dataset: &self.dataset,
            }
            .fail();
        }
        Ok(shards)
    }

    /// Resolve the selected value column to `(index among value columns,
    /// is histogram)`.
    fn resolve_column(&self, columns: &[String]) -> Result<(usize, bool)> {
        let dataset = self.dataset()?;
        let value_columns: Vec<_> = dataset.schema.value_columns().collect();
        match columns {
            [] => {
                let (_, col) = value_columns.first().context(BadQuerySnafu {
                    reason: "dataset has no value columns",
                })?;
                Ok((0, col.column_type == ColumnType::Histogram))
            }
            [name] => {
                let idx = value_columns
                    .iter()
                    .position(|(_, c)| &c.name == name)
                    .context(UndefinedColumnSnafu { column: name })?;
                Ok((
                    idx,
                    value_columns[idx].1.column_type == ColumnType::Histogram,
                ))
            }
            _ => BadQuerySnafu {
                reason: "at most one value column may be selected",
            }
            .fail(),
        }
    }

    fn leaves(
        &self,
        filters: &[ColumnFilter],
        columns: &[String],
        range: TimeRange,
        mapper: Option<PeriodicSamplesMapper>,
    ) -> Result<Materialized> {
        let (value_idx, is_histogram) = self.resolve_column(columns)?;
        let nodes = self
            .shards()?
            .into_iter()
            .map(|shard| {
                let mut leaf = SelectRawPartitionsExec::new(
                    self.dataset.clone(),
                    shard,
                    filters.to_vec(),
                    range,
                    MAX_CHUNK_TIME_MS,
                    value_idx,
                    is_histogram,
                );
                if let Some(mapper) = &mapper {
                    leaf.add_range_vector_transformer(Arc::new(mapper.clone()));
                }
                Arc::new(leaf) as Arc<dyn ExecPlan>
            })
            .collect();
        Ok(Materialized::PerShard(nodes))
    }

    /// Materialize a logical plan into an executable tree.
    pub fn materialize(&self, plan: &LogicalPlan) -> Result<Arc<dyn ExecPlan>> {
        Ok(self.materialize_inner(plan)?.gather())
    }

    fn materialize_inner(&self, plan: &LogicalPlan) -> Result<Materialized> {
        match plan {
            LogicalPlan::RawSeries {
                filters,
                columns,
                range,
            } => self.leaves(filters, columns, *range, None),

            LogicalPlan::RawChunkMeta { filters, range } => {
                let nodes = self
                    .shards()?
                    .into_iter()
                    .map(|shard| {
                        Arc::new(RawChunkMetaExec::new(
                            self.dataset.clone(),
                            shard,
                            filters.clone(),
                            *range,
                        )) as Arc<dyn ExecPlan>
                    })
                    .collect();
                Ok(Materialized::PerShard(nodes))
            }

            LogicalPlan::PeriodicSeries { raw, step_range } => {
                let (filters, columns) = raw_parts(raw)?;
                let range = TimeRange::new(
                    step_range.start.saturating_sub(DEFAULT_STALENESS_MS),
                    step_range.end,
                );
                self.leaves(
                    filters,
                    columns,
                    range,
                    Some(PeriodicSamplesMapper::last_sample(*step_range)),
                )
            }

            LogicalPlan::PeriodicSeriesWithWindowing {
                raw,
                step_range,
                window,
                function,
            } => {
                let (filters, columns) = raw_parts(raw)?;
                let range = TimeRange::new(
                    step_range.start.saturating_sub(*window),
                    step_range.end,
                );
                self.leaves(
                    filters,
                    columns,
                    range,
                    Some(PeriodicSamplesMapper::windowed(
                        *step_range,
                        *window,
                        *function,
                    )),
                )
            }

            LogicalPlan::Aggregate { op, inner, grouping } => {
                let inner = self.materialize_inner(inner)?;
                let maps: Vec<Arc<dyn ExecPlan>> = match inner {
                    Materialized::PerShard(nodes) => nodes
                        .into_iter()
                        .map(|node| {
                            Arc::new(AggregateExec::map(op.clone(), grouping.clone(), node))
                                as Arc<dyn ExecPlan>
                        })
                        .collect(),
                    Materialized::Single(node) => {
                        vec![Arc::new(AggregateExec::map(
                            op.clone(),
                            grouping.clone(),
                            node,
                        )) as Arc<dyn ExecPlan>]
                    }
                };
                Ok(Materialized::Single(Arc::new(AggregateExec::reduce(
                    op.clone(),
                    grouping.clone(),
                    maps,
                ))))
            }

            LogicalPlan::BinaryJoin {
                lhs,
                op,
                cardinality,
                rhs,
                on,
                ignoring,
                include,
            } => {
                let lhs = self.materialize_inner(lhs)?.gather();
                let rhs = self.materialize_inner(rhs)?.gather();
                Ok(Materialized::Single(Arc::new(BinaryJoinExec::new(
                    lhs,
                    rhs,
                    *op,
                    *cardinality,
                    on.clone(),
                    ignoring.clone(),
                    include.clone(),
                ))))
            }

            LogicalPlan::SetOperation {
                lhs,
                op,
                rhs,
                on,
                ignoring,
            } => {
                let lhs = self.materialize_inner(lhs)?.gather();
                let rhs = self.materialize_inner(rhs)?.gather();
                Ok(Materialized::Single(Arc::new(SetOperatorExec::new(
                    lhs,
                    rhs,
                    *op,
                    on.clone(),
                    ignoring.clone(),
                ))))
            }

            LogicalPlan::ScalarVectorBinaryOperation {
                scalar,
                vector,
                op,
                scalar_is_lhs,
            } => {
                let scalar = self.materialize_inner(scalar)?.gather();
                let vector = self.materialize_inner(vector)?.gather();
                Ok(Materialized::Single(Arc::new(ScalarVectorOpExec::new(
                    scalar,
                    vector,
                    *op,
                    *scalar_is_lhs,
                ))))
            }

            LogicalPlan::ApplyInstantFunction { vector, function } => {
                let inner = self.materialize_inner(vector)?;
                match function {
                    InstantFunction::HistogramQuantile(q) => {
                        // bucket grouping needs all series in one place
                        let gathered = inner.gather();
                        Ok(Materialized::Single(Arc::new(TransformExec::new(
                            gathered,
                            Arc::new(HistogramQuantileMapper::new(*q)),
                        ))))
                    }
                    _ => {
                        let mapper: Arc<dyn RangeVectorTransformer> =
                            Arc::new(InstantVectorFunctionMapper::new(*function)?);
                        Ok(inner.map_each(|node| {
                            Arc::new(TransformExec::new(node, Arc::clone(&mapper)))
                                as Arc<dyn ExecPlan>
                        }))
                    }
                }
            }

            LogicalPlan::ApplyMiscellaneousFunction { vector, function } => {
                let inner = self.materialize_inner(vector)?;
                match function {
                    MiscFunction::HistToPromVectors => {
                        let mapper: Arc<dyn RangeVectorTransformer> = Arc::new(HistToPromSeriesMapper);
                        Ok(inner.map_each(|node| {
                            Arc::new(TransformExec::new(node, Arc::clone(&mapper)))
                                as Arc<dyn ExecPlan>
                        }))
                    }
                }
            }

            LogicalPlan::ApplySortFunction { vector, descending } => {
                let inner = self.materialize_inner(vector)?.gather();
                Ok(Materialized::Single(Arc::new(SortExec::new(
                    inner,
                    *descending,
                ))))
            }

            LogicalPlan::ApplyAbsentFunction {
                vector,
                filters,
                step_range,
            } => {
                let inner = self.materialize_inner(vector)?.gather();
                Ok(Materialized::Single(Arc::new(AbsentExec::new(
                    inner,
                    filters.clone(),
                    *step_range,
                ))))
            }

            LogicalPlan::VectorPlan { scalar } => {
                let scalar = self.materialize_inner(scalar)?.gather();
                Ok(Materialized::Single(Arc::new(VectorExec::new(scalar))))
            }

            LogicalPlan::ScalarFixedDouble { value, step_range } => Ok(Materialized::Single(
                Arc::new(ScalarFixedExec::new(*value, *step_range)),
            )),

            LogicalPlan::ScalarTimeBased { step_range } => Ok(Materialized::Single(Arc::new(
                ScalarTimeExec::new(*step_range),
            ))),

            LogicalPlan::ScalarVaryingDouble { vector } => {
                let step_range = infer_step_range(vector).context(BadQuerySnafu {
                    reason: "scalar() requires a stepped vector input",
                })?;
                let inner = self.materialize_inner(vector)?.gather();
                Ok(Materialized::Single(Arc::new(ScalarFromVectorExec::new(
                    inner, step_range,
                ))))
            }

            LogicalPlan::ScalarBinaryOperation { lhs, op, rhs } => {
                let lhs = self.materialize_inner(lhs)?.gather();
                let rhs = self.materialize_inner(rhs)?.gather();
                Ok(Materialized::Single(Arc::new(ScalarBinaryOpExec::new(
                    lhs, rhs, *op,
                ))))
            }

            LogicalPlan::LabelValues { label, filters: _ } => {
                let nodes = self
                    .shards()?
                    .into_iter()
                    .map(|shard| {
                        Arc::new(LabelValuesExec::new(
                            self.dataset.clone(),
                            shard,
                            label.clone(),
                        )) as Arc<dyn ExecPlan>
                    })
                    .collect();
                Ok(Materialized::PerShard(nodes))
            }

            LogicalPlan::SeriesKeysByFilters { filters, range: _ } => {
                let nodes = self
                    .shards()?
                    .into_iter()
                    .map(|shard| {
                        Arc::new(PartKeysExec::new(
                            self.dataset.clone(),
                            shard,
                            filters.clone(),
                        )) as Arc<dyn ExecPlan>
                    })
                    .collect();
                Ok(Materialized::PerShard(nodes))
            }
        }
    }
}

fn raw_parts(plan: &LogicalPlan) -> Result<(&[ColumnFilter], &[String])> {
    match plan {
        LogicalPlan::RawSeries {
            filters, columns, ..
        } => Ok((filters, columns)),
        _ => Err(QueryError::BadQuery {
            reason: "periodic sampling requires a raw series leaf".to_string(),
        }),
    }
}

/// Find the stepping of the first periodic node under `plan`, used to give
/// `scalar()` its output steps.
fn infer_step_range(plan: &LogicalPlan) -> Option<StepRange> {
    match plan {
        LogicalPlan::PeriodicSeries { step_range, .. }
        | LogicalPlan::PeriodicSeriesWithWindowing { step_range, .. }
        | LogicalPlan::ScalarFixedDouble { step_range, .. }
        | LogicalPlan::ScalarTimeBased { step_range }
        | LogicalPlan::ApplyAbsentFunction { step_range, .. } => Some(*step_range),
        _ => plan.children().iter().find_map(|c| infer_step_range(c)),
    }
}
