//! Two-level aggregation: per-shard partials, cross-shard reduction.
//!
//! A `Map` node runs next to each shard's scan and folds that shard's
//! series into [`AggState`] partials keyed by the grouping projection. The
//! single `Reduce` node merges partials across shards and presents final
//! values. For commutative operators the split is exact; partial merge
//! order never changes the result beyond float rounding.

use crate::exec::{
    pick_dispatcher, ExecPlan, ExecResult, PlanDispatcher, RangeVectorTransformer,
};
use crate::logical::{AggregationOperator, Grouping};
use crate::{
    AggState, BadQuerySnafu, QuerySession, RangeVector, RangeVectorKey, ResultSchema, Result,
    RowData,
};
use async_trait::async_trait;
use memstore::TimeSeriesMemStore;
use std::collections::BTreeMap;
use std::sync::Arc;

const METRIC_NAME_LABEL: &str = "__name__";

/// Which half of the aggregation a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    /// Fold one shard's series into partials.
    Map,
    /// Merge partials from all shards and present final values.
    Reduce,
}

fn project_key(key: &RangeVectorKey, grouping: &Grouping) -> RangeVectorKey {
    match grouping {
        Grouping::None => RangeVectorKey::empty(),
        Grouping::By(labels) => key.project(labels),
        Grouping::Without(labels) => key
            .without(labels)
            .without_label(METRIC_NAME_LABEL),
    }
}

fn init_state(op: &AggregationOperator, key: &RangeVectorKey, v: f64) -> AggState {
    match op {
        AggregationOperator::Sum | AggregationOperator::Min | AggregationOperator::Max => {
            AggState::Simple(v)
        }
        AggregationOperator::Count | AggregationOperator::Group => AggState::Simple(1.0),
        AggregationOperator::Avg => AggState::MeanCount { mean: v, count: 1.0 },
        AggregationOperator::Stddev | AggregationOperator::Stdvar => AggState::Moments {
            count: 1.0,
            mean: v,
            m2: 0.0,
        },
        AggregationOperator::TopK(k) => AggState::TopK {
            k: *k,
            bottom: false,
            members: vec![(key.clone(), v)],
        },
        AggregationOperator::BottomK(k) => AggState::TopK {
            k: *k,
            bottom: true,
            members: vec![(key.clone(), v)],
        },
        AggregationOperator::Quantile(_) => AggState::Values(vec![v]),
        AggregationOperator::CountValues(_) => {
            let mut m = BTreeMap::new();
            m.insert(format_value(v), 1.0);
            AggState::CountValues(m)
        }
    }
}

fn format_value(v: f64) -> String {
    // trim trailing zeros the way Prometheus renders label values
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn trim_topk(members: &mut Vec<(RangeVectorKey, f64)>, k: usize, bottom: bool) {
    members.sort_by(|a, b| {
        let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
        if bottom {
            ord
        } else {
            ord.reverse()
        }
    });
    members.truncate(k);
}

fn accumulate(op: &AggregationOperator, state: &mut AggState, key: &RangeVectorKey, v: f64) {
    match (op, state) {
        (AggregationOperator::Sum, AggState::Simple(acc)) => *acc += v,
        (AggregationOperator::Min, AggState::Simple(acc)) => *acc = acc.min(v),
        (AggregationOperator::Max, AggState::Simple(acc)) => *acc = acc.max(v),
        (AggregationOperator::Count, AggState::Simple(acc)) => *acc += 1.0,
        (AggregationOperator::Group, AggState::Simple(acc)) => *acc = 1.0,
        (AggregationOperator::Avg, AggState::MeanCount { mean, count }) => {
            *mean = (*mean * *count + v) / (*count + 1.0);
            *count += 1.0;
        }
        (
            AggregationOperator::Stddev | AggregationOperator::Stdvar,
            AggState::Moments { count, mean, m2 },
        ) => {
            *count += 1.0;
            let delta = v - *mean;
            *mean += delta / *count;
            *m2 += delta * (v - *mean);
        }
        (
            AggregationOperator::TopK(_) | AggregationOperator::BottomK(_),
            AggState::TopK { k, bottom, members },
        ) => {
            members.push((key.clone(), v));
            trim_topk(members, *k, *bottom);
        }
        (AggregationOperator::Quantile(_), AggState::Values(values)) => values.push(v),
        (AggregationOperator::CountValues(_), AggState::CountValues(counts)) => {
            *counts.entry(format_value(v)).or_insert(0.0) += 1.0;
        }
        _ => unreachable!("aggregate state shape drifted from operator"),
    }
}

fn merge(op: &AggregationOperator, state: &mut AggState, other: AggState) {
    match (op, state, other) {
        (AggregationOperator::Sum, AggState::Simple(a), AggState::Simple(b)) => *a += b,
        (AggregationOperator::Min, AggState::Simple(a), AggState::Simple(b)) => *a = a.min(b),
        (AggregationOperator::Max, AggState::Simple(a), AggState::Simple(b)) => *a = a.max(b),
        (AggregationOperator::Count, AggState::Simple(a), AggState::Simple(b)) => *a += b,
        (AggregationOperator::Group, AggState::Simple(a), AggState::Simple(_)) => *a = 1.0,
        (
            AggregationOperator::Avg,
            AggState::MeanCount { mean, count },
            AggState::MeanCount {
                mean: m2,
                count: c2,
            },
        ) => {
            if c2 > 0.0 {
                *mean = (*mean * *count + m2 * c2) / (*count + c2);
                *count += c2;
            }
        }
        (
            AggregationOperator::Stddev | AggregationOperator::Stdvar,
            AggState::Moments { count, mean, m2 },
            AggState::Moments {
                count: cb,
                mean: mb,
                m2: m2b,
            },
        ) => {
            // Chan et al. parallel variance merge
            if cb > 0.0 {
                let delta = mb - *mean;
                let total = *count + cb;
                *m2 += m2b + delta * delta * *count * cb / total;
                *mean += delta * cb / total;
                *count = total;
            }
        }
        (
            AggregationOperator::TopK(_) | AggregationOperator::BottomK(_),
            AggState::TopK { k, bottom, members },
            AggState::TopK {
                members: other_members,
                ..
            },
        ) => {
            members.extend(other_members);
            trim_topk(members, *k, *bottom);
        }
        (AggregationOperator::Quantile(_), AggState::Values(a), AggState::Values(b)) => {
            a.extend(b)
        }
        (
            AggregationOperator::CountValues(_),
            AggState::CountValues(a),
            AggState::CountValues(b),
        ) => {
            for (value, count) in b {
                *a.entry(value).or_insert(0.0) += count;
            }
        }
        _ => unreachable!("aggregate state shape drifted from operator"),
    }
}

/// Fold a set of vectors into per-group, per-timestamp partial states.
fn map_partials(
    op: &AggregationOperator,
    grouping: &Grouping,
    vectors: &[RangeVector],
) -> Result<BTreeMap<RangeVectorKey, BTreeMap<i64, AggState>>> {
    let mut groups: BTreeMap<RangeVectorKey, BTreeMap<i64, AggState>> = BTreeMap::new();
    for rv in vectors {
        let rows = match &rv.rows {
            RowData::Doubles(rows) => rows,
            _ => {
                return BadQuerySnafu {
                    reason: "aggregation requires a double-valued input vector",
                }
                .fail()
            }
        };
        let group = project_key(&rv.key, grouping);
        let states = groups.entry(group).or_default();
        for (ts, v) in rows {
            if v.is_nan() {
                continue;
            }
            match states.get_mut(ts) {
                Some(state) => accumulate(op, state, &rv.key, *v),
                None => {
                    states.insert(*ts, init_state(op, &rv.key, *v));
                }
            }
        }
    }
    Ok(groups)
}

fn present(
    op: &AggregationOperator,
    group: RangeVectorKey,
    states: BTreeMap<i64, AggState>,
) -> Vec<RangeVector> {
    match op {
        AggregationOperator::TopK(_) | AggregationOperator::BottomK(_) => {
            // re-expand the winning members into their own series
            let mut by_member: BTreeMap<RangeVectorKey, Vec<(i64, f64)>> = BTreeMap::new();
            for (ts, state) in states {
                if let AggState::TopK { members, .. } = state {
                    for (key, v) in members {
                        by_member.entry(key).or_default().push((ts, v));
                    }
                }
            }
            by_member
                .into_iter()
                .map(|(key, rows)| RangeVector::doubles(key, rows))
                .collect()
        }
        AggregationOperator::CountValues(label) => {
            let mut by_value: BTreeMap<String, Vec<(i64, f64)>> = BTreeMap::new();
            for (ts, state) in states {
                if let AggState::CountValues(counts) = state {
                    for (value, count) in counts {
                        by_value.entry(value).or_default().push((ts, count));
                    }
                }
            }
            by_value
                .into_iter()
                .map(|(value, rows)| {
                    RangeVector::doubles(group.with_label(label, &value), rows)
                })
                .collect()
        }
        _ => {
            let rows = states
                .into_iter()
                .map(|(ts, state)| (ts, present_value(op, state)))
                .collect();
            vec![RangeVector::doubles(group, rows)]
        }
    }
}

fn present_value(op: &AggregationOperator, state: AggState) -> f64 {
    match (op, state) {
        (_, AggState::Simple(v)) => v,
        (_, AggState::MeanCount { mean, .. }) => mean,
        (AggregationOperator::Stdvar, AggState::Moments { count, m2, .. }) => m2 / count,
        (_, AggState::Moments { count, m2, .. }) => (m2 / count).sqrt(),
        (AggregationOperator::Quantile(q), AggState::Values(mut values)) => {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            crate::exec::periodic::quantile_sorted(&values, *q)
        }
        _ => f64::NAN,
    }
}

/// One level of the aggregation.
#[derive(Debug)]
pub struct AggregateExec {
    op: AggregationOperator,
    grouping: Grouping,
    mode: AggregateMode,
    children: Vec<Arc<dyn ExecPlan>>,
    dispatcher: Arc<dyn PlanDispatcher>,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
}

impl AggregateExec {
    /// A per-shard map node over one child.
    pub fn map(
        op: AggregationOperator,
        grouping: Grouping,
        child: Arc<dyn ExecPlan>,
    ) -> Self {
        let dispatcher = child.dispatcher();
        Self {
            op,
            grouping,
            mode: AggregateMode::Map,
            children: vec![child],
            dispatcher,
            transformers: vec![],
        }
    }

    /// The cross-shard reduce node over the map children.
    pub fn reduce(
        op: AggregationOperator,
        grouping: Grouping,
        children: Vec<Arc<dyn ExecPlan>>,
    ) -> Self {
        let dispatcher = pick_dispatcher(&children);
        Self {
            op,
            grouping,
            mode: AggregateMode::Reduce,
            children,
            dispatcher,
            transformers: vec![],
        }
    }

    /// Attach a transformer stage.
    pub fn add_range_vector_transformer(&mut self, t: Arc<dyn RangeVectorTransformer>) {
        self.transformers.push(t);
    }
}

#[async_trait]
impl ExecPlan for AggregateExec {
    fn name(&self) -> &'static str {
        match self.mode {
            AggregateMode::Map => "AggregateMapExec",
            AggregateMode::Reduce => "ReduceAggregateExec",
        }
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        self.children.clone()
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &self.transformers
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        match self.mode {
            AggregateMode::Map => {
                let child = &self.children[0];
                let result = child.dispatcher().dispatch(child, store, session).await?;
                let (_, vectors) = result.collect().await?;
                let groups = map_partials(&self.op, &self.grouping, &vectors)?;

                let out: Vec<RangeVector> = groups
                    .into_iter()
                    .map(|(key, states)| RangeVector {
                        key,
                        rows: RowData::Aggregates(states.into_iter().collect()),
                    })
                    .collect();
                Ok(ExecResult::from_vectors(partial_schema(), out))
            }
            AggregateMode::Reduce => {
                let mut groups: BTreeMap<RangeVectorKey, BTreeMap<i64, AggState>> =
                    BTreeMap::new();
                for child in &self.children {
                    session.check_deadline()?;
                    let result = child.dispatcher().dispatch(child, store, session).await?;
                    let (schema, vectors) = result.collect().await?;
                    if schema != partial_schema() {
                        return crate::SchemaMismatchSnafu {
                            reason: format!(
                                "reducer child produced {:?}, expected aggregate partials",
                                schema
                            ),
                        }
                        .fail();
                    }
                    for rv in vectors {
                        let RowData::Aggregates(rows) = rv.rows else {
                            continue;
                        };
                        let states = groups.entry(rv.key).or_default();
                        for (ts, state) in rows {
                            match states.get_mut(&ts) {
                                Some(acc) => merge(&self.op, acc, state),
                                None => {
                                    states.insert(ts, state);
                                }
                            }
                        }
                    }
                }

                let mut out = Vec::new();
                for (key, states) in groups {
                    out.extend(present(&self.op, key, states));
                }
                Ok(ExecResult::from_vectors(ResultSchema::time_series(), out))
            }
        }
    }
}

fn partial_schema() -> ResultSchema {
    ResultSchema {
        columns: vec!["timestamp".into(), "agg_state".into()],
        is_time_series: true,
        is_histogram: false,
    }
}
