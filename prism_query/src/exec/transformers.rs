//! Instant functions, scalar plans, sort/absent, and scalar-vector
//! arithmetic.

use crate::exec::{
    buffered, ExecPlan, ExecResult, InProcessPlanDispatcher, PlanDispatcher,
    RangeVectorTransformer,
};
use crate::logical::{BinaryOperator, InstantFunction, StepRange};
use crate::{
    BadQuerySnafu, QuerySession, RangeVector, RangeVectorKey, ResultSchema, Result, RowData,
};
use async_trait::async_trait;
use data_types::{ColumnFilter, FilterOp};
use futures::StreamExt;
use memstore::TimeSeriesMemStore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Applies an instant function to every sample of every vector.
#[derive(Debug, Clone, Copy)]
pub struct InstantVectorFunctionMapper {
    function: InstantFunction,
}

impl InstantVectorFunctionMapper {
    /// Build a mapper; `histogram_quantile` has its own mapper and is
    /// rejected here.
    pub fn new(function: InstantFunction) -> Result<Self> {
        if matches!(function, InstantFunction::HistogramQuantile(_)) {
            return BadQuerySnafu {
                reason: "histogram_quantile is handled by the histogram mapper",
            }
            .fail();
        }
        Ok(Self { function })
    }

    fn apply(function: InstantFunction, v: f64) -> f64 {
        match function {
            InstantFunction::Abs => v.abs(),
            InstantFunction::Ceil => v.ceil(),
            InstantFunction::Floor => v.floor(),
            InstantFunction::Exp => v.exp(),
            InstantFunction::Ln => v.ln(),
            InstantFunction::Log2 => v.log2(),
            InstantFunction::Log10 => v.log10(),
            InstantFunction::Sqrt => v.sqrt(),
            InstantFunction::Round(to) => (v / to).round() * to,
            InstantFunction::ClampMin(min) => v.max(min),
            InstantFunction::ClampMax(max) => v.min(max),
            InstantFunction::HistogramQuantile(_) => f64::NAN,
        }
    }
}

impl RangeVectorTransformer for InstantVectorFunctionMapper {
    fn name(&self) -> &'static str {
        "InstantVectorFunctionMapper"
    }

    fn transform(&self, input: ExecResult, _session: &QuerySession) -> Result<ExecResult> {
        let function = self.function;
        let stream = input
            .stream
            .map(move |rv| {
                let rv = rv?;
                let rows = match rv.rows {
                    RowData::Doubles(rows) => RowData::Doubles(
                        rows.into_iter()
                            .map(|(ts, v)| (ts, Self::apply(function, v)))
                            .collect(),
                    ),
                    other => other,
                };
                Ok(RangeVector { key: rv.key, rows })
            })
            .boxed();
        Ok(ExecResult {
            schema: input.schema,
            stream,
        })
    }
}

/// A scalar operand resolved per timestamp.
#[derive(Debug, Clone)]
pub enum ScalarValues {
    /// The same value at every step.
    Fixed(f64),
    /// Looked up per timestamp.
    PerStep(BTreeMap<i64, f64>),
}

impl ScalarValues {
    fn at(&self, ts: i64) -> f64 {
        match self {
            Self::Fixed(v) => *v,
            Self::PerStep(values) => values.get(&ts).copied().unwrap_or(f64::NAN),
        }
    }
}

/// Combines a vector stream with a scalar operand; the vector side streams,
/// the scalar side was already reduced to per-step values.
#[derive(Debug)]
pub struct ScalarVectorOpExec {
    scalar: Arc<dyn ExecPlan>,
    vector: Arc<dyn ExecPlan>,
    op: BinaryOperator,
    scalar_is_lhs: bool,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
}

impl ScalarVectorOpExec {
    /// Build a scalar-vector operation node.
    pub fn new(
        scalar: Arc<dyn ExecPlan>,
        vector: Arc<dyn ExecPlan>,
        op: BinaryOperator,
        scalar_is_lhs: bool,
    ) -> Self {
        Self {
            scalar,
            vector,
            op,
            scalar_is_lhs,
            transformers: vec![],
        }
    }

    /// Attach a transformer stage.
    pub fn add_range_vector_transformer(&mut self, t: Arc<dyn RangeVectorTransformer>) {
        self.transformers.push(t);
    }
}

#[async_trait]
impl ExecPlan for ScalarVectorOpExec {
    fn name(&self) -> &'static str {
        "ScalarVectorOpExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.scalar), Arc::clone(&self.vector)]
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        self.vector.dispatcher()
    }

    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &self.transformers
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        let scalar_result = self
            .scalar
            .dispatcher()
            .dispatch(&self.scalar, store, session)
            .await?;
        let (_, scalar_vectors) = scalar_result.collect().await?;
        let scalar = ScalarValues::PerStep(
            scalar_vectors
                .first()
                .and_then(|rv| rv.rows.as_doubles())
                .map(|rows| rows.iter().copied().collect())
                .unwrap_or_default(),
        );

        let vector_result = self
            .vector
            .dispatcher()
            .dispatch(&self.vector, store, session)
            .await?;
        let op = self.op;
        let scalar_is_lhs = self.scalar_is_lhs;
        let stream = vector_result
            .stream
            .map(move |rv| {
                let rv = rv?;
                let rows = match rv.rows {
                    RowData::Doubles(rows) => RowData::Doubles(
                        rows.into_iter()
                            .map(|(ts, v)| {
                                let s = scalar.at(ts);
                                let out = if scalar_is_lhs {
                                    op.apply(s, v)
                                } else {
                                    op.apply(v, s)
                                };
                                (ts, out)
                            })
                            .collect(),
                    ),
                    _ => {
                        return BadQuerySnafu {
                            reason: "scalar arithmetic requires a double-valued vector",
                        }
                        .fail()
                    }
                };
                Ok(RangeVector { key: rv.key, rows })
            })
            .boxed();

        Ok(ExecResult {
            schema: vector_result.schema,
            stream,
        })
    }
}

/// A constant scalar: one labelless vector with the value at every step.
#[derive(Debug)]
pub struct ScalarFixedExec {
    value: f64,
    step_range: StepRange,
}

impl ScalarFixedExec {
    /// Build a constant scalar plan.
    pub fn new(value: f64, step_range: StepRange) -> Self {
        Self { value, step_range }
    }
}

#[async_trait]
impl ExecPlan for ScalarFixedExec {
    fn name(&self) -> &'static str {
        "ScalarFixedExec"
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::new(InProcessPlanDispatcher)
    }

    async fn do_execute(
        &self,
        _store: &Arc<TimeSeriesMemStore>,
        _session: &QuerySession,
    ) -> Result<ExecResult> {
        let rows = self.step_range.steps().map(|t| (t, self.value)).collect();
        Ok(ExecResult::from_vectors(
            ResultSchema::time_series(),
            vec![RangeVector::doubles(RangeVectorKey::empty(), rows)],
        ))
    }
}

/// `time()`: the step timestamp in seconds at every step.
#[derive(Debug)]
pub struct ScalarTimeExec {
    step_range: StepRange,
}

impl ScalarTimeExec {
    /// Build a time scalar plan.
    pub fn new(step_range: StepRange) -> Self {
        Self { step_range }
    }
}

#[async_trait]
impl ExecPlan for ScalarTimeExec {
    fn name(&self) -> &'static str {
        "ScalarTimeExec"
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::new(InProcessPlanDispatcher)
    }

    async fn do_execute(
        &self,
        _store: &Arc<TimeSeriesMemStore>,
        _session: &QuerySession,
    ) -> Result<ExecResult> {
        let rows = self
            .step_range
            .steps()
            .map(|t| (t, t as f64 / 1000.0))
            .collect();
        Ok(ExecResult::from_vectors(
            ResultSchema::time_series(),
            vec![RangeVector::doubles(RangeVectorKey::empty(), rows)],
        ))
    }
}

/// `scalar(v)`: the single series' value per step, NaN when the input does
/// not have exactly one series. Requires global vision, hence a buffering
/// node above the shard concatenation.
#[derive(Debug)]
pub struct ScalarFromVectorExec {
    vector: Arc<dyn ExecPlan>,
    step_range: StepRange,
}

impl ScalarFromVectorExec {
    /// Build a scalar-extraction plan.
    pub fn new(vector: Arc<dyn ExecPlan>, step_range: StepRange) -> Self {
        Self { vector, step_range }
    }
}

#[async_trait]
impl ExecPlan for ScalarFromVectorExec {
    fn name(&self) -> &'static str {
        "ScalarFromVectorExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.vector)]
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        self.vector.dispatcher()
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        let result = self
            .vector
            .dispatcher()
            .dispatch(&self.vector, store, session)
            .await?;
        let (_, vectors) = result.collect().await?;

        let source: Option<BTreeMap<i64, f64>> = match vectors.as_slice() {
            [only] => only
                .rows
                .as_doubles()
                .map(|rows| rows.iter().copied().collect()),
            _ => None,
        };
        let rows = self
            .step_range
            .steps()
            .map(|t| {
                let v = source
                    .as_ref()
                    .and_then(|rows| rows.get(&t).copied())
                    .unwrap_or(f64::NAN);
                (t, v)
            })
            .collect();
        Ok(ExecResult::from_vectors(
            ResultSchema::time_series(),
            vec![RangeVector::doubles(RangeVectorKey::empty(), rows)],
        ))
    }
}

/// Arithmetic between two scalar plans, zipped per step.
#[derive(Debug)]
pub struct ScalarBinaryOpExec {
    lhs: Arc<dyn ExecPlan>,
    rhs: Arc<dyn ExecPlan>,
    op: BinaryOperator,
}

impl ScalarBinaryOpExec {
    /// Build a scalar-scalar operation.
    pub fn new(lhs: Arc<dyn ExecPlan>, rhs: Arc<dyn ExecPlan>, op: BinaryOperator) -> Self {
        Self { lhs, rhs, op }
    }
}

#[async_trait]
impl ExecPlan for ScalarBinaryOpExec {
    fn name(&self) -> &'static str {
        "ScalarBinaryOpExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.lhs), Arc::clone(&self.rhs)]
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::new(InProcessPlanDispatcher)
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        let lhs = self
            .lhs
            .dispatcher()
            .dispatch(&self.lhs, store, session)
            .await?;
        let rhs = self
            .rhs
            .dispatcher()
            .dispatch(&self.rhs, store, session)
            .await?;
        let (_, lhs_vectors) = lhs.collect().await?;
        let (_, rhs_vectors) = rhs.collect().await?;

        let rhs_rows: BTreeMap<i64, f64> = rhs_vectors
            .first()
            .and_then(|rv| rv.rows.as_doubles())
            .map(|rows| rows.iter().copied().collect())
            .unwrap_or_default();
        let op = self.op;
        let rows: Vec<(i64, f64)> = lhs_vectors
            .first()
            .and_then(|rv| rv.rows.as_doubles())
            .map(|rows| {
                rows.iter()
                    .map(|(ts, v)| {
                        (
                            *ts,
                            op.apply(*v, rhs_rows.get(ts).copied().unwrap_or(f64::NAN)),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ExecResult::from_vectors(
            ResultSchema::time_series(),
            vec![RangeVector::doubles(RangeVectorKey::empty(), rows)],
        ))
    }
}

/// `vector(s)`: lift a scalar stream to a labelless instant vector.
#[derive(Debug)]
pub struct VectorExec {
    scalar: Arc<dyn ExecPlan>,
}

impl VectorExec {
    /// Build a vector-from-scalar plan.
    pub fn new(scalar: Arc<dyn ExecPlan>) -> Self {
        Self { scalar }
    }
}

#[async_trait]
impl ExecPlan for VectorExec {
    fn name(&self) -> &'static str {
        "VectorExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.scalar)]
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        self.scalar.dispatcher()
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        self.scalar
            .dispatcher()
            .dispatch(&self.scalar, store, session)
            .await
    }
}

/// Sorts series by their final sample value. A buffering node.
#[derive(Debug)]
pub struct SortExec {
    child: Arc<dyn ExecPlan>,
    descending: bool,
}

impl SortExec {
    /// Build a sort node.
    pub fn new(child: Arc<dyn ExecPlan>, descending: bool) -> Self {
        Self { child, descending }
    }
}

#[async_trait]
impl ExecPlan for SortExec {
    fn name(&self) -> &'static str {
        "SortExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.child)]
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        self.child.dispatcher()
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        let result = self
            .child
            .dispatcher()
            .dispatch(&self.child, store, session)
            .await?;
        let descending = self.descending;
        let schema = result.schema.clone();
        let stream = buffered(result.stream, move |mut vectors| {
            let last_value = |rv: &RangeVector| -> f64 {
                rv.rows
                    .as_doubles()
                    .and_then(|rows| rows.last())
                    .map(|(_, v)| *v)
                    .unwrap_or(f64::NAN)
            };
            vectors.sort_by(|a, b| {
                let ord = last_value(a)
                    .partial_cmp(&last_value(b))
                    .unwrap_or(std::cmp::Ordering::Equal);
                if descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
            Ok(vectors)
        });
        Ok(ExecResult { schema, stream })
    }
}

/// `absent(v)`: a synthetic series valued 1 at every step when the input
/// is empty. Labels come from the selector's equality filters. A buffering
/// node.
#[derive(Debug)]
pub struct AbsentExec {
    child: Arc<dyn ExecPlan>,
    filters: Vec<ColumnFilter>,
    step_range: StepRange,
}

impl AbsentExec {
    /// Build an absent node.
    pub fn new(
        child: Arc<dyn ExecPlan>,
        filters: Vec<ColumnFilter>,
        step_range: StepRange,
    ) -> Self {
        Self {
            child,
            filters,
            step_range,
        }
    }
}

#[async_trait]
impl ExecPlan for AbsentExec {
    fn name(&self) -> &'static str {
        "AbsentExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.child)]
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        self.child.dispatcher()
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        let result = self
            .child
            .dispatcher()
            .dispatch(&self.child, store, session)
            .await?;
        let (_, vectors) = result.collect().await?;

        if vectors.iter().any(|rv| !rv.rows.is_empty()) {
            return Ok(ExecResult::empty(ResultSchema::time_series()));
        }

        let labels: Vec<(&str, &str)> = self
            .filters
            .iter()
            .filter(|f| f.column != "__name__")
            .filter_map(|f| match &f.op {
                FilterOp::Equals(v) => Some((f.column.as_str(), v.as_str())),
                _ => None,
            })
            .collect();
        let rows = self.step_range.steps().map(|t| (t, 1.0)).collect();
        Ok(ExecResult::from_vectors(
            ResultSchema::time_series(),
            vec![RangeVector::doubles(
                RangeVectorKey::from_labels(labels),
                rows,
            )],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_functions() {
        let f = |func, v| InstantVectorFunctionMapper::apply(func, v);
        assert_eq!(f(InstantFunction::Abs, -2.0), 2.0);
        assert_eq!(f(InstantFunction::Ceil, 1.2), 2.0);
        assert_eq!(f(InstantFunction::Floor, 1.8), 1.0);
        assert_eq!(f(InstantFunction::Sqrt, 9.0), 3.0);
        assert_eq!(f(InstantFunction::Round(1.0), 2.5), 3.0);
        assert_eq!(f(InstantFunction::Round(0.5), 2.3), 2.5);
        assert_eq!(f(InstantFunction::ClampMin(0.0), -5.0), 0.0);
        assert_eq!(f(InstantFunction::ClampMax(10.0), 15.0), 10.0);
        assert_eq!(f(InstantFunction::Log2, 8.0), 3.0);
        assert!(f(InstantFunction::Ln, -1.0).is_nan());
    }

    #[test]
    fn test_scalar_values_lookup() {
        let fixed = ScalarValues::Fixed(2.5);
        assert_eq!(fixed.at(999), 2.5);

        let per_step = ScalarValues::PerStep([(10, 1.0)].into_iter().collect());
        assert_eq!(per_step.at(10), 1.0);
        assert!(per_step.at(20).is_nan());
    }
}
