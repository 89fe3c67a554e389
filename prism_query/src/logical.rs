//! The logical plan: an immutable tree of tagged plan nodes.
//!
//! Plan walking is an exhaustive `match` over the enum; there is no open
//! visitor hierarchy. Leaves carry their own time range.

use data_types::{ColumnFilter, TimeRange};

/// A function applied over the lookback window of each step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeFunction {
    /// Per-second increase of a counter, reset-corrected.
    Rate,
    /// Per-second increase from the last two samples, reset-corrected.
    Irate,
    /// Absolute counter increase over the window, reset-corrected.
    Increase,
    /// Last minus first value of a gauge.
    Delta,
    /// Sum of samples in the window.
    SumOverTime,
    /// Mean of samples in the window.
    AvgOverTime,
    /// Sample count in the window.
    CountOverTime,
    /// Minimum sample in the window.
    MinOverTime,
    /// Maximum sample in the window.
    MaxOverTime,
    /// Population standard deviation of the window.
    StddevOverTime,
    /// Population variance of the window.
    StdvarOverTime,
    /// φ-quantile of the window's samples.
    QuantileOverTime(f64),
}

/// A per-sample function on an instant vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstantFunction {
    /// Absolute value.
    Abs,
    /// Round up.
    Ceil,
    /// Round down.
    Floor,
    /// `e^x`.
    Exp,
    /// Natural log.
    Ln,
    /// Base-2 log.
    Log2,
    /// Base-10 log.
    Log10,
    /// Square root.
    Sqrt,
    /// Round to nearest multiple of the argument (default 1).
    Round(f64),
    /// Clamp below.
    ClampMin(f64),
    /// Clamp above.
    ClampMax(f64),
    /// φ-quantile from histogram buckets.
    HistogramQuantile(f64),
}

/// Functions that reshape vectors rather than map values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiscFunction {
    /// Expand histogram vectors into one series per bucket with `le`
    /// labels, Prometheus style.
    HistToPromVectors,
}

/// An aggregation operator.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationOperator {
    /// Sum across series.
    Sum,
    /// Mean across series.
    Avg,
    /// Minimum across series.
    Min,
    /// Maximum across series.
    Max,
    /// Series count.
    Count,
    /// Population standard deviation across series.
    Stddev,
    /// Population variance across series.
    Stdvar,
    /// The k largest series per step.
    TopK(usize),
    /// The k smallest series per step.
    BottomK(usize),
    /// φ-quantile across series.
    Quantile(f64),
    /// Count of series per distinct value, keyed by a new label.
    CountValues(String),
    /// Group marker: value 1 per group.
    Group,
}

/// How an aggregation projects series keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grouping {
    /// Collapse everything into one series.
    None,
    /// Keep only these labels.
    By(Vec<String>),
    /// Drop these labels.
    Without(Vec<String>),
}

/// A binary operator between vectors or scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
    /// Multiplication.
    Mul,
    /// Division.
    Div,
    /// Modulo.
    Mod,
    /// Exponentiation.
    Pow,
    /// Equality filter.
    Eq,
    /// Inequality filter.
    NotEq,
    /// Greater-than filter.
    Gt,
    /// Less-than filter.
    Lt,
    /// Greater-or-equal filter.
    Gte,
    /// Less-or-equal filter.
    Lte,
}

impl BinaryOperator {
    /// Whether this operator filters rather than computes.
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::NotEq | Self::Gt | Self::Lt | Self::Gte | Self::Lte
        )
    }

    /// Apply to two doubles. Comparison operators return the lhs value or
    /// NaN (filtered); arithmetic on NaN yields NaN.
    pub fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
            Self::Mod => lhs % rhs,
            Self::Pow => lhs.powf(rhs),
            Self::Eq => bool_filter(lhs, lhs == rhs),
            Self::NotEq => bool_filter(lhs, lhs != rhs),
            Self::Gt => bool_filter(lhs, lhs > rhs),
            Self::Lt => bool_filter(lhs, lhs < rhs),
            Self::Gte => bool_filter(lhs, lhs >= rhs),
            Self::Lte => bool_filter(lhs, lhs <= rhs),
        }
    }
}

fn bool_filter(lhs: f64, keep: bool) -> f64 {
    if keep {
        lhs
    } else {
        f64::NAN
    }
}

/// A set operator between vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    /// Intersection on join keys.
    And,
    /// Union preferring the left side.
    Or,
    /// Left side minus matching join keys.
    Unless,
}

/// Join cardinality of a [`LogicalPlan::BinaryJoin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// Exactly one match on each side per join key.
    OneToOne,
    /// The right side may repeat join keys.
    OneToMany,
    /// The left side may repeat join keys.
    ManyToOne,
    /// Both sides may repeat; set operators only.
    ManyToMany,
}

/// The stepping of a periodic (instant) query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepRange {
    /// First step, epoch ms.
    pub start: i64,
    /// Step width, ms.
    pub step: i64,
    /// Last step, epoch ms (inclusive).
    pub end: i64,
}

impl StepRange {
    /// Build a stepping; `step` must be positive.
    pub fn new(start: i64, step: i64, end: i64) -> Self {
        assert!(step > 0, "step must be positive");
        Self { start, step, end }
    }

    /// The step instants.
    pub fn steps(&self) -> impl Iterator<Item = i64> + '_ {
        (self.start..=self.end).step_by(self.step as usize)
    }
}

/// The logical plan tree.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalPlan {
    /// Scan raw series matching the filters.
    RawSeries {
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// Value columns to read; empty means the schema default.
        columns: Vec<String>,
        /// User-time range of the scan.
        range: TimeRange,
    },

    /// Scan chunk metadata of matching series.
    RawChunkMeta {
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// User-time range of the scan.
        range: TimeRange,
    },

    /// Sample a raw stream at step instants using the last value in the
    /// staleness window.
    PeriodicSeries {
        /// The raw leaf.
        raw: Box<LogicalPlan>,
        /// Stepping.
        step_range: StepRange,
    },

    /// Sample a raw stream at step instants by evaluating a range function
    /// over a lookback window.
    PeriodicSeriesWithWindowing {
        /// The raw leaf.
        raw: Box<LogicalPlan>,
        /// Stepping.
        step_range: StepRange,
        /// Lookback width, ms.
        window: i64,
        /// The window function.
        function: RangeFunction,
    },

    /// Aggregate across series.
    Aggregate {
        /// The operator.
        op: AggregationOperator,
        /// Input plan.
        inner: Box<LogicalPlan>,
        /// Key projection.
        grouping: Grouping,
    },

    /// Element-wise join of two vectors.
    BinaryJoin {
        /// Left input.
        lhs: Box<LogicalPlan>,
        /// The operator.
        op: BinaryOperator,
        /// Join cardinality.
        cardinality: Cardinality,
        /// Right input.
        rhs: Box<LogicalPlan>,
        /// Join on exactly these labels (empty: all but `ignoring`).
        on: Vec<String>,
        /// Labels excluded from the join key.
        ignoring: Vec<String>,
        /// Labels copied from the "one" side onto grouped results.
        include: Vec<String>,
    },

    /// Set operation between two vectors.
    SetOperation {
        /// Left input.
        lhs: Box<LogicalPlan>,
        /// The operator.
        op: SetOperator,
        /// Right input.
        rhs: Box<LogicalPlan>,
        /// Join on exactly these labels (empty: all but `ignoring`).
        on: Vec<String>,
        /// Labels excluded from the join key.
        ignoring: Vec<String>,
    },

    /// Combine a vector with a scalar operand.
    ScalarVectorBinaryOperation {
        /// The scalar side.
        scalar: Box<LogicalPlan>,
        /// The vector side.
        vector: Box<LogicalPlan>,
        /// The operator.
        op: BinaryOperator,
        /// Whether the scalar is the left operand.
        scalar_is_lhs: bool,
    },

    /// Apply an instant function per sample.
    ApplyInstantFunction {
        /// Input vector.
        vector: Box<LogicalPlan>,
        /// The function.
        function: InstantFunction,
    },

    /// Apply a vector-reshaping function.
    ApplyMiscellaneousFunction {
        /// Input vector.
        vector: Box<LogicalPlan>,
        /// The function.
        function: MiscFunction,
    },

    /// Sort series by their last value.
    ApplySortFunction {
        /// Input vector.
        vector: Box<LogicalPlan>,
        /// Sort descending.
        descending: bool,
    },

    /// Emit a synthetic series when the input is empty.
    ApplyAbsentFunction {
        /// Input vector.
        vector: Box<LogicalPlan>,
        /// The selector's filters; equality filters label the output.
        filters: Vec<ColumnFilter>,
        /// Stepping of the synthetic series.
        step_range: StepRange,
    },

    /// Lift a scalar to a single labelless vector (`vector(s)`).
    VectorPlan {
        /// The scalar input.
        scalar: Box<LogicalPlan>,
    },

    /// A constant scalar per step.
    ScalarFixedDouble {
        /// The constant.
        value: f64,
        /// Stepping.
        step_range: StepRange,
    },

    /// A scalar extracted from a one-series vector (`scalar(v)`).
    ScalarVaryingDouble {
        /// The vector input.
        vector: Box<LogicalPlan>,
    },

    /// A scalar derived from the step timestamp (`time()`).
    ScalarTimeBased {
        /// Stepping.
        step_range: StepRange,
    },

    /// Arithmetic between two scalars.
    ScalarBinaryOperation {
        /// Left scalar.
        lhs: Box<LogicalPlan>,
        /// The operator.
        op: BinaryOperator,
        /// Right scalar.
        rhs: Box<LogicalPlan>,
    },

    /// Metadata: values of one label.
    LabelValues {
        /// The label name.
        label: String,
        /// Filters restricting the series considered.
        filters: Vec<ColumnFilter>,
    },

    /// Metadata: series keys matching filters.
    SeriesKeysByFilters {
        /// Label filters.
        filters: Vec<ColumnFilter>,
        /// User-time range.
        range: TimeRange,
    },
}

impl LogicalPlan {
    /// Child plans, left to right.
    pub fn children(&self) -> Vec<&LogicalPlan> {
        match self {
            Self::RawSeries { .. }
            | Self::RawChunkMeta { .. }
            | Self::ScalarFixedDouble { .. }
            | Self::ScalarTimeBased { .. }
            | Self::LabelValues { .. }
            | Self::SeriesKeysByFilters { .. } => vec![],
            Self::PeriodicSeries { raw, .. } => vec![raw],
            Self::PeriodicSeriesWithWindowing { raw, .. } => vec![raw],
            Self::Aggregate { inner, .. } => vec![inner],
            Self::BinaryJoin { lhs, rhs, .. } => vec![lhs, rhs],
            Self::SetOperation { lhs, rhs, .. } => vec![lhs, rhs],
            Self::ScalarVectorBinaryOperation { scalar, vector, .. } => vec![scalar, vector],
            Self::ApplyInstantFunction { vector, .. }
            | Self::ApplyMiscellaneousFunction { vector, .. }
            | Self::ApplySortFunction { vector, .. }
            | Self::ApplyAbsentFunction { vector, .. }
            | Self::ScalarVaryingDouble { vector } => vec![vector],
            Self::VectorPlan { scalar } => vec![scalar],
            Self::ScalarBinaryOperation { lhs, rhs, .. } => vec![lhs, rhs],
        }
    }

    /// All leaves, left to right.
    pub fn find_leaves(&self) -> Vec<&LogicalPlan> {
        let children = self.children();
        if children.is_empty() {
            return vec![self];
        }
        children.into_iter().flat_map(Self::find_leaves).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::ColumnFilter;

    fn raw(name: &str) -> LogicalPlan {
        LogicalPlan::RawSeries {
            filters: vec![ColumnFilter::equals("__name__", name)],
            columns: vec![],
            range: TimeRange::new(0, 100),
        }
    }

    #[test]
    fn test_find_leaves_left_to_right() {
        let plan = LogicalPlan::BinaryJoin {
            lhs: Box::new(LogicalPlan::PeriodicSeries {
                raw: Box::new(raw("a")),
                step_range: StepRange::new(0, 10, 100),
            }),
            op: BinaryOperator::Add,
            cardinality: Cardinality::OneToOne,
            rhs: Box::new(raw("b")),
            on: vec![],
            ignoring: vec![],
            include: vec![],
        };

        let leaves = plan.find_leaves();
        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0], &raw("a"));
        assert_eq!(leaves[1], &raw("b"));
    }

    #[test]
    fn test_step_range_steps() {
        let steps: Vec<i64> = StepRange::new(60, 60, 300).steps().collect();
        assert_eq!(steps, vec![60, 120, 180, 240, 300]);
    }

    #[test]
    fn test_comparison_filters() {
        assert_eq!(BinaryOperator::Gt.apply(5.0, 3.0), 5.0);
        assert!(BinaryOperator::Gt.apply(2.0, 3.0).is_nan());
        assert_eq!(BinaryOperator::Add.apply(2.0, 3.0), 5.0);
        assert!(BinaryOperator::Add.apply(f64::NAN, 3.0).is_nan());
    }
}
