//! Range vectors: the currency between exec-plan nodes.

use data_types::HistogramValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The identity of one output series: an ordered map of label name to
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct RangeVectorKey {
    labels: BTreeMap<Arc<str>, Arc<str>>,
}

impl RangeVectorKey {
    /// The empty key, used by scalars.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from label pairs.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            labels: labels
                .into_iter()
                .map(|(n, v)| (Arc::from(n), Arc::from(v)))
                .collect(),
        }
    }

    /// The label map.
    pub fn labels(&self) -> &BTreeMap<Arc<str>, Arc<str>> {
        &self.labels
    }

    /// Value of one label.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(|v| v.as_ref())
    }

    /// The key restricted to `names`.
    pub fn project(&self, names: &[String]) -> Self {
        Self {
            labels: self
                .labels
                .iter()
                .filter(|(n, _)| names.iter().any(|p| p.as_str() == n.as_ref()))
                .map(|(n, v)| (Arc::clone(n), Arc::clone(v)))
                .collect(),
        }
    }

    /// The key without `names`.
    pub fn without(&self, names: &[String]) -> Self {
        Self {
            labels: self
                .labels
                .iter()
                .filter(|(n, _)| !names.iter().any(|p| p.as_str() == n.as_ref()))
                .map(|(n, v)| (Arc::clone(n), Arc::clone(v)))
                .collect(),
        }
    }

    /// A copy with `name` set to `value`.
    pub fn with_label(&self, name: &str, value: &str) -> Self {
        let mut labels = self.labels.clone();
        labels.insert(Arc::from(name), Arc::from(value));
        Self { labels }
    }

    /// A copy with `name` removed.
    pub fn without_label(&self, name: &str) -> Self {
        let mut labels = self.labels.clone();
        labels.remove(name);
        Self { labels }
    }
}

impl std::fmt::Display for RangeVectorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (n, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{n}={v}")?;
        }
        write!(f, "}}")
    }
}

/// Partial aggregation state flowing from per-shard map nodes to the
/// cross-shard reducer. The in-process analog of the aggregate row schemas
/// a clustered deployment would put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum AggState {
    /// A single running value (sum, min, max, count, group).
    Simple(f64),
    /// Running mean with its weight.
    MeanCount {
        /// Mean so far.
        mean: f64,
        /// Samples behind it.
        count: f64,
    },
    /// Welford moments for stddev/stdvar.
    Moments {
        /// Samples so far.
        count: f64,
        /// Running mean.
        mean: f64,
        /// Sum of squared deviations.
        m2: f64,
    },
    /// Bounded top/bottom set of `(series, value)` members.
    TopK {
        /// Bound.
        k: usize,
        /// Keep smallest instead of largest.
        bottom: bool,
        /// Current members.
        members: Vec<(RangeVectorKey, f64)>,
    },
    /// All values, for exact quantiles.
    Values(Vec<f64>),
    /// Series count per distinct sample value.
    CountValues(BTreeMap<String, f64>),
}

/// The rows of one range vector.
#[derive(Debug, Clone, PartialEq)]
pub enum RowData {
    /// `(timestamp, value)` rows.
    Doubles(Vec<(i64, f64)>),
    /// `(timestamp, histogram)` rows.
    Histograms(Vec<(i64, HistogramValue)>),
    /// `(timestamp, partial aggregate)` rows between aggregation levels.
    Aggregates(Vec<(i64, AggState)>),
}

impl RowData {
    /// Number of rows.
    pub fn len(&self) -> usize {
        match self {
            Self::Doubles(rows) => rows.len(),
            Self::Histograms(rows) => rows.len(),
            Self::Aggregates(rows) => rows.len(),
        }
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row timestamps in order.
    pub fn timestamps(&self) -> Vec<i64> {
        match self {
            Self::Doubles(rows) => rows.iter().map(|(t, _)| *t).collect(),
            Self::Histograms(rows) => rows.iter().map(|(t, _)| *t).collect(),
            Self::Aggregates(rows) => rows.iter().map(|(t, _)| *t).collect(),
        }
    }

    /// The double rows, when this is a double vector.
    pub fn as_doubles(&self) -> Option<&[(i64, f64)]> {
        match self {
            Self::Doubles(rows) => Some(rows),
            _ => None,
        }
    }
}

/// A labeled, time-ordered row set flowing between exec-plan nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeVector {
    /// Series identity.
    pub key: RangeVectorKey,
    /// The rows.
    pub rows: RowData,
}

impl RangeVector {
    /// A double-valued vector.
    pub fn doubles(key: RangeVectorKey, rows: Vec<(i64, f64)>) -> Self {
        Self {
            key,
            rows: RowData::Doubles(rows),
        }
    }

    /// A histogram-valued vector.
    pub fn histograms(key: RangeVectorKey, rows: Vec<(i64, HistogramValue)>) -> Self {
        Self {
            key,
            rows: RowData::Histograms(rows),
        }
    }

    /// Number of samples carried; drives the sample limit.
    pub fn num_samples(&self) -> usize {
        self.rows.len()
    }
}

/// The shape of a stream's rows; travels alongside the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultSchema {
    /// Output column names, timestamp first.
    pub columns: Vec<String>,
    /// Whether rows are keyed by time (false for metadata results).
    pub is_time_series: bool,
    /// Whether the value column carries histograms.
    pub is_histogram: bool,
}

impl ResultSchema {
    /// The usual `(timestamp, value)` double schema.
    pub fn time_series() -> Self {
        Self {
            columns: vec!["timestamp".into(), "value".into()],
            is_time_series: true,
            is_histogram: false,
        }
    }

    /// A `(timestamp, histogram)` schema.
    pub fn histogram_series() -> Self {
        Self {
            columns: vec!["timestamp".into(), "h".into()],
            is_time_series: true,
            is_histogram: false,
        }
        .histogram()
    }

    fn histogram(mut self) -> Self {
        self.is_histogram = true;
        self
    }

    /// A label/metadata result schema.
    pub fn metadata() -> Self {
        Self {
            columns: vec![],
            is_time_series: false,
            is_histogram: false,
        }
    }
}
