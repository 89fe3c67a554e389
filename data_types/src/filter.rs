//! Label filters applied against the inverted index.

/// Matching mode of a [`ColumnFilter`]. Regex variants carry the raw
/// pattern; compilation happens at the index, where failures surface as
/// query errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOp {
    /// Exact match.
    Equals(String),
    /// Exact non-match.
    NotEquals(String),
    /// Anchored regex match.
    EqualsRegex(String),
    /// Anchored regex non-match.
    NotEqualsRegex(String),
    /// Match any of the listed values.
    In(Vec<String>),
}

/// A filter on one label column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    /// Label name.
    pub column: String,
    /// Matching mode and operand.
    pub op: FilterOp,
}

impl ColumnFilter {
    /// Equality filter, the common case.
    pub fn equals(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Equals(value.into()),
        }
    }

    /// Build a filter with an explicit op.
    pub fn new(column: impl Into<String>, op: FilterOp) -> Self {
        Self {
            column: column.into(),
            op,
        }
    }
}

impl std::fmt::Display for ColumnFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.op {
            FilterOp::Equals(v) => write!(f, "{}={:?}", self.column, v),
            FilterOp::NotEquals(v) => write!(f, "{}!={:?}", self.column, v),
            FilterOp::EqualsRegex(v) => write!(f, "{}=~{:?}", self.column, v),
            FilterOp::NotEqualsRegex(v) => write!(f, "{}!~{:?}", self.column, v),
            FilterOp::In(vs) => write!(f, "{} in {:?}", self.column, vs),
        }
    }
}
