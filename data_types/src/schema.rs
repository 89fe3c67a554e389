//! Dataset schemas: ordered column definitions with semantic types.

use snafu::{ensure, Snafu};
use std::sync::Arc;

/// Schema validation errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum SchemaError {
    #[snafu(display("duplicate column name '{}'", name))]
    DuplicateColumn { name: String },

    #[snafu(display("schema must declare exactly one timestamp column, found {}", count))]
    TimestampCount { count: usize },

    #[snafu(display("timestamp column '{}' may not be part of the partition key", name))]
    TimestampInPartitionKey { name: String },

    #[snafu(display("partition key column '{}' must be utf8 or int-map, not {:?}", name, column_type))]
    BadPartitionKeyColumn {
        name: String,
        column_type: ColumnType,
    },

    #[snafu(display("column '{}' of type {:?} cannot be marked as a counter", name, column_type))]
    BadCounterColumn {
        name: String,
        column_type: ColumnType,
    },

    #[snafu(display("partition key length {} exceeds column count {}", len, count))]
    PartitionKeyTooLong { len: usize, count: usize },
}

/// Semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Epoch-millisecond timestamps; the row key.
    TimestampLong,
    /// 64-bit floating point samples.
    Double,
    /// Bucketed histogram samples.
    Histogram,
    /// UTF-8 strings; valid as partition-key columns.
    Utf8,
    /// Small integer-keyed maps; valid as partition-key columns.
    IntMap,
}

/// Definition of one column in a dataset schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name, unique within a schema.
    pub name: String,
    /// Semantic type.
    pub column_type: ColumnType,
    /// Whether the column carries a monotonic counter. Only meaningful for
    /// double columns; drives counter-aware downsample period marking.
    pub counter: bool,
}

impl ColumnDef {
    /// A non-counter column.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            counter: false,
        }
    }

    /// A counter double column.
    pub fn counter(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Double,
            counter: true,
        }
    }
}

/// An ordered list of columns: partition-key columns first, then the
/// timestamp column and the value columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSchema {
    columns: Vec<ColumnDef>,
    partition_key_len: usize,
    timestamp_idx: usize,
}

impl DatasetSchema {
    /// Validate and build a schema. The first `partition_key_len` columns
    /// form the partition key; exactly one of the remaining columns must be
    /// the timestamp.
    pub fn new(columns: Vec<ColumnDef>, partition_key_len: usize) -> Result<Self, SchemaError> {
        ensure!(
            partition_key_len <= columns.len(),
            PartitionKeyTooLongSnafu {
                len: partition_key_len,
                count: columns.len(),
            }
        );

        for (i, c) in columns.iter().enumerate() {
            ensure!(
                !columns[..i].iter().any(|o| o.name == c.name),
                DuplicateColumnSnafu { name: &c.name }
            );
            ensure!(
                !c.counter || c.column_type == ColumnType::Double,
                BadCounterColumnSnafu {
                    name: &c.name,
                    column_type: c.column_type,
                }
            );
        }

        for c in &columns[..partition_key_len] {
            ensure!(
                c.column_type != ColumnType::TimestampLong,
                TimestampInPartitionKeySnafu { name: &c.name }
            );
            ensure!(
                matches!(c.column_type, ColumnType::Utf8 | ColumnType::IntMap),
                BadPartitionKeyColumnSnafu {
                    name: &c.name,
                    column_type: c.column_type,
                }
            );
        }

        let ts: Vec<_> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.column_type == ColumnType::TimestampLong)
            .map(|(i, _)| i)
            .collect();
        ensure!(ts.len() == 1, TimestampCountSnafu { count: ts.len() });

        Ok(Self {
            columns,
            partition_key_len,
            timestamp_idx: ts[0],
        })
    }

    /// All columns in declaration order.
    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// The partition-key prefix.
    pub fn partition_key_columns(&self) -> &[ColumnDef] {
        &self.columns[..self.partition_key_len]
    }

    /// Value columns: everything past the partition key except the
    /// timestamp, in declaration order.
    pub fn value_columns(&self) -> impl Iterator<Item = (usize, &ColumnDef)> + '_ {
        self.columns
            .iter()
            .enumerate()
            .skip(self.partition_key_len)
            .filter(move |(i, _)| *i != self.timestamp_idx)
    }

    /// Index of the timestamp column.
    pub fn timestamp_idx(&self) -> usize {
        self.timestamp_idx
    }

    /// Look up a column index by name.
    pub fn column_idx(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

/// A named, immutable dataset: schema plus identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Dataset name; identifies tables in the remote store.
    pub name: String,
    /// Column layout.
    pub schema: DatasetSchema,
}

impl Dataset {
    /// Build a dataset.
    pub fn new(name: impl Into<String>, schema: DatasetSchema) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// The bucket layout of a histogram column: upper bounds (`le` values) in
/// increasing order, the last conventionally `f64::INFINITY`.
///
/// Schemes are compared by the bit patterns of their bounds so that they can
/// key maps and detect mid-partition layout changes.
#[derive(Debug, Clone)]
pub struct BucketScheme {
    bounds: Arc<[f64]>,
}

impl BucketScheme {
    /// Build a scheme from upper bounds.
    pub fn new(bounds: impl Into<Arc<[f64]>>) -> Self {
        Self {
            bounds: bounds.into(),
        }
    }

    /// Bucket upper bounds.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Number of buckets.
    pub fn num_buckets(&self) -> usize {
        self.bounds.len()
    }
}

impl PartialEq for BucketScheme {
    fn eq(&self, other: &Self) -> bool {
        self.bounds.len() == other.bounds.len()
            && self
                .bounds
                .iter()
                .zip(other.bounds.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for BucketScheme {}

/// One histogram sample: cumulative counts per bucket of a [`BucketScheme`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistogramValue {
    /// Bucket layout.
    pub scheme: BucketScheme,
    /// Cumulative counts, one per bucket.
    pub counts: Vec<u64>,
}

impl HistogramValue {
    /// Build a histogram sample; `counts` must match the scheme's width.
    pub fn new(scheme: BucketScheme, counts: Vec<u64>) -> Self {
        assert_eq!(
            scheme.num_buckets(),
            counts.len(),
            "histogram counts must match bucket scheme"
        );
        Self { scheme, counts }
    }

    /// The total count: the value of the `+Inf` bucket.
    pub fn total(&self) -> u64 {
        self.counts.last().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn prom_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("metric", ColumnType::Utf8),
            ColumnDef::new("tags", ColumnType::IntMap),
            ColumnDef::new("timestamp", ColumnType::TimestampLong),
            ColumnDef::new("value", ColumnType::Double),
        ]
    }

    #[test]
    fn test_valid_schema() {
        let schema = DatasetSchema::new(prom_columns(), 2).unwrap();
        assert_eq!(schema.timestamp_idx(), 2);
        assert_eq!(schema.partition_key_columns().len(), 2);
        let values: Vec<_> = schema.value_columns().map(|(i, _)| i).collect();
        assert_eq!(values, vec![3]);
        assert_eq!(schema.column_idx("value"), Some(3));
        assert_eq!(schema.column_idx("nope"), None);
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut cols = prom_columns();
        cols.push(ColumnDef::new("value", ColumnType::Double));
        assert_matches!(
            DatasetSchema::new(cols, 2),
            Err(SchemaError::DuplicateColumn { .. })
        );
    }

    #[test]
    fn test_rejects_zero_or_two_timestamps() {
        let cols = vec![
            ColumnDef::new("metric", ColumnType::Utf8),
            ColumnDef::new("value", ColumnType::Double),
        ];
        assert_matches!(
            DatasetSchema::new(cols, 1),
            Err(SchemaError::TimestampCount { count: 0 })
        );

        let mut cols = prom_columns();
        cols.push(ColumnDef::new("ts2", ColumnType::TimestampLong));
        assert_matches!(
            DatasetSchema::new(cols, 2),
            Err(SchemaError::TimestampCount { count: 2 })
        );
    }

    #[test]
    fn test_rejects_counter_on_non_double() {
        let cols = vec![
            ColumnDef::new("metric", ColumnType::Utf8),
            ColumnDef::new("timestamp", ColumnType::TimestampLong),
            ColumnDef {
                name: "h".into(),
                column_type: ColumnType::Histogram,
                counter: true,
            },
        ];
        assert_matches!(
            DatasetSchema::new(cols, 1),
            Err(SchemaError::BadCounterColumn { .. })
        );
    }

    #[test]
    fn test_rejects_timestamp_partition_key() {
        let cols = vec![
            ColumnDef::new("timestamp", ColumnType::TimestampLong),
            ColumnDef::new("value", ColumnType::Double),
        ];
        assert_matches!(
            DatasetSchema::new(cols, 1),
            Err(SchemaError::TimestampInPartitionKey { .. })
        );
    }

    #[test]
    fn test_bucket_scheme_eq_by_bits() {
        let a = BucketScheme::new(vec![10.0, 100.0, f64::INFINITY]);
        let b = BucketScheme::new(vec![10.0, 100.0, f64::INFINITY]);
        let c = BucketScheme::new(vec![10.0, 50.0, f64::INFINITY]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
