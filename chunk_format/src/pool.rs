//! Write buffers and the per-shard pool that recycles them.
//!
//! A [`WriteBufferSet`] is the mutable residency of one partition's current
//! chunk: one timestamp appender plus one value appender per value column.
//! Sets are acquired from a fixed-capacity [`BufferPool`]; an empty pool is
//! the ingest backpressure signal.

use crate::block::BlockRef;
use crate::{
    DoubleAppender, DoubleReader, HistogramAppender, HistogramReader, Result, TimestampAppender,
    TimestampReader,
};
use data_types::{ColumnValue, HistogramValue};
use parking_lot::Mutex;

/// The codec used for one value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// XOR-compressed doubles.
    Double,
    /// Bucketed histograms.
    Histogram,
}

/// One value column's appender.
#[derive(Debug, Clone)]
pub enum ValueAppender {
    /// Double column.
    Double(DoubleAppender),
    /// Histogram column.
    Histogram(HistogramAppender),
}

impl ValueAppender {
    fn new(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Double => Self::Double(DoubleAppender::new()),
            ValueKind::Histogram => Self::Histogram(HistogramAppender::new()),
        }
    }

    /// Append one value. A double column treats a histogram payload (and
    /// vice versa) as programmer error upstream; the shard validates value
    /// shapes against the schema before rows get here.
    pub fn append(&mut self, value: &ColumnValue) -> Result<()> {
        match (self, value) {
            (Self::Double(a), ColumnValue::Double(v)) => {
                a.append(*v);
                Ok(())
            }
            (Self::Histogram(a), ColumnValue::Histogram(h)) => a.append(h),
            (Self::Double(a), ColumnValue::Histogram(h)) => {
                // tolerate histogram-in-double by storing the total count
                a.append(h.total() as f64);
                Ok(())
            }
            (Self::Histogram(a), ColumnValue::Double(v)) => {
                a.append(&HistogramValue::new(
                    data_types::BucketScheme::new(vec![f64::INFINITY]),
                    vec![*v as u64],
                ))
            }
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            Self::Double(a) => a.encode(),
            Self::Histogram(a) => a.encode(),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Double(a) => a.reset(),
            Self::Histogram(a) => a.reset(),
        }
    }
}

/// A decoded-on-demand reader over one value column's bytes.
#[derive(Debug)]
pub enum ValueReader {
    /// Double column.
    Double(DoubleReader),
    /// Histogram column.
    Histogram(HistogramReader),
}

impl ValueReader {
    /// Parse a value column of the given kind.
    pub fn new(kind: ValueKind, bytes: BlockRef) -> Result<Self> {
        Ok(match kind {
            ValueKind::Double => Self::Double(DoubleReader::new(bytes)?),
            ValueKind::Histogram => Self::Histogram(HistogramReader::new(bytes)?),
        })
    }

    /// Eagerly decode, surfacing codec errors.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Double(r) => r.validate(),
            Self::Histogram(r) => r.validate(),
        }
    }
}

/// The mutable write buffers of one partition.
#[derive(Debug, Clone)]
pub struct WriteBufferSet {
    timestamps: TimestampAppender,
    values: Vec<ValueAppender>,
}

impl WriteBufferSet {
    /// Build a set for the given value column kinds.
    pub fn new(kinds: &[ValueKind]) -> Self {
        Self {
            timestamps: TimestampAppender::new(),
            values: kinds.iter().map(|k| ValueAppender::new(*k)).collect(),
        }
    }

    /// Append one row. The timestamp is appended only after every value
    /// appender accepted its payload, so a scheme-change rejection leaves
    /// the set consistent.
    pub fn append_row(&mut self, ts: i64, values: &[ColumnValue]) -> Result<()> {
        debug_assert_eq!(values.len(), self.values.len());
        // probe histogram columns first; their append can refuse
        for (appender, value) in self.values.iter_mut().zip(values) {
            if let (ValueAppender::Histogram(a), ColumnValue::Histogram(h)) = (&mut *appender, value)
            {
                if let Some(scheme) = a.scheme() {
                    if *scheme != h.scheme {
                        return crate::SchemeMismatchSnafu {
                            have: scheme.num_buckets(),
                            got: h.scheme.num_buckets(),
                        }
                        .fail();
                    }
                }
            }
        }
        for (appender, value) in self.values.iter_mut().zip(values) {
            appender.append(value)?;
        }
        self.timestamps.append(ts);
        Ok(())
    }

    /// Rows in the buffer.
    pub fn num_rows(&self) -> u32 {
        self.timestamps.num_rows()
    }

    /// Whether no rows have been appended.
    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Timestamp of the first row; 0 when empty.
    pub fn first_ts(&self) -> i64 {
        self.timestamps.first_ts()
    }

    /// Timestamp of the last row; 0 when empty.
    pub fn last_ts(&self) -> i64 {
        self.timestamps.last_ts()
    }

    /// The timestamp appender, for in-buffer reads.
    pub fn timestamps(&self) -> &TimestampAppender {
        &self.timestamps
    }

    /// Encode all columns: timestamps first, then values in column order.
    pub fn encode_columns(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + self.values.len());
        out.push(self.timestamps.encode());
        out.extend(self.values.iter().map(|v| v.encode()));
        out
    }

    /// Snapshot the buffer into immutable readers (a copy). Live queries
    /// read unsealed data through this.
    pub fn snapshot_readers(&self) -> Result<(TimestampReader, Vec<ValueReader>)> {
        let ts = TimestampReader::new(BlockRef::unmanaged(self.timestamps.encode()))?;
        let values = self
            .values
            .iter()
            .map(|v| {
                let kind = match v {
                    ValueAppender::Double(_) => ValueKind::Double,
                    ValueAppender::Histogram(_) => ValueKind::Histogram,
                };
                ValueReader::new(kind, BlockRef::unmanaged(v.encode()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((ts, values))
    }

    /// Clear content, keeping allocations.
    pub fn reset(&mut self) {
        self.timestamps.reset();
        for v in &mut self.values {
            v.reset();
        }
    }
}

/// Fixed-capacity pool of [`WriteBufferSet`]s for one shard.
#[derive(Debug)]
pub struct BufferPool {
    kinds: Vec<ValueKind>,
    capacity: usize,
    free: Mutex<Vec<WriteBufferSet>>,
}

impl BufferPool {
    /// Pre-build `capacity` buffer sets for the given value columns.
    pub fn new(capacity: usize, kinds: Vec<ValueKind>) -> Self {
        let free = (0..capacity).map(|_| WriteBufferSet::new(&kinds)).collect();
        Self {
            kinds,
            capacity,
            free: Mutex::new(free),
        }
    }

    /// Take a buffer set, or `None` when the pool is exhausted. An empty
    /// pool blocks ingest and signals flush pressure to the shard.
    pub fn acquire(&self) -> Option<WriteBufferSet> {
        self.free.lock().pop()
    }

    /// Return a buffer set to the pool.
    pub fn release(&self, mut set: WriteBufferSet) {
        set.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(set);
        }
    }

    /// Buffer sets currently available.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// The value column kinds this pool builds buffers for.
    pub fn kinds(&self) -> &[ValueKind] {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::BucketScheme;

    #[test]
    fn test_pool_exhaustion_and_release() {
        let pool = BufferPool::new(2, vec![ValueKind::Double]);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.available(), 0);

        pool.release(a);
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_released_buffers_are_reset() {
        let pool = BufferPool::new(1, vec![ValueKind::Double]);
        let mut set = pool.acquire().unwrap();
        set.append_row(1_000, &[ColumnValue::Double(1.0)]).unwrap();
        assert_eq!(set.num_rows(), 1);
        pool.release(set);

        let set = pool.acquire().unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_append_row_and_snapshot() {
        let mut set = WriteBufferSet::new(&[ValueKind::Double]);
        for i in 0..10 {
            set.append_row(i * 10, &[ColumnValue::Double(i as f64)])
                .unwrap();
        }
        assert_eq!(set.num_rows(), 10);
        assert_eq!(set.first_ts(), 0);
        assert_eq!(set.last_ts(), 90);

        let (ts, values) = set.snapshot_readers().unwrap();
        assert_eq!(ts.num_rows(), 10);
        match &values[0] {
            ValueReader::Double(r) => assert_eq!(r.apply(3), 3.0),
            _ => panic!("expected double reader"),
        }
    }

    #[test]
    fn test_scheme_change_leaves_row_count_consistent() {
        let mut set = WriteBufferSet::new(&[ValueKind::Histogram]);
        let a = HistogramValue::new(BucketScheme::new(vec![1.0, f64::INFINITY]), vec![1, 2]);
        let b = HistogramValue::new(
            BucketScheme::new(vec![1.0, 5.0, f64::INFINITY]),
            vec![1, 2, 3],
        );
        set.append_row(10, &[ColumnValue::Histogram(a)]).unwrap();
        assert!(set
            .append_row(20, &[ColumnValue::Histogram(b)])
            .is_err());
        // the rejected row left nothing behind
        assert_eq!(set.num_rows(), 1);
        assert_eq!(set.last_ts(), 10);
    }
}
