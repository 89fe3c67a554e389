//! Binary record containers: the wire form of an ingest batch.
//!
//! A container is a length-prefixed concatenation of fixed-schema records,
//! each carrying its series labels, an embedded timestamp and one value per
//! value column.

use crate::{BucketScheme, HistogramValue, PartitionKey};
use snafu::{ensure, OptionExt, Snafu};

/// Decode errors for [`RecordContainer`].
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum RecordError {
    #[snafu(display("record container truncated at offset {}", offset))]
    Truncated { offset: usize },

    #[snafu(display("unknown column value tag {}", tag))]
    UnknownValueTag { tag: u8 },
}

/// One decoded sample row.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRecord {
    /// Series labels, name/value pairs.
    pub labels: Vec<(String, String)>,
    /// Sample user time, epoch ms.
    pub timestamp: i64,
    /// One value per value column, in schema order.
    pub values: Vec<ColumnValue>,
}

impl IngestRecord {
    /// The partition key identifying this record's series.
    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::from_labels(self.labels.iter().map(|(n, v)| (n.as_str(), v.as_str())))
    }
}

/// A single column value inside a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    /// A double sample; NaN is a legal payload.
    Double(f64),
    /// A bucketed histogram sample.
    Histogram(HistogramValue),
}

/// Builder accumulating records into a container's wire form.
#[derive(Debug, Default)]
pub struct RecordContainerBuilder {
    buf: Vec<u8>,
    num_records: usize,
}

impl RecordContainerBuilder {
    /// A fresh, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record.
    pub fn push(&mut self, record: &IngestRecord) {
        let mut rec = Vec::with_capacity(64);
        rec.extend_from_slice(&(record.labels.len() as u16).to_le_bytes());
        for (name, value) in &record.labels {
            push_str(&mut rec, name);
            push_str(&mut rec, value);
        }
        rec.extend_from_slice(&record.timestamp.to_le_bytes());
        rec.extend_from_slice(&(record.values.len() as u16).to_le_bytes());
        for value in &record.values {
            match value {
                ColumnValue::Double(d) => {
                    rec.push(0);
                    rec.extend_from_slice(&d.to_bits().to_le_bytes());
                }
                ColumnValue::Histogram(h) => {
                    rec.push(1);
                    rec.extend_from_slice(&(h.scheme.num_buckets() as u16).to_le_bytes());
                    for b in h.scheme.bounds() {
                        rec.extend_from_slice(&b.to_bits().to_le_bytes());
                    }
                    for c in &h.counts {
                        rec.extend_from_slice(&c.to_le_bytes());
                    }
                }
            }
        }

        self.buf.extend_from_slice(&(rec.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&rec);
        self.num_records += 1;
    }

    /// Finish the container.
    pub fn build(self) -> RecordContainer {
        RecordContainer {
            buf: self.buf,
            num_records: self.num_records,
        }
    }
}

/// A sealed batch of records in wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordContainer {
    buf: Vec<u8>,
    num_records: usize,
}

impl RecordContainer {
    /// Reconstruct a container received off the wire. The record count is
    /// recomputed by walking the length prefixes.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, RecordError> {
        let mut num_records = 0;
        let mut off = 0;
        while off < buf.len() {
            ensure!(off + 4 <= buf.len(), TruncatedSnafu { offset: off });
            let len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
            off += 4;
            ensure!(off + len <= buf.len(), TruncatedSnafu { offset: off });
            off += len;
            num_records += 1;
        }
        Ok(Self { buf, num_records })
    }

    /// Serialized bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of records in the container.
    pub fn num_records(&self) -> usize {
        self.num_records
    }

    /// Decode all records.
    pub fn records(&self) -> Result<Vec<IngestRecord>, RecordError> {
        let mut out = Vec::with_capacity(self.num_records);
        let mut off = 0;
        while off < self.buf.len() {
            let len = u32::from_le_bytes(
                self.buf
                    .get(off..off + 4)
                    .context(TruncatedSnafu { offset: off })?
                    .try_into()
                    .unwrap(),
            ) as usize;
            off += 4;
            let rec = self
                .buf
                .get(off..off + len)
                .context(TruncatedSnafu { offset: off })?;
            out.push(decode_record(rec, off)?);
            off += len;
        }
        Ok(out)
    }
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RecordError> {
        let out = self.buf.get(self.pos..self.pos + n).context(TruncatedSnafu {
            offset: self.base + self.pos,
        })?;
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, RecordError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, RecordError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, RecordError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, RecordError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, RecordError> {
        let len = self.u16()? as usize;
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }
}

fn decode_record(rec: &[u8], base: usize) -> Result<IngestRecord, RecordError> {
    let mut c = Cursor { buf: rec, pos: 0, base };

    let num_labels = c.u16()? as usize;
    let mut labels = Vec::with_capacity(num_labels);
    for _ in 0..num_labels {
        let name = c.string()?;
        let value = c.string()?;
        labels.push((name, value));
    }

    let timestamp = c.i64()?;

    let num_values = c.u16()? as usize;
    let mut values = Vec::with_capacity(num_values);
    for _ in 0..num_values {
        match c.u8()? {
            0 => values.push(ColumnValue::Double(f64::from_bits(c.u64()?))),
            1 => {
                let num_buckets = c.u16()? as usize;
                let mut bounds = Vec::with_capacity(num_buckets);
                for _ in 0..num_buckets {
                    bounds.push(f64::from_bits(c.u64()?));
                }
                let mut counts = Vec::with_capacity(num_buckets);
                for _ in 0..num_buckets {
                    counts.push(c.u64()?);
                }
                values.push(ColumnValue::Histogram(HistogramValue::new(
                    BucketScheme::new(bounds),
                    counts,
                )));
            }
            tag => return UnknownValueTagSnafu { tag }.fail(),
        }
    }

    Ok(IngestRecord {
        labels,
        timestamp,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sample_record(ts: i64, v: f64) -> IngestRecord {
        IngestRecord {
            labels: vec![
                ("__name__".into(), "heap".into()),
                ("app".into(), "x".into()),
            ],
            timestamp: ts,
            values: vec![ColumnValue::Double(v)],
        }
    }

    #[test]
    fn test_round_trip_doubles() {
        let mut builder = RecordContainerBuilder::new();
        builder.push(&sample_record(1_000, 1.5));
        builder.push(&sample_record(2_000, f64::NAN));
        let container = builder.build();

        assert_eq!(container.num_records(), 2);
        let records = container.records().unwrap();
        assert_eq!(records[0], sample_record(1_000, 1.5));
        // NaN payloads survive bit-exactly
        assert_matches!(
            records[1].values[0],
            ColumnValue::Double(v) if v.is_nan()
        );
    }

    #[test]
    fn test_round_trip_histogram() {
        let hist = HistogramValue::new(
            BucketScheme::new(vec![10.0, 100.0, f64::INFINITY]),
            vec![1, 5, 9],
        );
        let record = IngestRecord {
            labels: vec![("__name__".into(), "lat".into())],
            timestamp: 42,
            values: vec![ColumnValue::Histogram(hist.clone())],
        };
        let mut builder = RecordContainerBuilder::new();
        builder.push(&record);
        let container = builder.build();

        let records = container.records().unwrap();
        assert_eq!(records[0].values[0], ColumnValue::Histogram(hist));
    }

    #[test]
    fn test_from_bytes_validates_framing() {
        let mut builder = RecordContainerBuilder::new();
        builder.push(&sample_record(1, 1.0));
        let bytes = builder.build().as_bytes().to_vec();

        let reparsed = RecordContainer::from_bytes(bytes.clone()).unwrap();
        assert_eq!(reparsed.num_records(), 1);

        let truncated = bytes[..bytes.len() - 3].to_vec();
        assert_matches!(
            RecordContainer::from_bytes(truncated),
            Err(RecordError::Truncated { .. })
        );
    }

    #[test]
    fn test_partition_key_from_record() {
        let record = sample_record(1, 1.0);
        let key = record.partition_key();
        assert_eq!(key.labels()["app"], "x");
    }
}
