//! Histogram columns: a bucket-scheme header plus one delta-varint column
//! per bucket.
//!
//! A chunk holds rows of a single bucket scheme. When a series changes its
//! scheme the partition seals the current buffer and starts a new chunk, so
//! the scheme may differ across chunks of one partition but never within
//! one.

use crate::block::BlockRef;
use crate::varint::{read_ivarint, read_uvarint, write_ivarint, write_uvarint};
use crate::{Result, SchemeMismatchSnafu, TruncatedSnafu};
use data_types::{BucketScheme, HistogramValue};
use once_cell::sync::OnceCell;
use snafu::ensure;

/// Append-only builder of a histogram column.
#[derive(Debug, Default, Clone)]
pub struct HistogramAppender {
    scheme: Option<BucketScheme>,
    /// Column-major cumulative counts: one vector per bucket.
    columns: Vec<Vec<u64>>,
    num_rows: u32,
}

impl HistogramAppender {
    /// A fresh, empty appender.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one histogram sample. Fails when the sample's bucket scheme
    /// differs from the chunk's; the caller then seals this chunk and
    /// retries on a fresh one.
    pub fn append(&mut self, h: &HistogramValue) -> Result<()> {
        match &self.scheme {
            None => {
                self.scheme = Some(h.scheme.clone());
                self.columns = vec![Vec::new(); h.scheme.num_buckets()];
            }
            Some(scheme) => {
                ensure!(
                    *scheme == h.scheme,
                    SchemeMismatchSnafu {
                        have: scheme.num_buckets(),
                        got: h.scheme.num_buckets(),
                    }
                );
            }
        }
        for (col, count) in self.columns.iter_mut().zip(&h.counts) {
            col.push(*count);
        }
        self.num_rows += 1;
        Ok(())
    }

    /// Rows appended so far.
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// The scheme of the chunk being built, once a row has arrived.
    pub fn scheme(&self) -> Option<&BucketScheme> {
        self.scheme.as_ref()
    }

    /// Serialize into the chunk wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.num_rows.to_le_bytes());
        let bounds = self.scheme.as_ref().map(|s| s.bounds()).unwrap_or(&[]);
        buf.extend_from_slice(&(bounds.len() as u16).to_le_bytes());
        for b in bounds {
            buf.extend_from_slice(&b.to_bits().to_le_bytes());
        }
        for col in &self.columns {
            let mut prev = 0i64;
            for (i, count) in col.iter().enumerate() {
                if i == 0 {
                    write_uvarint(&mut buf, *count);
                } else {
                    write_ivarint(&mut buf, *count as i64 - prev);
                }
                prev = *count as i64;
            }
        }
        buf
    }

    /// Drop all content, keeping allocations for reuse.
    pub fn reset(&mut self) {
        self.scheme = None;
        self.columns.clear();
        self.num_rows = 0;
    }
}

/// Read side of the histogram codec, over sealed chunk bytes.
#[derive(Debug)]
pub struct HistogramReader {
    bytes: BlockRef,
    num_rows: u32,
    scheme: BucketScheme,
    columns_offset: usize,
    decoded: OnceCell<Vec<HistogramValue>>,
}

impl HistogramReader {
    /// Parse a chunk produced by [`HistogramAppender::encode`].
    pub fn new(bytes: BlockRef) -> Result<Self> {
        let buf = bytes.as_slice();
        ensure!(buf.len() >= 6, TruncatedSnafu { offset: buf.len() });
        let num_rows = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let num_buckets = u16::from_le_bytes(buf[4..6].try_into().unwrap()) as usize;
        let header_end = 6 + num_buckets * 8;
        ensure!(buf.len() >= header_end, TruncatedSnafu { offset: buf.len() });
        let bounds: Vec<f64> = (0..num_buckets)
            .map(|i| {
                f64::from_bits(u64::from_le_bytes(
                    buf[6 + i * 8..14 + i * 8].try_into().unwrap(),
                ))
            })
            .collect();

        Ok(Self {
            bytes,
            num_rows,
            scheme: BucketScheme::new(bounds),
            columns_offset: header_end,
            decoded: OnceCell::new(),
        })
    }

    /// Number of rows in the chunk.
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// The chunk's bucket scheme.
    pub fn scheme(&self) -> &BucketScheme {
        &self.scheme
    }

    fn rows(&self) -> &[HistogramValue] {
        self.decoded
            .get_or_init(|| self.decode().expect("sealed chunk columns intact"))
    }

    /// Decode the whole chunk, surfacing codec errors.
    pub fn validate(&self) -> Result<()> {
        if self.decoded.get().is_none() {
            let rows = self.decode()?;
            let _ = self.decoded.set(rows);
        }
        Ok(())
    }

    fn decode(&self) -> Result<Vec<HistogramValue>> {
        let buf = self.bytes.as_slice();
        let num_buckets = self.scheme.num_buckets();
        let rows = self.num_rows as usize;

        let mut columns = vec![Vec::with_capacity(rows); num_buckets];
        let mut pos = self.columns_offset;
        for col in &mut columns {
            let mut prev = 0i64;
            for i in 0..rows {
                let v = if i == 0 {
                    let (v, p) = read_uvarint(buf, pos)?;
                    pos = p;
                    v as i64
                } else {
                    let (d, p) = read_ivarint(buf, pos)?;
                    pos = p;
                    prev + d
                };
                col.push(v as u64);
                prev = v;
            }
        }

        Ok((0..rows)
            .map(|r| {
                HistogramValue::new(
                    self.scheme.clone(),
                    columns.iter().map(|c| c[r]).collect(),
                )
            })
            .collect())
    }

    /// Histogram at `row`.
    pub fn apply(&self, row: u32) -> &HistogramValue {
        &self.rows()[row as usize]
    }

    /// Iterate histograms from `start_row`.
    pub fn iterate(&self, start_row: u32) -> impl Iterator<Item = &HistogramValue> + '_ {
        self.rows()[start_row as usize..].iter()
    }
}
