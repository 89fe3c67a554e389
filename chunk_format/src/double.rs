//! XOR-compressed double columns with counter-dip tracking.
//!
//! Values are stored Gorilla-style: the first value raw, every later value
//! as the XOR against its predecessor with a two-bit control prefix. NaN is
//! an ordinary bit pattern and survives exactly.
//!
//! The appender additionally watches for counter dips: a value strictly
//! less than its predecessor sets the chunk's `dropped` flag and records
//! the row. The downsample pipeline uses those positions to emit period
//! boundaries around counter resets.

use crate::bits::{BitReader, BitWriter};
use crate::block::BlockRef;
use crate::{Result, TruncatedSnafu};
use once_cell::sync::OnceCell;
use snafu::ensure;

/// Append-only builder of a double column.
#[derive(Debug, Default, Clone)]
pub struct DoubleAppender {
    bits: BitWriter,
    num_rows: u32,
    prev_bits: u64,
    prev_value: f64,
    /// Leading/trailing-zero window of the previous non-zero XOR;
    /// `u32::MAX` marks "no window yet".
    prev_leading: u32,
    prev_trailing: u32,
    dropped: bool,
    drop_positions: Vec<u32>,
}

impl DoubleAppender {
    /// A fresh, empty appender.
    pub fn new() -> Self {
        Self {
            prev_leading: u32::MAX,
            ..Default::default()
        }
    }

    /// Append one value.
    pub fn append(&mut self, v: f64) {
        let row = self.num_rows;
        let value_bits = v.to_bits();

        if row == 0 {
            self.bits.write_bits(value_bits, 64);
        } else {
            let xor = self.prev_bits ^ value_bits;
            if xor == 0 {
                self.bits.write_bit(false);
            } else {
                self.bits.write_bit(true);
                let leading = xor.leading_zeros().min(31);
                let trailing = xor.trailing_zeros();

                if self.prev_leading != u32::MAX
                    && leading >= self.prev_leading
                    && trailing >= self.prev_trailing
                {
                    // previous window still covers the meaningful bits
                    self.bits.write_bit(false);
                    let sig = 64 - self.prev_leading - self.prev_trailing;
                    self.bits.write_bits(xor >> self.prev_trailing, sig);
                } else {
                    self.bits.write_bit(true);
                    let sig = 64 - leading - trailing;
                    self.bits.write_bits(u64::from(leading), 5);
                    self.bits.write_bits(u64::from(sig - 1), 6);
                    self.bits.write_bits(xor >> trailing, sig);
                    self.prev_leading = leading;
                    self.prev_trailing = trailing;
                }
            }

            // counter-dip detection; NaN on either side compares false
            if v < self.prev_value {
                self.dropped = true;
                self.drop_positions.push(row);
            }
        }

        self.prev_bits = value_bits;
        self.prev_value = v;
        self.num_rows += 1;
    }

    /// Rows appended so far.
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// Whether any appended value dipped below its predecessor.
    pub fn dropped(&self) -> bool {
        self.dropped
    }

    /// Serialize into the chunk wire form.
    pub fn encode(&self) -> Vec<u8> {
        let stream = self.bits.bytes();
        let mut buf = Vec::with_capacity(7 + self.drop_positions.len() * 4 + stream.len());
        buf.extend_from_slice(&self.num_rows.to_le_bytes());
        buf.push(u8::from(self.dropped));
        buf.extend_from_slice(&(self.drop_positions.len() as u16).to_le_bytes());
        for p in &self.drop_positions {
            buf.extend_from_slice(&p.to_le_bytes());
        }
        buf.extend_from_slice(stream);
        buf
    }

    /// Drop all content, keeping allocations for reuse.
    pub fn reset(&mut self) {
        self.bits.clear();
        self.num_rows = 0;
        self.prev_bits = 0;
        self.prev_value = 0.0;
        self.prev_leading = u32::MAX;
        self.prev_trailing = 0;
        self.dropped = false;
        self.drop_positions.clear();
    }
}

/// Read side of the double codec, over sealed chunk bytes.
///
/// The bitstream does not support random access directly; the first random
/// access decodes the whole chunk once and memoizes it.
#[derive(Debug)]
pub struct DoubleReader {
    bytes: BlockRef,
    num_rows: u32,
    dropped: bool,
    drop_positions: Vec<u32>,
    stream_offset: usize,
    decoded: OnceCell<Vec<f64>>,
}

impl DoubleReader {
    /// Parse a chunk produced by [`DoubleAppender::encode`].
    pub fn new(bytes: BlockRef) -> Result<Self> {
        let buf = bytes.as_slice();
        ensure!(buf.len() >= 7, TruncatedSnafu { offset: buf.len() });
        let num_rows = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let dropped = buf[4] != 0;
        let num_drops = u16::from_le_bytes(buf[5..7].try_into().unwrap()) as usize;
        let drops_end = 7 + num_drops * 4;
        ensure!(buf.len() >= drops_end, TruncatedSnafu { offset: buf.len() });
        let drop_positions = (0..num_drops)
            .map(|i| u32::from_le_bytes(buf[7 + i * 4..11 + i * 4].try_into().unwrap()))
            .collect();

        Ok(Self {
            bytes,
            num_rows,
            dropped,
            drop_positions,
            stream_offset: drops_end,
            decoded: OnceCell::new(),
        })
    }

    /// Number of rows in the chunk.
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// Whether the chunk saw a counter dip.
    pub fn dropped(&self) -> bool {
        self.dropped
    }

    /// Sorted row indices at which a dip begins.
    pub fn drop_positions(&self) -> &[u32] {
        &self.drop_positions
    }

    fn values(&self) -> &[f64] {
        self.decoded
            .get_or_init(|| decode_stream(&self.bytes.as_slice()[self.stream_offset..], self.num_rows)
                .expect("sealed chunk bitstream intact"))
    }

    /// Decode the whole chunk, surfacing codec errors. Later accessors may
    /// use the memoized panic-on-corruption path once this returned `Ok`.
    pub fn validate(&self) -> Result<()> {
        if self.decoded.get().is_none() {
            let values =
                decode_stream(&self.bytes.as_slice()[self.stream_offset..], self.num_rows)?;
            let _ = self.decoded.set(values);
        }
        Ok(())
    }

    /// Value at `row`.
    pub fn apply(&self, row: u32) -> f64 {
        self.values()[row as usize]
    }

    /// Iterate values from `start_row`.
    pub fn iterate(&self, start_row: u32) -> impl Iterator<Item = f64> + '_ {
        self.values()[start_row as usize..].iter().copied()
    }

    /// Sum of the non-NaN values in rows `[start, end]` (inclusive).
    pub fn sum(&self, start: u32, end: u32) -> f64 {
        self.values()[start as usize..=end as usize]
            .iter()
            .filter(|v| !v.is_nan())
            .sum()
    }

    /// Count of non-NaN values in rows `[start, end]` (inclusive).
    pub fn count(&self, start: u32, end: u32) -> u32 {
        self.values()[start as usize..=end as usize]
            .iter()
            .filter(|v| !v.is_nan())
            .count() as u32
    }
}

fn decode_stream(stream: &[u8], num_rows: u32) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(num_rows as usize);
    if num_rows == 0 {
        return Ok(out);
    }

    let mut bits = BitReader::new(stream);
    let mut prev = bits.read_bits(64)?;
    out.push(f64::from_bits(prev));

    let mut leading = 0u32;
    let mut trailing = 0u32;
    for _ in 1..num_rows {
        if !bits.read_bit()? {
            out.push(f64::from_bits(prev));
            continue;
        }
        if bits.read_bit()? {
            leading = bits.read_bits(5)? as u32;
            let sig = bits.read_bits(6)? as u32 + 1;
            trailing = 64 - leading - sig;
        }
        let sig = 64 - leading - trailing;
        let xor = bits.read_bits(sig)? << trailing;
        prev ^= xor;
        out.push(f64::from_bits(prev));
    }
    Ok(out)
}
