//! Delta-of-delta timestamp encoding with run-length segments.
//!
//! Monotonic sample timestamps overwhelmingly arrive at a fixed cadence, so
//! the deltas between consecutive rows repeat. The appender folds repeats
//! into `(delta, count)` segments; the encoded form is a small header plus
//! one varint pair per segment. The reader rebuilds the segment table once
//! and answers `ceiling_index` by binary search over it.

use crate::block::BlockRef;
use crate::varint::{read_ivarint, read_uvarint, write_ivarint, write_uvarint};
use crate::{Result, TruncatedSnafu};
use snafu::ensure;

/// Append-only builder of a timestamp column.
#[derive(Debug, Default, Clone)]
pub struct TimestampAppender {
    first_ts: i64,
    last_ts: i64,
    /// Run-length segments of row deltas after the first row.
    segments: Vec<(i64, u32)>,
    num_rows: u32,
}

impl TimestampAppender {
    /// A fresh, empty appender.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one timestamp. Callers enforce monotonicity; the codec itself
    /// accepts any sequence.
    pub fn append(&mut self, ts: i64) {
        if self.num_rows == 0 {
            self.first_ts = ts;
        } else {
            let delta = ts - self.last_ts;
            match self.segments.last_mut() {
                Some((d, count)) if *d == delta => *count += 1,
                _ => self.segments.push((delta, 1)),
            }
        }
        self.last_ts = ts;
        self.num_rows += 1;
    }

    /// Rows appended so far.
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// First appended timestamp; 0 when empty.
    pub fn first_ts(&self) -> i64 {
        self.first_ts
    }

    /// Last appended timestamp; 0 when empty.
    pub fn last_ts(&self) -> i64 {
        self.last_ts
    }

    /// Timestamp at `row`, scanning the segment runs.
    pub fn apply(&self, row: u32) -> i64 {
        debug_assert!(row < self.num_rows);
        let mut ts = self.first_ts;
        let mut remaining = row;
        for (delta, count) in &self.segments {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(*count);
            ts += delta * i64::from(take);
            remaining -= take;
        }
        ts
    }

    /// Greatest row with timestamp `<= ts`, or `None` when even the first
    /// row is later. Only meaningful for monotonic content.
    pub fn ceiling_index(&self, ts: i64) -> Option<u32> {
        if self.num_rows == 0 || ts < self.first_ts {
            return None;
        }
        let mut row = 0u32;
        let mut cur = self.first_ts;
        for (delta, count) in &self.segments {
            let seg_end = cur + delta * i64::from(*count);
            if seg_end <= ts {
                cur = seg_end;
                row += count;
                continue;
            }
            if *delta <= 0 {
                // non-advancing run past ts: everything later is later still
                return Some(row);
            }
            let steps = ((ts - cur) / delta) as u32;
            return Some(row + steps.min(*count));
        }
        Some(row)
    }

    /// Serialize into the chunk wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.segments.len() * 3);
        buf.extend_from_slice(&self.num_rows.to_le_bytes());
        buf.extend_from_slice(&self.first_ts.to_le_bytes());
        for (delta, count) in &self.segments {
            write_ivarint(&mut buf, *delta);
            write_uvarint(&mut buf, u64::from(*count));
        }
        buf
    }

    /// Drop all content, keeping allocations for reuse.
    pub fn reset(&mut self) {
        self.first_ts = 0;
        self.last_ts = 0;
        self.segments.clear();
        self.num_rows = 0;
    }

    /// Iterate timestamps from `start_row`.
    pub fn iterate(&self, start_row: u32) -> impl Iterator<Item = i64> + '_ {
        SegmentIter::new(self.first_ts, &self.segments, self.num_rows, start_row)
    }
}

/// One decoded run of equal deltas.
#[derive(Debug, Clone, Copy)]
struct Segment {
    /// First row covered by the run (the run's rows are
    /// `start_row .. start_row + count`).
    start_row: u32,
    /// Timestamp at `start_row - 1` plus one delta; i.e. of the run's first
    /// row.
    start_ts: i64,
    delta: i64,
    count: u32,
}

/// Read side of the timestamp codec, over sealed chunk bytes.
#[derive(Debug, Clone)]
pub struct TimestampReader {
    num_rows: u32,
    first_ts: i64,
    segments: Vec<Segment>,
}

impl TimestampReader {
    /// Parse a chunk produced by [`TimestampAppender::encode`].
    pub fn new(bytes: BlockRef) -> Result<Self> {
        let buf = bytes.as_slice();
        ensure!(buf.len() >= 12, TruncatedSnafu { offset: buf.len() });
        let num_rows = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let first_ts = i64::from_le_bytes(buf[4..12].try_into().unwrap());

        let mut segments = Vec::new();
        let mut pos = 12;
        let mut row = 1u32;
        let mut ts = first_ts;
        while row < num_rows {
            let (delta, p) = read_ivarint(buf, pos)?;
            let (count, p) = read_uvarint(buf, p)?;
            pos = p;
            let count = count as u32;
            segments.push(Segment {
                start_row: row,
                start_ts: ts + delta,
                delta,
                count,
            });
            ts += delta * i64::from(count);
            row += count;
        }

        Ok(Self {
            num_rows,
            first_ts,
            segments,
        })
    }

    /// Number of rows in the chunk.
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// Timestamp at `row`; O(log n) via the segment table.
    pub fn apply(&self, row: u32) -> i64 {
        debug_assert!(row < self.num_rows);
        if row == 0 {
            return self.first_ts;
        }
        let seg = match self
            .segments
            .partition_point(|s| s.start_row <= row)
            .checked_sub(1)
        {
            Some(i) => self.segments[i],
            None => return self.first_ts,
        };
        seg.start_ts + seg.delta * i64::from(row - seg.start_row)
    }

    /// Greatest row with timestamp `<= ts`, or `None` when even the first
    /// row is later.
    pub fn ceiling_index(&self, ts: i64) -> Option<u32> {
        if self.num_rows == 0 || ts < self.first_ts {
            return None;
        }
        // find the last segment starting at or before ts
        let idx = self.segments.partition_point(|s| s.start_ts <= ts);
        let Some(i) = idx.checked_sub(1) else {
            return Some(0);
        };
        let seg = self.segments[i];
        if seg.delta <= 0 {
            return Some(seg.start_row + seg.count - 1);
        }
        let steps = ((ts - seg.start_ts) / seg.delta) as u32;
        Some(seg.start_row + steps.min(seg.count - 1))
    }

    /// Iterate timestamps from `start_row`.
    pub fn iterate(&self, start_row: u32) -> impl Iterator<Item = i64> + '_ {
        ReaderIter {
            reader: self,
            row: start_row,
        }
    }
}

struct ReaderIter<'a> {
    reader: &'a TimestampReader,
    row: u32,
}

impl Iterator for ReaderIter<'_> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.row >= self.reader.num_rows {
            return None;
        }
        let ts = self.reader.apply(self.row);
        self.row += 1;
        Some(ts)
    }
}

struct SegmentIter<'a> {
    first_ts: i64,
    segments: &'a [(i64, u32)],
    num_rows: u32,
    row: u32,
    cur_ts: i64,
    seg_idx: usize,
    seg_used: u32,
    primed: bool,
}

impl<'a> SegmentIter<'a> {
    fn new(first_ts: i64, segments: &'a [(i64, u32)], num_rows: u32, start_row: u32) -> Self {
        let mut it = Self {
            first_ts,
            segments,
            num_rows,
            row: 0,
            cur_ts: first_ts,
            seg_idx: 0,
            seg_used: 0,
            primed: false,
        };
        for _ in 0..start_row {
            let _ = it.next();
        }
        it
    }
}

impl Iterator for SegmentIter<'_> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        if self.row >= self.num_rows {
            return None;
        }
        if !self.primed {
            self.primed = true;
            self.row += 1;
            self.cur_ts = self.first_ts;
            return Some(self.first_ts);
        }
        while self.seg_idx < self.segments.len() && self.seg_used >= self.segments[self.seg_idx].1 {
            self.seg_idx += 1;
            self.seg_used = 0;
        }
        let (delta, _) = self.segments.get(self.seg_idx)?;
        self.cur_ts += delta;
        self.seg_used += 1;
        self.row += 1;
        Some(self.cur_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRef;
    use proptest::prelude::*;

    fn reader_for(timestamps: &[i64]) -> TimestampReader {
        let mut appender = TimestampAppender::new();
        for ts in timestamps {
            appender.append(*ts);
        }
        TimestampReader::new(BlockRef::unmanaged(appender.encode())).unwrap()
    }

    #[test]
    fn test_round_trip_regular_cadence() {
        let timestamps: Vec<i64> = (0..720).map(|i| 1_000 + i * 10_000).collect();
        let reader = reader_for(&timestamps);
        assert_eq!(reader.num_rows(), 720);
        let decoded: Vec<i64> = reader.iterate(0).collect();
        assert_eq!(decoded, timestamps);
    }

    #[test]
    fn test_round_trip_irregular() {
        let timestamps = vec![5, 6, 100, 101, 102, 90_000, 90_001];
        let reader = reader_for(&timestamps);
        let decoded: Vec<i64> = reader.iterate(0).collect();
        assert_eq!(decoded, timestamps);
        assert_eq!(reader.iterate(3).collect::<Vec<_>>(), &timestamps[3..]);
    }

    #[test]
    fn test_apply_random_access() {
        let timestamps: Vec<i64> = (0..100).map(|i| i * 7 + (i % 3)).collect();
        let reader = reader_for(&timestamps);
        for (i, ts) in timestamps.iter().enumerate() {
            assert_eq!(reader.apply(i as u32), *ts, "row {i}");
        }
    }

    #[test]
    fn test_ceiling_index() {
        let timestamps = vec![100, 110, 120, 200, 210];
        let reader = reader_for(&timestamps);

        assert_eq!(reader.ceiling_index(99), None);
        assert_eq!(reader.ceiling_index(100), Some(0));
        assert_eq!(reader.ceiling_index(115), Some(1));
        assert_eq!(reader.ceiling_index(120), Some(2));
        assert_eq!(reader.ceiling_index(199), Some(2));
        assert_eq!(reader.ceiling_index(200), Some(3));
        assert_eq!(reader.ceiling_index(10_000), Some(4));
    }

    #[test]
    fn test_appender_ceiling_matches_reader() {
        let timestamps: Vec<i64> = (0..50).map(|i| 1_000 + i * 10).collect();
        let mut appender = TimestampAppender::new();
        for ts in &timestamps {
            appender.append(*ts);
        }
        let reader = reader_for(&timestamps);
        for probe in (990..1_520).step_by(7) {
            assert_eq!(
                appender.ceiling_index(probe),
                reader.ceiling_index(probe),
                "probe {probe}"
            );
        }
    }

    #[test]
    fn test_single_row() {
        let reader = reader_for(&[42]);
        assert_eq!(reader.num_rows(), 1);
        assert_eq!(reader.apply(0), 42);
        assert_eq!(reader.ceiling_index(41), None);
        assert_eq!(reader.ceiling_index(42), Some(0));
        assert_eq!(reader.ceiling_index(43), Some(0));
    }

    #[test]
    fn test_reset_reuses_appender() {
        let mut appender = TimestampAppender::new();
        appender.append(1);
        appender.append(2);
        appender.reset();
        assert_eq!(appender.num_rows(), 0);
        appender.append(10);
        appender.append(20);
        let reader = TimestampReader::new(BlockRef::unmanaged(appender.encode())).unwrap();
        assert_eq!(reader.iterate(0).collect::<Vec<_>>(), vec![10, 20]);
    }

    proptest! {
        #[test]
        fn prop_round_trip(deltas in proptest::collection::vec(1i64..100_000, 1..200)) {
            let mut timestamps = Vec::with_capacity(deltas.len());
            let mut ts = 1_600_000_000_000i64;
            for d in deltas {
                ts += d;
                timestamps.push(ts);
            }
            let reader = reader_for(&timestamps);
            let decoded: Vec<i64> = reader.iterate(0).collect();
            prop_assert_eq!(decoded, timestamps);
        }
    }
}
