//! Per-column downsamplers: one output value per period per downsampler.

use crate::{PeriodMarkerMismatchSnafu, Result};
use chunk_format::pool::ValueReader;
use chunk_format::{DoubleReader, HistogramReader, TimestampReader};
use data_types::{ColumnValue, HistogramValue};
use snafu::OptionExt;

/// The aggregation applied to one input column over each period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownsamplerKind {
    /// Minimum of the non-NaN values.
    Min,
    /// Maximum of the non-NaN values.
    Max,
    /// Sum of the non-NaN values; NaN when the period holds none.
    Sum,
    /// Count of the non-NaN values.
    Count,
    /// Arithmetic mean of the non-NaN values.
    Avg,
    /// Merge pre-averaged periods: `(avg·cnt + a·c) / (cnt + c)`. Reads an
    /// average column and its count column.
    AvgFromAvgCount,
    /// Mean from a sum column and a count column.
    AvgFromSumCount,
    /// The period's final value.
    LastValue,
    /// Per-bucket sum of histogram rows.
    HistogramSum,
    /// The period's final timestamp; fills the output timestamp column.
    Timestamp,
}

/// One configured downsampler: the kind plus the value-column indices it
/// reads (`column` for single-input kinds, `column`+`count_column` for the
/// two-input averages).
#[derive(Debug, Clone, Copy)]
pub struct DownsamplerSpec {
    /// Aggregation kind.
    pub kind: DownsamplerKind,
    /// Primary input value-column index; unused by `Timestamp`.
    pub column: usize,
    /// Count-column index for the two-input average kinds.
    pub count_column: usize,
}

impl DownsamplerSpec {
    /// A single-input downsampler.
    pub fn new(kind: DownsamplerKind, column: usize) -> Self {
        Self {
            kind,
            column,
            count_column: 0,
        }
    }

    /// The timestamp downsampler.
    pub fn timestamp() -> Self {
        Self::new(DownsamplerKind::Timestamp, 0)
    }

    /// A two-input average downsampler.
    pub fn with_count(kind: DownsamplerKind, column: usize, count_column: usize) -> Self {
        Self {
            kind,
            column,
            count_column,
        }
    }
}

fn double_column<'a>(values: &'a [ValueReader], idx: usize) -> Result<&'a DoubleReader> {
    match values.get(idx) {
        Some(ValueReader::Double(r)) => Ok(r),
        _ => PeriodMarkerMismatchSnafu { column: idx }.fail(),
    }
}

fn histogram_column<'a>(values: &'a [ValueReader], idx: usize) -> Result<&'a HistogramReader> {
    match values.get(idx) {
        Some(ValueReader::Histogram(r)) => Ok(r),
        _ => PeriodMarkerMismatchSnafu { column: idx }.fail(),
    }
}

fn fold_doubles(
    reader: &DoubleReader,
    start: u32,
    end: u32,
    mut f: impl FnMut(f64, f64) -> f64,
) -> f64 {
    let mut acc = f64::NAN;
    for row in start..=end {
        let v = reader.apply(row);
        if v.is_nan() {
            continue;
        }
        acc = if acc.is_nan() { v } else { f(acc, v) };
    }
    acc
}

impl DownsamplerSpec {
    /// Compute this downsampler's output for rows `[start, end]` of one
    /// chunk.
    pub fn compute(
        &self,
        timestamps: &TimestampReader,
        values: &[ValueReader],
        start: u32,
        end: u32,
    ) -> Result<ColumnValue> {
        let out = match self.kind {
            DownsamplerKind::Min => {
                ColumnValue::Double(fold_doubles(double_column(values, self.column)?, start, end, f64::min))
            }
            DownsamplerKind::Max => {
                ColumnValue::Double(fold_doubles(double_column(values, self.column)?, start, end, f64::max))
            }
            DownsamplerKind::Sum => {
                let r = double_column(values, self.column)?;
                let count = r.count(start, end);
                ColumnValue::Double(if count == 0 { f64::NAN } else { r.sum(start, end) })
            }
            DownsamplerKind::Count => {
                ColumnValue::Double(f64::from(double_column(values, self.column)?.count(start, end)))
            }
            DownsamplerKind::Avg => {
                let r = double_column(values, self.column)?;
                let count = r.count(start, end);
                ColumnValue::Double(if count == 0 {
                    f64::NAN
                } else {
                    r.sum(start, end) / f64::from(count)
                })
            }
            DownsamplerKind::AvgFromAvgCount => {
                let avgs = double_column(values, self.column)?;
                let counts = double_column(values, self.count_column)?;
                let mut avg = 0.0f64;
                let mut cnt = 0.0f64;
                for row in start..=end {
                    let a = avgs.apply(row);
                    let c = counts.apply(row);
                    if a.is_nan() || c.is_nan() || c == 0.0 {
                        continue;
                    }
                    avg = (avg * cnt + a * c) / (cnt + c);
                    cnt += c;
                }
                ColumnValue::Double(if cnt == 0.0 { f64::NAN } else { avg })
            }
            DownsamplerKind::AvgFromSumCount => {
                let sums = double_column(values, self.column)?;
                let counts = double_column(values, self.count_column)?;
                let total_count = counts.sum(start, end);
                ColumnValue::Double(if !(total_count > 0.0) {
                    f64::NAN
                } else {
                    sums.sum(start, end) / total_count
                })
            }
            DownsamplerKind::LastValue => {
                ColumnValue::Double(double_column(values, self.column)?.apply(end))
            }
            DownsamplerKind::HistogramSum => {
                let r = histogram_column(values, self.column)?;
                let mut iter = (start..=end).map(|row| r.apply(row));
                let first = iter.next().context(PeriodMarkerMismatchSnafu {
                    column: self.column,
                })?;
                let mut counts = first.counts.clone();
                for h in iter {
                    for (acc, c) in counts.iter_mut().zip(&h.counts) {
                        *acc += c;
                    }
                }
                ColumnValue::Histogram(HistogramValue::new(first.scheme.clone(), counts))
            }
            DownsamplerKind::Timestamp => {
                // carried through as a double; the job reads it back out
                ColumnValue::Double(timestamps.apply(end) as f64)
            }
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chunk_format::block::BlockRef;
    use chunk_format::pool::{ValueKind, WriteBufferSet};
    use chunk_format::TimestampReader;

    fn readers_for(samples: &[(i64, f64)]) -> (TimestampReader, Vec<ValueReader>) {
        let mut set = WriteBufferSet::new(&[ValueKind::Double]);
        for (ts, v) in samples {
            set.append_row(*ts, &[ColumnValue::Double(*v)]).unwrap();
        }
        set.snapshot_readers().unwrap()
    }

    fn compute(kind: DownsamplerKind, samples: &[(i64, f64)], start: u32, end: u32) -> f64 {
        let (ts, values) = readers_for(samples);
        match DownsamplerSpec::new(kind, 0)
            .compute(&ts, &values, start, end)
            .unwrap()
        {
            ColumnValue::Double(v) => v,
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[test]
    fn test_min_max_sum_count_avg() {
        let samples = vec![(1, 4.0), (2, 1.0), (3, f64::NAN), (4, 7.0)];
        assert_eq!(compute(DownsamplerKind::Min, &samples, 0, 3), 1.0);
        assert_eq!(compute(DownsamplerKind::Max, &samples, 0, 3), 7.0);
        assert_eq!(compute(DownsamplerKind::Sum, &samples, 0, 3), 12.0);
        assert_eq!(compute(DownsamplerKind::Count, &samples, 0, 3), 3.0);
        assert_eq!(compute(DownsamplerKind::Avg, &samples, 0, 3), 4.0);
    }

    #[test]
    fn test_all_nan_period() {
        let samples = vec![(1, f64::NAN), (2, f64::NAN)];
        assert!(compute(DownsamplerKind::Min, &samples, 0, 1).is_nan());
        assert!(compute(DownsamplerKind::Sum, &samples, 0, 1).is_nan());
        assert_eq!(compute(DownsamplerKind::Count, &samples, 0, 1), 0.0);
    }

    #[test]
    fn test_last_value_and_timestamp() {
        let samples = vec![(10, 1.0), (20, 2.0), (30, 3.0)];
        assert_eq!(compute(DownsamplerKind::LastValue, &samples, 0, 2), 3.0);

        let (ts, values) = readers_for(&samples);
        let out = DownsamplerSpec::timestamp()
            .compute(&ts, &values, 0, 2)
            .unwrap();
        assert_eq!(out, ColumnValue::Double(30.0));
    }

    #[test]
    fn test_avg_from_avg_count_running_formula() {
        // two pre-aggregated periods: avg 2.0 over 4 samples, avg 5.0 over 1
        let mut set = WriteBufferSet::new(&[ValueKind::Double, ValueKind::Double]);
        set.append_row(1, &[ColumnValue::Double(2.0), ColumnValue::Double(4.0)])
            .unwrap();
        set.append_row(2, &[ColumnValue::Double(5.0), ColumnValue::Double(1.0)])
            .unwrap();
        let (ts, values) = set.snapshot_readers().unwrap();

        let out = DownsamplerSpec::with_count(DownsamplerKind::AvgFromAvgCount, 0, 1)
            .compute(&ts, &values, 0, 1)
            .unwrap();
        // (2*4 + 5*1) / 5 = 2.6
        assert_eq!(out, ColumnValue::Double(2.6));
    }

    #[test]
    fn test_avg_from_sum_count() {
        let mut set = WriteBufferSet::new(&[ValueKind::Double, ValueKind::Double]);
        set.append_row(1, &[ColumnValue::Double(8.0), ColumnValue::Double(4.0)])
            .unwrap();
        set.append_row(2, &[ColumnValue::Double(5.0), ColumnValue::Double(1.0)])
            .unwrap();
        let (ts, values) = set.snapshot_readers().unwrap();

        let out = DownsamplerSpec::with_count(DownsamplerKind::AvgFromSumCount, 0, 1)
            .compute(&ts, &values, 0, 1)
            .unwrap();
        assert_eq!(out, ColumnValue::Double(13.0 / 5.0));
    }

    #[test]
    fn test_histogram_sum() {
        use data_types::BucketScheme;
        let scheme = BucketScheme::new(vec![10.0, f64::INFINITY]);
        let mut set = WriteBufferSet::new(&[ValueKind::Histogram]);
        for counts in [[1u64, 3], [2, 2]] {
            set.append_row(
                1 + counts[0] as i64,
                &[ColumnValue::Histogram(HistogramValue::new(
                    scheme.clone(),
                    counts.to_vec(),
                ))],
            )
            .unwrap();
        }
        let (ts, values) = set.snapshot_readers().unwrap();

        let out = DownsamplerSpec::new(DownsamplerKind::HistogramSum, 0)
            .compute(&ts, &values, 0, 1)
            .unwrap();
        assert_eq!(
            out,
            ColumnValue::Histogram(HistogramValue::new(scheme, vec![3, 5]))
        );
    }

    #[test]
    fn test_kind_mismatch_is_fatal() {
        let (ts, values) = readers_for(&[(1, 1.0)]);
        let result =
            DownsamplerSpec::new(DownsamplerKind::HistogramSum, 0).compute(&ts, &values, 0, 0);
        assert_matches!(result, Err(crate::Error::PeriodMarkerMismatch { column: 0 }));
    }
}
