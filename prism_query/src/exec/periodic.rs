//! Periodic sampling: turning raw row streams into stepped instant values.

use crate::exec::{ExecResult, RangeVectorTransformer};
use crate::logical::{RangeFunction, StepRange};
use crate::{BadQuerySnafu, QuerySession, RangeVector, Result, RowData};
use futures::StreamExt;

/// Lookback applied when no explicit window is given: the Prometheus
/// staleness interval.
pub const DEFAULT_STALENESS_MS: i64 = 300_000;

/// Produces, for each step `t`, the value computed over the lookback
/// window `(t - window, t]`: the last sample for plain periodic series, or
/// the configured range function for windowed ones.
///
/// Associative functions fold the decoded window directly; `rate`-family
/// functions walk it once applying counter-reset correction.
#[derive(Debug, Clone)]
pub struct PeriodicSamplesMapper {
    step_range: StepRange,
    window_ms: i64,
    function: Option<RangeFunction>,
}

impl PeriodicSamplesMapper {
    /// Last-sample stepping with the default staleness lookback.
    pub fn last_sample(step_range: StepRange) -> Self {
        Self {
            step_range,
            window_ms: DEFAULT_STALENESS_MS,
            function: None,
        }
    }

    /// Range-function stepping over an explicit window.
    pub fn windowed(step_range: StepRange, window_ms: i64, function: RangeFunction) -> Self {
        Self {
            step_range,
            window_ms,
            function: Some(function),
        }
    }

    fn map_doubles(&self, rows: &[(i64, f64)]) -> Vec<(i64, f64)> {
        let mut out = Vec::new();
        // two cursors over the sorted rows; each step's window is
        // rows[lo..hi]
        let mut lo = 0usize;
        let mut hi = 0usize;
        for t in self.step_range.steps() {
            let from = t - self.window_ms;
            while hi < rows.len() && rows[hi].0 <= t {
                hi += 1;
            }
            while lo < hi && rows[lo].0 <= from {
                lo += 1;
            }
            let window = &rows[lo..hi];
            let value = match self.function {
                None => window
                    .iter()
                    .rev()
                    .map(|(_, v)| *v)
                    .next(),
                Some(f) => eval_range_function(f, window),
            };
            if let Some(v) = value {
                out.push((t, v));
            }
        }
        out
    }
}

impl RangeVectorTransformer for PeriodicSamplesMapper {
    fn name(&self) -> &'static str {
        "PeriodicSamplesMapper"
    }

    fn transform(&self, input: ExecResult, _session: &QuerySession) -> Result<ExecResult> {
        if input.schema.is_histogram && self.function.is_some() {
            return BadQuerySnafu {
                reason: "range functions are not defined over histogram columns",
            }
            .fail();
        }

        let mapper = self.clone();
        let stream = input
            .stream
            .map(move |rv| {
                let rv = rv?;
                Ok(match rv.rows {
                    RowData::Doubles(rows) => {
                        RangeVector::doubles(rv.key, mapper.map_doubles(&rows))
                    }
                    RowData::Histograms(rows) => {
                        // last-histogram sampling per step
                        let mut out = Vec::new();
                        for t in mapper.step_range.steps() {
                            let from = t - mapper.window_ms;
                            if let Some((_, h)) = rows
                                .iter()
                                .rev()
                                .find(|(ts, _)| *ts <= t && *ts > from)
                            {
                                out.push((t, h.clone()));
                            }
                        }
                        RangeVector::histograms(rv.key, out)
                    }
                })
            })
            .boxed();

        Ok(ExecResult {
            schema: input.schema,
            stream,
        })
    }
}

/// Evaluate one range function over the samples of a window. Returns
/// `None` when the window cannot produce a value (empty, or too few
/// samples for the rate family).
pub fn eval_range_function(f: RangeFunction, window: &[(i64, f64)]) -> Option<f64> {
    match f {
        RangeFunction::Rate => counter_delta(window).map(|d| d.per_second()),
        RangeFunction::Increase => counter_delta(window).map(|d| d.total),
        RangeFunction::Irate => {
            let valid: Vec<&(i64, f64)> =
                window.iter().filter(|(_, v)| !v.is_nan()).collect();
            let [.., (t1, v1), (t2, v2)] = valid.as_slice() else {
                return None;
            };
            let dv = if v2 >= v1 { v2 - v1 } else { *v2 };
            let dt = (t2 - t1) as f64 / 1000.0;
            (dt > 0.0).then(|| dv / dt)
        }
        RangeFunction::Delta => {
            let mut valid = window.iter().filter(|(_, v)| !v.is_nan());
            let first = valid.next()?;
            let last = valid.last().unwrap_or(first);
            (last.0 > first.0).then(|| last.1 - first.1)
        }
        RangeFunction::SumOverTime => fold_non_nan(window, |acc, v| acc + v),
        RangeFunction::MinOverTime => fold_non_nan(window, f64::min),
        RangeFunction::MaxOverTime => fold_non_nan(window, f64::max),
        RangeFunction::CountOverTime => {
            if window.is_empty() {
                None
            } else {
                Some(window.iter().filter(|(_, v)| !v.is_nan()).count() as f64)
            }
        }
        RangeFunction::AvgOverTime => {
            let count = window.iter().filter(|(_, v)| !v.is_nan()).count();
            fold_non_nan(window, |acc, v| acc + v).map(|sum| sum / count as f64)
        }
        RangeFunction::StddevOverTime => moments(window).map(|(_, _, var)| var.sqrt()),
        RangeFunction::StdvarOverTime => moments(window).map(|(_, _, var)| var),
        RangeFunction::QuantileOverTime(q) => {
            let mut values: Vec<f64> = window
                .iter()
                .map(|(_, v)| *v)
                .filter(|v| !v.is_nan())
                .collect();
            if values.is_empty() {
                return None;
            }
            values.sort_by(|a, b| a.partial_cmp(b).unwrap());
            Some(quantile_sorted(&values, q))
        }
    }
}

struct CounterDelta {
    total: f64,
    elapsed_secs: f64,
}

impl CounterDelta {
    fn per_second(&self) -> f64 {
        self.total / self.elapsed_secs
    }
}

/// Reset-corrected increase across a window: every dip adds the pre-dip
/// value back, so a counter restart never produces a negative slope.
fn counter_delta(window: &[(i64, f64)]) -> Option<CounterDelta> {
    let valid: Vec<(i64, f64)> = window
        .iter()
        .copied()
        .filter(|(_, v)| !v.is_nan())
        .collect();
    if valid.len() < 2 {
        return None;
    }
    let (first_ts, first_v) = valid[0];
    let (last_ts, last_v) = valid[valid.len() - 1];

    let mut correction = 0.0;
    for pair in valid.windows(2) {
        if pair[1].1 < pair[0].1 {
            correction += pair[0].1;
        }
    }

    let elapsed_secs = (last_ts - first_ts) as f64 / 1000.0;
    (elapsed_secs > 0.0).then_some(CounterDelta {
        total: last_v + correction - first_v,
        elapsed_secs,
    })
}

fn fold_non_nan(window: &[(i64, f64)], f: impl Fn(f64, f64) -> f64) -> Option<f64> {
    window
        .iter()
        .map(|(_, v)| *v)
        .filter(|v| !v.is_nan())
        .reduce(f)
}

/// Welford single pass: `(count, mean, population variance)`.
fn moments(window: &[(i64, f64)]) -> Option<(f64, f64, f64)> {
    let mut count = 0.0;
    let mut mean = 0.0;
    let mut m2 = 0.0;
    for (_, v) in window {
        if v.is_nan() {
            continue;
        }
        count += 1.0;
        let delta = v - mean;
        mean += delta / count;
        m2 += delta * (v - mean);
    }
    (count > 0.0).then_some((count, mean, m2 / count))
}

/// Linear-interpolated quantile of a sorted slice, Prometheus style.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RangeVectorKey;
    use futures::stream;

    fn steps(samples: &[(i64, f64)], mapper: &PeriodicSamplesMapper) -> Vec<(i64, f64)> {
        mapper.map_doubles(samples)
    }

    #[test]
    fn test_last_sample_stepping() {
        // samples every 10s, stepped every 60s: scenario A shape
        let start = 0i64;
        let samples: Vec<(i64, f64)> =
            (0..720).map(|i| (start + i * 10_000, i as f64)).collect();
        let mapper = PeriodicSamplesMapper::last_sample(StepRange::new(
            start + 60_000,
            60_000,
            start + 600_000,
        ));
        let out = steps(&samples, &mapper);
        assert_eq!(out.len(), 10);
        let values: Vec<f64> = out.iter().map(|(_, v)| *v).collect();
        assert_eq!(
            values,
            vec![6.0, 12.0, 18.0, 24.0, 30.0, 36.0, 42.0, 48.0, 54.0, 60.0]
        );
    }

    #[test]
    fn test_stale_steps_emit_nothing() {
        let samples = vec![(10_000i64, 1.0)];
        let mapper =
            PeriodicSamplesMapper::last_sample(StepRange::new(0, 60_000, 600_000));
        let out = steps(&samples, &mapper);
        // visible until staleness expires at 310s
        assert_eq!(out, vec![(60_000, 1.0), (120_000, 1.0), (180_000, 1.0), (240_000, 1.0), (300_000, 1.0)]);
    }

    #[test]
    fn test_rate_steady_counter() {
        let samples: Vec<(i64, f64)> = (0..61).map(|i| (i * 10_000, i as f64)).collect();
        let mapper = PeriodicSamplesMapper::windowed(
            StepRange::new(300_000, 60_000, 600_000),
            300_000,
            RangeFunction::Rate,
        );
        for (_, v) in steps(&samples, &mapper) {
            assert!((v - 0.1).abs() < 1e-9, "rate {v}");
        }
    }

    #[test]
    fn test_rate_with_counter_reset() {
        // climb 1/10s for 600s, drop to 0, climb again: scenario B shape
        let mut samples = Vec::new();
        for i in 0..60 {
            samples.push((i * 10_000, i as f64));
        }
        for i in 0..60 {
            samples.push((600_000 + i * 10_000, i as f64));
        }
        let mapper = PeriodicSamplesMapper::windowed(
            StepRange::new(300_000, 60_000, 1_140_000),
            300_000,
            RangeFunction::Rate,
        );
        for (t, v) in steps(&samples, &mapper) {
            // windows spanning the reset lose the one wrapped interval, so
            // the corrected slope sits just under 0.1
            assert!((v - 0.1).abs() < 0.005, "rate {v} at {t}");
        }
    }

    #[test]
    fn test_irate_uses_last_two_samples() {
        let samples = vec![(0i64, 0.0), (10_000, 1.0), (20_000, 5.0)];
        let out = eval_range_function(RangeFunction::Irate, &samples).unwrap();
        assert!((out - 0.4).abs() < 1e-12);

        // reset between the last two samples
        let samples = vec![(0i64, 7.0), (10_000, 2.0)];
        let out = eval_range_function(RangeFunction::Irate, &samples).unwrap();
        assert!((out - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_over_time_functions() {
        let w = vec![
            (1_000i64, 4.0),
            (2_000, 1.0),
            (3_000, f64::NAN),
            (4_000, 7.0),
        ];
        assert_eq!(
            eval_range_function(RangeFunction::SumOverTime, &w),
            Some(12.0)
        );
        assert_eq!(
            eval_range_function(RangeFunction::MinOverTime, &w),
            Some(1.0)
        );
        assert_eq!(
            eval_range_function(RangeFunction::MaxOverTime, &w),
            Some(7.0)
        );
        assert_eq!(
            eval_range_function(RangeFunction::CountOverTime, &w),
            Some(3.0)
        );
        assert_eq!(
            eval_range_function(RangeFunction::AvgOverTime, &w),
            Some(4.0)
        );
        assert_eq!(eval_range_function(RangeFunction::SumOverTime, &[]), None);
    }

    #[test]
    fn test_stddev_stdvar() {
        let w: Vec<(i64, f64)> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .iter()
            .enumerate()
            .map(|(i, v)| (i as i64, *v))
            .collect();
        let var = eval_range_function(RangeFunction::StdvarOverTime, &w).unwrap();
        assert!((var - 4.0).abs() < 1e-12);
        let sd = eval_range_function(RangeFunction::StddevOverTime, &w).unwrap();
        assert!((sd - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_quantile_over_time() {
        let w: Vec<(i64, f64)> = (0..5).map(|i| (i as i64, i as f64)).collect();
        assert_eq!(
            eval_range_function(RangeFunction::QuantileOverTime(0.5), &w),
            Some(2.0)
        );
        assert_eq!(
            eval_range_function(RangeFunction::QuantileOverTime(0.25), &w),
            Some(1.0)
        );
        assert_eq!(
            eval_range_function(RangeFunction::QuantileOverTime(1.0), &w),
            Some(4.0)
        );
    }

    #[test]
    fn test_delta_is_uncorrected() {
        let w = vec![(0i64, 10.0), (10_000, 3.0)];
        assert_eq!(eval_range_function(RangeFunction::Delta, &w), Some(-7.0));
    }

    #[tokio::test]
    async fn test_transform_stream() {
        let samples: Vec<(i64, f64)> = (0..10).map(|i| (i * 10_000, i as f64)).collect();
        let input = ExecResult::from_vectors(
            crate::ResultSchema::time_series(),
            vec![RangeVector::doubles(
                RangeVectorKey::from_labels([("app", "x")]),
                samples,
            )],
        );
        let mapper =
            PeriodicSamplesMapper::last_sample(StepRange::new(30_000, 30_000, 90_000));
        let session = QuerySession::new(&Default::default(), &Default::default());
        let out = mapper.transform(input, &session).unwrap();
        let (_, vectors) = out.collect().await.unwrap();
        assert_eq!(
            vectors[0].rows.as_doubles().unwrap(),
            &[(30_000, 3.0), (60_000, 6.0), (90_000, 9.0)]
        );
    }

    #[test]
    fn test_window_is_left_open() {
        // sample exactly at t - window is excluded
        let samples = vec![(0i64, 100.0), (10_000, 1.0)];
        let mapper = PeriodicSamplesMapper::windowed(
            StepRange::new(10_000, 10_000, 10_000),
            10_000,
            RangeFunction::MaxOverTime,
        );
        assert_eq!(steps(&samples, &mapper), vec![(10_000, 1.0)]);
    }
}
