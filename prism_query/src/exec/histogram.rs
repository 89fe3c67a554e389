//! Histogram transformations: quantiles from buckets, and histogram
//! columns expanded to Prometheus bucket series.

use crate::exec::{buffered, ExecResult, RangeVectorTransformer};
use crate::{QuerySession, RangeVector, RangeVectorKey, ResultSchema, Result, RowData};
use data_types::HistogramValue;
use futures::StreamExt;
use std::collections::BTreeMap;

const METRIC_NAME_LABEL: &str = "__name__";
const LE_LABEL: &str = "le";

/// Render a bucket bound the way Prometheus labels it.
fn format_le(le: f64) -> String {
    if le == f64::INFINITY {
        "+Inf".to_string()
    } else if le == le.trunc() && le.abs() < 1e15 {
        format!("{}", le as i64)
    } else {
        format!("{le}")
    }
}

/// φ-quantile over cumulative buckets `(le, count)` sorted by `le`.
/// Interpolates linearly within the winning bucket; the lowest bucket
/// interpolates from zero, the `+Inf` bucket collapses to the highest
/// finite bound.
pub fn bucket_quantile(q: f64, buckets: &[(f64, f64)]) -> f64 {
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    if buckets.len() < 2 || buckets.last().map(|(le, _)| *le) != Some(f64::INFINITY) {
        return f64::NAN;
    }
    let total = buckets[buckets.len() - 1].1;
    if !(total > 0.0) {
        return f64::NAN;
    }

    let rank = q * total;
    let mut idx = buckets.len() - 1;
    for (i, (_, count)) in buckets.iter().enumerate() {
        if *count >= rank {
            idx = i;
            break;
        }
    }

    if idx == buckets.len() - 1 {
        // landed in +Inf: the best answer is the highest finite bound
        return buckets[buckets.len() - 2].0;
    }
    let (upper, count) = buckets[idx];
    let (lower, prev_count) = if idx == 0 {
        (0.0, 0.0)
    } else {
        buckets[idx - 1]
    };
    if count == prev_count {
        return upper;
    }
    lower + (upper - lower) * (rank - prev_count) / (count - prev_count)
}

fn quantile_of_histogram(q: f64, h: &HistogramValue) -> f64 {
    let buckets: Vec<(f64, f64)> = h
        .scheme
        .bounds()
        .iter()
        .zip(&h.counts)
        .map(|(le, c)| (*le, *c as f64))
        .collect();
    bucket_quantile(q, &buckets)
}

/// Computes `histogram_quantile(q, v)`.
///
/// Native histogram vectors convert row by row. Prometheus-schema inputs
/// (one series per `le` bucket) are grouped by their non-`le` labels first,
/// which requires buffering the stream; the planner therefore attaches
/// this mapper above the shard concatenation point.
#[derive(Debug, Clone, Copy)]
pub struct HistogramQuantileMapper {
    q: f64,
}

impl HistogramQuantileMapper {
    /// Build a quantile mapper.
    pub fn new(q: f64) -> Self {
        Self { q }
    }
}

impl RangeVectorTransformer for HistogramQuantileMapper {
    fn name(&self) -> &'static str {
        "HistogramQuantileMapper"
    }

    fn transform(&self, input: ExecResult, _session: &QuerySession) -> Result<ExecResult> {
        let q = self.q;
        if input.schema.is_histogram {
            let stream = input
                .stream
                .map(move |rv| {
                    let rv = rv?;
                    let rows = match &rv.rows {
                        RowData::Histograms(rows) => rows
                            .iter()
                            .map(|(ts, h)| (*ts, quantile_of_histogram(q, h)))
                            .collect(),
                        _ => vec![],
                    };
                    Ok(RangeVector::doubles(
                        rv.key.without_label(METRIC_NAME_LABEL),
                        rows,
                    ))
                })
                .boxed();
            return Ok(ExecResult {
                schema: ResultSchema::time_series(),
                stream,
            });
        }

        // prometheus-schema buckets: group series by their non-le labels
        let stream = buffered(input.stream, move |vectors| {
            let mut groups: BTreeMap<RangeVectorKey, Vec<(f64, &RangeVector)>> = BTreeMap::new();
            for rv in &vectors {
                let Some(le) = rv.key.get(LE_LABEL).and_then(|v| parse_le(v)) else {
                    continue;
                };
                let group = rv
                    .key
                    .without_label(LE_LABEL)
                    .without_label(METRIC_NAME_LABEL);
                groups.entry(group).or_default().push((le, rv));
            }

            let mut out = Vec::new();
            for (group, mut members) in groups {
                members.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
                let mut timestamps: Vec<i64> = members
                    .iter()
                    .flat_map(|(_, rv)| rv.rows.timestamps())
                    .collect();
                timestamps.sort_unstable();
                timestamps.dedup();

                let per_member: Vec<(f64, BTreeMap<i64, f64>)> = members
                    .iter()
                    .map(|(le, rv)| {
                        let rows: BTreeMap<i64, f64> = rv
                            .rows
                            .as_doubles()
                            .map(|rows| rows.iter().copied().collect())
                            .unwrap_or_default();
                        (*le, rows)
                    })
                    .collect();

                let rows: Vec<(i64, f64)> = timestamps
                    .into_iter()
                    .map(|ts| {
                        let buckets: Vec<(f64, f64)> = per_member
                            .iter()
                            .filter_map(|(le, rows)| {
                                rows.get(&ts)
                                    .filter(|v| !v.is_nan())
                                    .map(|v| (*le, *v))
                            })
                            .collect();
                        (ts, bucket_quantile(q, &buckets))
                    })
                    .collect();
                out.push(RangeVector::doubles(group, rows));
            }
            Ok(out)
        });

        Ok(ExecResult {
            schema: ResultSchema::time_series(),
            stream,
        })
    }
}

fn parse_le(v: &str) -> Option<f64> {
    match v {
        "+Inf" => Some(f64::INFINITY),
        _ => v.parse().ok(),
    }
}

/// Expands each histogram vector into one series per bucket, Prometheus
/// style: `_bucket` metric suffix and an `le` label.
///
/// Bucket schemes may change mid-stream; every bucket seen anywhere in the
/// vector gets the full timeline, with NaN where its scheme was absent.
#[derive(Debug, Clone, Copy)]
pub struct HistToPromSeriesMapper;

impl RangeVectorTransformer for HistToPromSeriesMapper {
    fn name(&self) -> &'static str {
        "HistToPromSeriesMapper"
    }

    fn transform(&self, input: ExecResult, _session: &QuerySession) -> Result<ExecResult> {
        let stream = input
            .stream
            .map(|rv| {
                let rv = rv?;
                Ok(expand_buckets(&rv))
            })
            .flat_map(|result: Result<Vec<RangeVector>>| match result {
                Ok(vectors) => futures::stream::iter(vectors.into_iter().map(Ok)).boxed(),
                Err(e) => futures::stream::once(futures::future::ready(Err(e))).boxed(),
            })
            .boxed();
        Ok(ExecResult {
            schema: ResultSchema::time_series(),
            stream,
        })
    }
}

fn expand_buckets(rv: &RangeVector) -> Vec<RangeVector> {
    let RowData::Histograms(rows) = &rv.rows else {
        return vec![rv.clone()];
    };

    // union of bucket bounds across every scheme seen in this vector
    let mut bounds: Vec<f64> = Vec::new();
    for (_, h) in rows {
        for le in h.scheme.bounds() {
            if !bounds.iter().any(|b| b.to_bits() == le.to_bits()) {
                bounds.push(*le);
            }
        }
    }
    bounds.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let base_key = match rv.key.get(METRIC_NAME_LABEL) {
        Some(name) => {
            let bucket_name = format!("{name}_bucket");
            rv.key.with_label(METRIC_NAME_LABEL, &bucket_name)
        }
        None => rv.key.clone(),
    };

    bounds
        .iter()
        .map(|le| {
            let rows: Vec<(i64, f64)> = rows
                .iter()
                .map(|(ts, h)| {
                    let v = h
                        .scheme
                        .bounds()
                        .iter()
                        .position(|b| b.to_bits() == le.to_bits())
                        .map(|i| h.counts[i] as f64)
                        .unwrap_or(f64::NAN);
                    (*ts, v)
                })
                .collect();
            RangeVector::doubles(base_key.with_label(LE_LABEL, &format_le(*le)), rows)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::BucketScheme;

    #[test]
    fn test_bucket_quantile_interpolates() {
        let buckets = vec![(1.0, 10.0), (2.0, 30.0), (f64::INFINITY, 40.0)];
        // median rank 20 falls halfway through the second bucket
        assert_eq!(bucket_quantile(0.5, &buckets), 1.5);
        // rank 10 is the first bucket's full count
        assert_eq!(bucket_quantile(0.25, &buckets), 1.0);
        // above the last finite bucket: collapse to its bound
        assert_eq!(bucket_quantile(0.99, &buckets), 2.0);
    }

    #[test]
    fn test_bucket_quantile_edge_cases() {
        assert_eq!(
            bucket_quantile(-0.1, &[(1.0, 1.0), (f64::INFINITY, 1.0)]),
            f64::NEG_INFINITY
        );
        assert_eq!(
            bucket_quantile(1.5, &[(1.0, 1.0), (f64::INFINITY, 1.0)]),
            f64::INFINITY
        );
        // missing +Inf bucket
        assert!(bucket_quantile(0.5, &[(1.0, 1.0), (2.0, 2.0)]).is_nan());
        // empty histogram
        assert!(bucket_quantile(0.5, &[(1.0, 0.0), (f64::INFINITY, 0.0)]).is_nan());
    }

    #[test]
    fn test_expand_buckets_scheme_change() {
        // scenario F: scheme widens mid-stream
        let narrow = BucketScheme::new(vec![10.0, 100.0, f64::INFINITY]);
        let wide = BucketScheme::new(vec![10.0, 50.0, 100.0, f64::INFINITY]);
        let rv = RangeVector::histograms(
            RangeVectorKey::from_labels([("__name__", "lat"), ("app", "x")]),
            vec![
                (10, HistogramValue::new(narrow.clone(), vec![1, 2, 3])),
                (20, HistogramValue::new(wide.clone(), vec![1, 2, 4, 5])),
                (30, HistogramValue::new(wide, vec![2, 3, 5, 6])),
            ],
        );

        let out = expand_buckets(&rv);
        assert_eq!(out.len(), 4);
        let les: Vec<&str> = out.iter().map(|rv| rv.key.get("le").unwrap()).collect();
        assert_eq!(les, vec!["10", "50", "100", "+Inf"]);
        for rv in &out {
            assert_eq!(rv.key.get("__name__"), Some("lat_bucket"));
        }

        // le=50 was absent from the first scheme: NaN there, values after
        let le50 = &out[1];
        let rows = le50.rows.as_doubles().unwrap();
        assert!(rows[0].1.is_nan());
        assert_eq!(rows[1], (20, 2.0));
        assert_eq!(rows[2], (30, 3.0));
    }

    #[test]
    fn test_format_le() {
        assert_eq!(format_le(10.0), "10");
        assert_eq!(format_le(0.5), "0.5");
        assert_eq!(format_le(f64::INFINITY), "+Inf");
    }
}
