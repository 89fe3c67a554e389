//! Period markers: which row indices terminate each downsample period.

use chunk_format::{DoubleReader, TimestampReader};
use std::collections::BTreeSet;

/// Row indices ending each period of one chunk, for resolution `r_ms`.
///
/// Period `k` ends at the greatest row whose timestamp is at most
/// `(floor((start - 1) / R) + 1 + k) * R`; the right boundary is inclusive,
/// so a sample at exactly `t = kR` belongs to period `k`, and period `k+1`
/// starts at user time `kR + 1`.
pub fn default_period_ends(timestamps: &TimestampReader, r_ms: i64) -> Vec<u32> {
    let num_rows = timestamps.num_rows();
    if num_rows == 0 {
        return vec![];
    }
    let start = timestamps.apply(0);
    let end = timestamps.apply(num_rows - 1);

    let mut ends = BTreeSet::new();
    let mut boundary = ((start - 1).div_euclid(r_ms) + 1) * r_ms;
    loop {
        if let Some(row) = timestamps.ceiling_index(boundary) {
            ends.insert(row);
        }
        if boundary >= end {
            break;
        }
        boundary += r_ms;
    }
    ends.into_iter().collect()
}

/// Period ends for a counter column: the default set, plus the chunk's
/// first row, plus a boundary on either side of every counter dip so that
/// rate computation never averages across a reset.
///
/// The reference implementation walked the drop list with an off-by-one
/// that read index -1 on the first iteration; here each drop position `d`
/// simply contributes `d` and, when positive, `d - 1`.
pub fn counter_period_ends(
    timestamps: &TimestampReader,
    doubles: &DoubleReader,
    r_ms: i64,
) -> Vec<u32> {
    let num_rows = timestamps.num_rows();
    if num_rows == 0 {
        return vec![];
    }

    let mut ends: BTreeSet<u32> = default_period_ends(timestamps, r_ms).into_iter().collect();
    ends.insert(0);
    if doubles.dropped() {
        for &d in doubles.drop_positions() {
            if d >= num_rows {
                continue;
            }
            if d > 0 {
                ends.insert(d - 1);
            }
            ends.insert(d);
        }
    }
    ends.into_iter().collect()
}
