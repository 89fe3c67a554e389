//! The downsample pipeline: deterministic aggregation of raw chunks into
//! multi-resolution retained chunks.
//!
//! A batch [`job::DownsampleJob`] reads raw chunks from the remote store by
//! ingestion time, marks downsample periods per chunk ([`marker`]), applies
//! the configured per-column downsamplers ([`downsamplers`]), and flushes
//! the outputs to the per-resolution datasets under their own TTLs. The
//! whole pipeline is idempotent: re-running a window produces byte-identical
//! chunks.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod downsamplers;
pub mod job;
pub mod marker;

use snafu::{ensure, Snafu};
use std::time::Duration;

/// Downsample pipeline errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display(
        "counter period marker applied to non-counter column {}",
        column
    ))]
    PeriodMarkerMismatch { column: usize },

    #[snafu(display(
        "downsampler config invalid: {} resolutions but {} ttls",
        resolutions,
        ttls
    ))]
    MismatchedRetention { resolutions: usize, ttls: usize },

    #[snafu(display("chunk codec error: {}", source))]
    Codec { source: chunk_format::CodecError },

    #[snafu(display("remote store error: {}", source))]
    Store { source: chunk_store::StoreError },
}

/// Downsample result.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Settings for one downsample run, built at startup and passed down.
#[derive(Debug, Clone)]
pub struct DownsamplerConfig {
    /// Output resolutions, one dataset per entry.
    pub resolutions: Vec<Duration>,
    /// Retention per resolution; must match `resolutions` in length.
    pub ttls: Vec<Duration>,
    /// Raw dataset names this downsampler consumes.
    pub raw_schema_names: Vec<String>,
    /// Output partitions per remote write batch.
    pub num_partitions_per_write: usize,
    /// Slack added on both sides of the ingestion-time window to absorb
    /// late flushes.
    pub widen_ingestion_time_range_by: Duration,
    /// Overrides the ingestion time stamped on output chunks; normally the
    /// source chunk's own ingestion time is reused to keep runs
    /// deterministic.
    pub user_time_override: Option<i64>,
}

impl Default for DownsamplerConfig {
    fn default() -> Self {
        Self {
            resolutions: vec![Duration::from_secs(60), Duration::from_secs(3600)],
            ttls: vec![
                Duration::from_secs(30 * 24 * 3600),
                Duration::from_secs(183 * 24 * 3600),
            ],
            raw_schema_names: vec![],
            num_partitions_per_write: 100,
            widen_ingestion_time_range_by: Duration::from_secs(600),
            user_time_override: None,
        }
    }
}

impl DownsamplerConfig {
    /// Validate the resolution/ttl pairing.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.resolutions.len() == self.ttls.len(),
            MismatchedRetentionSnafu {
                resolutions: self.resolutions.len(),
                ttls: self.ttls.len(),
            }
        );
        Ok(())
    }

    /// The `(resolution, ttl)` pairs.
    pub fn retention_pairs(&self) -> impl Iterator<Item = (Duration, Duration)> + '_ {
        self.resolutions
            .iter()
            .copied()
            .zip(self.ttls.iter().copied())
    }

    /// Name of the output dataset for one resolution.
    pub fn output_dataset(raw_name: &str, resolution: Duration) -> String {
        format!("{}_ds_{}", raw_name, resolution.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_config_validation() {
        let config = DownsamplerConfig::default();
        config.validate().unwrap();

        let bad = DownsamplerConfig {
            ttls: vec![Duration::from_secs(1)],
            ..Default::default()
        };
        assert_matches!(
            bad.validate(),
            Err(Error::MismatchedRetention {
                resolutions: 2,
                ttls: 1
            })
        );
    }

    #[test]
    fn test_output_dataset_name() {
        assert_eq!(
            DownsamplerConfig::output_dataset("prom", Duration::from_secs(60)),
            "prom_ds_60000"
        );
    }
}
