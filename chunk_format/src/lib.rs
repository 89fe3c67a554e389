//! Append-only columnar chunk encodings and the memory that backs them.
//!
//! Three codecs, one per column semantic:
//!
//! * timestamps: delta-of-delta with run-length segments
//! * doubles: XOR-compressed floats with counter-dip tracking
//! * histograms: bucket-scheme header plus per-bucket delta-varint columns
//!
//! Sealed chunks live in [`block`] memory owned by a shard; live appends go
//! through [`pool`] write buffers recycled across flushes.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod block;
mod bits;
mod double;
mod histogram;
pub mod pool;
mod timestamp;
mod varint;

pub use double::{DoubleAppender, DoubleReader};
pub use histogram::{HistogramAppender, HistogramReader};
pub use timestamp::{TimestampAppender, TimestampReader};

use snafu::Snafu;

/// Errors decoding chunk bytes.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum CodecError {
    #[snafu(display("chunk truncated at offset {}", offset))]
    Truncated { offset: usize },

    #[snafu(display("varint wider than 64 bits at offset {}", offset))]
    VarintOverflow { offset: usize },

    #[snafu(display(
        "histogram bucket scheme changed mid-buffer ({} -> {} buckets)",
        have,
        got
    ))]
    SchemeMismatch { have: usize, got: usize },
}

/// Decode result.
pub type Result<T, E = CodecError> = std::result::Result<T, E>;
