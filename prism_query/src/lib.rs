//! The query engine: a PromQL-style language compiled to a logical plan,
//! materialized into a physical [`exec::ExecPlan`] tree, and executed as a
//! lazy, cancellable stream of range vectors.
//!
//! The pipeline is `parser` → [`logical::LogicalPlan`] → [`planner`] →
//! [`exec`] tree. Leaves scan memstore partitions per shard; non-leaf nodes
//! compose and transform the child streams. Only operations needing global
//! vision (sort, absent, scalar-from-vector, joins, histogram quantile,
//! topk presentation) buffer; everything else streams.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod exec;
pub mod logical;
pub mod parser;
pub mod planner;
mod range_vector;

pub use range_vector::{AggState, RangeVector, RangeVectorKey, ResultSchema, RowData};

use snafu::Snafu;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Errors surfaced by planning or execution. Plan-time kinds come back
/// synchronously from the planner; exec-time kinds terminate the stream.
#[derive(Debug, Snafu, Clone)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum QueryError {
    #[snafu(display("bad query: {}", reason))]
    BadQuery { reason: String },

    #[snafu(display("undefined column '{}'", column))]
    UndefinedColumn { column: String },

    #[snafu(display("unknown dataset '{}'", dataset))]
    UnknownDataset { dataset: String },

    #[snafu(display("schema mismatch across plan children: {}", reason))]
    SchemaMismatch { reason: String },

    #[snafu(display("query exceeded its deadline"))]
    QueryTimeout,

    #[snafu(display("query exceeded the sample limit of {}", limit))]
    QueryLimitReached { limit: usize },

    #[snafu(display("remote read failed: {}", reason))]
    RemoteReadError { reason: String },
}

impl From<memstore::Error> for QueryError {
    fn from(e: memstore::Error) -> Self {
        match e {
            memstore::Error::UnknownDataset { dataset } => Self::UnknownDataset { dataset },
            memstore::Error::BadRegex { pattern, .. } => Self::BadQuery {
                reason: format!("invalid label regex '{pattern}'"),
            },
            memstore::Error::Store { source } => Self::RemoteReadError {
                reason: source.to_string(),
            },
            other => Self::RemoteReadError {
                reason: other.to_string(),
            },
        }
    }
}

/// Query result.
pub type Result<T, E = QueryError> = std::result::Result<T, E>;

/// Engine-wide query limits, built at startup and passed down.
#[derive(Debug, Clone, Copy)]
pub struct QueryConfig {
    /// Maximum cumulative samples a single query may return.
    pub sample_limit: usize,
    /// Per-query deadline.
    pub ask_timeout: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            sample_limit: 1_000_000,
            ask_timeout: Duration::from_secs(30),
        }
    }
}

/// Caller-supplied context of one query.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Trace id carried through logs.
    pub query_id: String,
    /// Overrides [`QueryConfig::sample_limit`] when smaller.
    pub sample_limit: Option<usize>,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self {
            query_id: uuid::Uuid::new_v4().to_string(),
            sample_limit: None,
        }
    }
}

/// Per-execution session shared by every node of one plan tree.
#[derive(Debug, Clone)]
pub struct QuerySession {
    /// Trace id.
    pub query_id: Arc<str>,
    /// Absolute deadline.
    pub deadline: Instant,
    /// Cumulative sample cap.
    pub sample_limit: usize,
    /// Cancels the whole tree; nodes cancel it on first error.
    pub cancel: CancellationToken,
}

impl QuerySession {
    /// Build a session from context and config.
    pub fn new(context: &QueryContext, config: &QueryConfig) -> Self {
        let sample_limit = context
            .sample_limit
            .map(|l| l.min(config.sample_limit))
            .unwrap_or(config.sample_limit);
        Self {
            query_id: Arc::from(context.query_id.as_str()),
            deadline: Instant::now() + config.ask_timeout,
            sample_limit,
            cancel: CancellationToken::new(),
        }
    }

    /// Error if the deadline passed or the tree was cancelled.
    pub fn check_deadline(&self) -> Result<()> {
        if self.cancel.is_cancelled() || Instant::now() >= self.deadline {
            self.cancel.cancel();
            return Err(QueryError::QueryTimeout);
        }
        Ok(())
    }
}
