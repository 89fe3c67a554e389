//! The physical plan: asynchronous, cancellable execution.
//!
//! Every [`ExecPlan`] yields a [`ResultSchema`] plus a lazy stream of
//! [`RangeVector`]s. Non-leaf nodes await child schemas, verify they agree,
//! and compose the child streams; attached [`RangeVectorTransformer`]s are
//! applied in order on top of a node's own output.

pub mod aggregate;
pub mod binary_join;
pub mod histogram;
pub mod periodic;
pub mod select;
pub mod transformers;

use crate::{QueryError, QuerySession, RangeVector, ResultSchema, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use memstore::TimeSeriesMemStore;
use observability_deps::tracing::debug;
use rand::Rng;
use std::sync::Arc;

/// The stream half of an execution result.
pub type RangeVectorStream = BoxStream<'static, Result<RangeVector>>;

/// Schema plus stream produced by executing one plan node.
pub struct ExecResult {
    /// Shape of the rows.
    pub schema: ResultSchema,
    /// The lazy range-vector stream.
    pub stream: RangeVectorStream,
}

impl std::fmt::Debug for ExecResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecResult")
            .field("schema", &self.schema)
            .finish()
    }
}

impl ExecResult {
    /// An empty result of the given schema.
    pub fn empty(schema: ResultSchema) -> Self {
        Self {
            schema,
            stream: stream::empty().boxed(),
        }
    }

    /// A result over pre-built vectors.
    pub fn from_vectors(schema: ResultSchema, vectors: Vec<RangeVector>) -> Self {
        Self {
            schema,
            stream: stream::iter(vectors.into_iter().map(Ok)).boxed(),
        }
    }

    /// Buffer the whole stream. Only global-vision operators (sort,
    /// absent, scalar extraction, joins, histogram grouping, topk
    /// presentation) call this.
    pub async fn collect(self) -> Result<(ResultSchema, Vec<RangeVector>)> {
        let mut stream = self.stream;
        let mut vectors = Vec::new();
        while let Some(rv) = stream.next().await {
            vectors.push(rv?);
        }
        Ok((self.schema, vectors))
    }
}

/// A stream-to-stream stage attached to an exec node and applied in order
/// after the node's own output.
pub trait RangeVectorTransformer: std::fmt::Debug + Send + Sync {
    /// Human-readable stage name for plan printing.
    fn name(&self) -> &'static str;

    /// Transform the input result.
    fn transform(&self, input: ExecResult, session: &QuerySession) -> Result<ExecResult>;
}

/// Decides where a plan node executes. In a cluster deployment leaf
/// dispatchers route to the shard-owning node; in-process execution is the
/// single-node implementation of the same contract.
#[async_trait]
pub trait PlanDispatcher: std::fmt::Debug + Send + Sync {
    /// Execute `plan` wherever this dispatcher points.
    async fn dispatch(
        &self,
        plan: &Arc<dyn ExecPlan>,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult>;
}

/// Executes the plan on the local node.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessPlanDispatcher;

#[async_trait]
impl PlanDispatcher for InProcessPlanDispatcher {
    async fn dispatch(
        &self,
        plan: &Arc<dyn ExecPlan>,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        plan.execute(store, session).await
    }
}

/// Pick the dispatcher of one child uniformly weighted by its subtree
/// size, so fan-in lands on a node already doing proportional work.
pub fn pick_dispatcher(children: &[Arc<dyn ExecPlan>]) -> Arc<dyn PlanDispatcher> {
    assert!(!children.is_empty(), "cannot pick from zero children");
    let weights: Vec<usize> = children
        .iter()
        .map(|c| c.children().len().max(1))
        .collect();
    let total: usize = weights.iter().sum();
    let mut pick = rand::thread_rng().gen_range(0..total);
    for (child, w) in children.iter().zip(weights) {
        if pick < w {
            return child.dispatcher();
        }
        pick -= w;
    }
    children[children.len() - 1].dispatcher()
}

/// A node of the physical plan.
#[async_trait]
pub trait ExecPlan: std::fmt::Debug + Send + Sync + 'static {
    /// Node name for plan printing.
    fn name(&self) -> &'static str;

    /// Child nodes.
    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![]
    }

    /// Where this node executes.
    fn dispatcher(&self) -> Arc<dyn PlanDispatcher>;

    /// Transformers applied after this node's own output.
    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &[]
    }

    /// Produce this node's own result, before transformers.
    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult>;

    /// Execute the node: deadline check, own output, then transformers in
    /// order.
    async fn execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        session.check_deadline()?;
        debug!(query_id = %session.query_id, node = self.name(), "executing plan node");
        let mut result = match self.do_execute(store, session).await {
            Ok(result) => result,
            Err(e) => {
                // errors cancel the whole subtree; no partial results
                session.cancel.cancel();
                return Err(e);
            }
        };
        for t in self.transformers() {
            result = t.transform(result, session)?;
        }
        Ok(result)
    }
}

/// Execute child plans through their dispatchers and require identical
/// schemas. Children with empty streams adopt the first schema.
pub async fn execute_children(
    children: &[Arc<dyn ExecPlan>],
    store: &Arc<TimeSeriesMemStore>,
    session: &QuerySession,
) -> Result<(ResultSchema, Vec<RangeVectorStream>)> {
    let mut schema: Option<ResultSchema> = None;
    let mut streams = Vec::with_capacity(children.len());
    for child in children {
        let result = child.dispatcher().dispatch(child, store, session).await?;
        match &schema {
            None => schema = Some(result.schema.clone()),
            Some(first) if *first != result.schema => {
                session.cancel.cancel();
                return Err(QueryError::SchemaMismatch {
                    reason: format!(
                        "child schema {:?} differs from {:?}",
                        result.schema, first
                    ),
                });
            }
            Some(_) => {}
        }
        streams.push(result.stream);
    }
    Ok((
        schema.unwrap_or_else(ResultSchema::time_series),
        streams,
    ))
}

/// Concatenates per-shard children of one node on the local host.
#[derive(Debug)]
pub struct LocalPartitionDistConcatExec {
    children: Vec<Arc<dyn ExecPlan>>,
    dispatcher: Arc<dyn PlanDispatcher>,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
}

impl LocalPartitionDistConcatExec {
    /// Concatenate `children`, dispatching where one of them (weighted)
    /// lives.
    pub fn new(children: Vec<Arc<dyn ExecPlan>>) -> Self {
        let dispatcher = pick_dispatcher(&children);
        Self {
            children,
            dispatcher,
            transformers: vec![],
        }
    }

    /// Attach a transformer stage.
    pub fn add_range_vector_transformer(&mut self, t: Arc<dyn RangeVectorTransformer>) {
        self.transformers.push(t);
    }
}

#[async_trait]
impl ExecPlan for LocalPartitionDistConcatExec {
    fn name(&self) -> &'static str {
        "LocalPartitionDistConcatExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        self.children.clone()
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &self.transformers
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        let (schema, streams) = execute_children(&self.children, store, session).await?;
        let mut combined = stream::empty().boxed();
        for s in streams {
            combined = combined.chain(s).boxed();
        }
        Ok(ExecResult {
            schema,
            stream: combined,
        })
    }
}

/// Applies transformer stages on top of an already-built child node,
/// executing wherever the child executes. The planner uses this to attach
/// stages without reopening finished nodes.
#[derive(Debug)]
pub struct TransformExec {
    child: Arc<dyn ExecPlan>,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
}

impl TransformExec {
    /// Wrap `child` with one transformer stage.
    pub fn new(child: Arc<dyn ExecPlan>, t: Arc<dyn RangeVectorTransformer>) -> Self {
        Self {
            child,
            transformers: vec![t],
        }
    }

    /// Attach a further transformer stage.
    pub fn add_range_vector_transformer(&mut self, t: Arc<dyn RangeVectorTransformer>) {
        self.transformers.push(t);
    }
}

#[async_trait]
impl ExecPlan for TransformExec {
    fn name(&self) -> &'static str {
        "TransformExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.child)]
    }

    fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
        self.child.dispatcher()
    }

    fn transformers(&self) -> &[Arc<dyn RangeVectorTransformer>] {
        &self.transformers
    }

    async fn do_execute(
        &self,
        store: &Arc<TimeSeriesMemStore>,
        session: &QuerySession,
    ) -> Result<ExecResult> {
        self.child
            .dispatcher()
            .dispatch(&self.child, store, session)
            .await
    }
}

/// Wrap a root result with the session's sample limit, deadline and
/// cancellation enforcement. Applied once, at the tree root.
pub fn enforce_limits(result: ExecResult, session: &QuerySession) -> ExecResult {
    let session = session.clone();
    let limit = session.sample_limit;
    let mut emitted = 0usize;
    let stream = result
        .stream
        .map(move |rv| {
            session.check_deadline()?;
            let rv = rv?;
            emitted += rv.num_samples();
            if emitted > limit {
                session.cancel.cancel();
                return Err(QueryError::QueryLimitReached { limit });
            }
            Ok(rv)
        })
        .boxed();
    ExecResult {
        schema: result.schema,
        stream: short_circuit_on_error(stream),
    }
}

/// Lazily buffer a stream, apply `f` to the whole vector set, and stream
/// the outcome. The collection happens on first poll, keeping transformer
/// construction synchronous while the data path stays lazy.
pub(crate) fn buffered(
    mut input: RangeVectorStream,
    f: impl FnOnce(Vec<RangeVector>) -> Result<Vec<RangeVector>> + Send + 'static,
) -> RangeVectorStream {
    stream::once(async move {
        let mut vectors = Vec::new();
        while let Some(rv) = input.next().await {
            match rv {
                Ok(rv) => vectors.push(rv),
                Err(e) => return Err(e),
            }
        }
        f(vectors)
    })
    .flat_map(|result| match result {
        Ok(vectors) => stream::iter(vectors.into_iter().map(Ok)).boxed(),
        Err(e) => stream::once(futures::future::ready(Err(e))).boxed(),
    })
    .boxed()
}

/// End a stream at its first error so consumers never see rows after a
/// terminal failure.
pub(crate) fn short_circuit_on_error(stream: RangeVectorStream) -> RangeVectorStream {
    let mut failed = false;
    stream
        .take_while(move |item| {
            let keep = !failed;
            if item.is_err() {
                failed = true;
            }
            futures::future::ready(keep)
        })
        .boxed()
}

/// Execute a full plan tree with root-level limit enforcement.
pub async fn run_plan(
    plan: &Arc<dyn ExecPlan>,
    store: &Arc<TimeSeriesMemStore>,
    session: &QuerySession,
) -> Result<ExecResult> {
    let result = plan.dispatcher().dispatch(plan, store, session).await?;
    Ok(enforce_limits(result, session))
}
