//! Element-wise binary joins and set operators between vectors.

use crate::exec::{pick_dispatcher, ExecPlan, ExecResult, PlanDispatcher, RangeVectorTransformer};
use crate::logical::{BinaryOperator, Cardinality, SetOperator};
use crate::{
    BadQuerySnafu, QuerySession, RangeVector, RangeVectorKey, Result, RowData,
};
use async_trait::async_trait;
use memstore::TimeSeriesMemStore;
use snafu::ensure;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const METRIC_NAME_LABEL: &str = "__name__";

fn join_key(key: &RangeVectorKey, on: &[String], ignoring: &[String]) -> RangeVectorKey {
    if !on.is_empty() {
        key.project(on)
    } else {
        let mut k = key.without(ignoring);
        k = k.without_label(METRIC_NAME_LABEL);
        k
    }
}

/// Joins two vector streams on their label keys. Both sides are gathered
/// to this node (a documented buffering point) and matched per the
/// configured cardinality.
#[derive(Debug)]
pub struct BinaryJoinExec {
    lhs: Arc<dyn ExecPlan>,
    rhs: Arc<dyn ExecPlan>,
    op: BinaryOperator,
    cardinality: Cardinality,
    on: Vec<String>,
    ignoring: Vec<String>,
    include: Vec<String>,
    dispatcher: Arc<dyn PlanDispatcher>,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
}

impl BinaryJoinExec {
    /// Build a join node; the dispatcher is picked among the children
    /// weighted by subtree size.
    pub fn new(
        lhs: Arc<dyn ExecPlan>,
        rhs: Arc<dyn ExecPlan>,
        op: BinaryOperator,
        cardinality: Cardinality,
        on: Vec<String>,
        ignoring: Vec<String>,
        include: Vec<String>,
    ) -> Self {
        let children = [Arc::clone(&lhs), Arc::clone(&rhs)];
        let dispatcher = pick_dispatcher(&children);
        Self {
            lhs,
            rhs,
            op,
            cardinality,
            on,
            ignoring,
            include,
            dispatcher,
            transformers: vec![],
        }
    }

    /// Attach a transformer stage.
    pub fn add_range_vector_transformer(&mut self, t: Arc<dyn RangeVectorTransformer>) {
        self.transformers.push(t);
    }

    fn result_key(&self, one: &RangeVectorKey, many: &RangeVectorKey) -> RangeVectorKey {
        let mut key = many.without(&self.ignoring).without_label(METRIC_NAME_LABEL);
        if !self.on.is_empty() {
            key = many.project(&self.on);
        }
        for name in &self.include {
            if let Some(v) = one.get(name) {
                key = key.with_label(name, v);
            }
        }
        key
    }
}

fn rows_by_ts(rows: &RowData) -> Result<BTreeMap<i64, f64>> {
    match rows {
        RowData::Doubles(rows) => Ok(rows.iter().copied().collect()),
        RowData::Histograms(_) => BadQuerySnafu {
            reason: "binary operators are not defined over histogram vectors",
        }
        .fail(),
    }
}

#[async_trait]
impl ExecPlan for BinaryJoinExec {
    fn name(&self) -> &'static str {
        "BinaryJoinExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.lhs), Arc::clone(&self.rhs)]
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
        let lhs = self
            .lhs
            .dispatcher()
            .dispatch(&self.lhs, store, session)
            .await?;
        let rhs = self
            .rhs
            .dispatcher()
            .dispatch(&self.rhs, store, session)
            .await?;
        let (schema, lhs_vectors) = lhs.collect().await?;
        let (_, rhs_vectors) = rhs.collect().await?;

        // the "one" side of the join is rhs for N:1 (and 1:1), lhs for 1:N
        let (many, one, one_side_name) = match self.cardinality {
            Cardinality::OneToMany => (rhs_vectors, lhs_vectors, "left"),
            Cardinality::OneToOne | Cardinality::ManyToOne => {
                (lhs_vectors, rhs_vectors, "right")
            }
            Cardinality::ManyToMany => {
                return BadQuerySnafu {
                    reason: "many-to-many joins are only valid for set operators",
                }
                .fail()
            }
        };

        let mut one_map: HashMap<RangeVectorKey, &RangeVector> = HashMap::new();
        for rv in &one {
            let key = join_key(&rv.key, &self.on, &self.ignoring);
            ensure!(
                one_map.insert(key, rv).is_none(),
                BadQuerySnafu {
                    reason: format!(
                        "duplicate series on the {one_side_name} ('one') side of the join"
                    ),
                }
            );
        }

        if self.cardinality == Cardinality::OneToOne {
            let mut seen = HashMap::new();
            for rv in &many {
                let key = join_key(&rv.key, &self.on, &self.ignoring);
                ensure!(
                    seen.insert(key, ()).is_none(),
                    BadQuerySnafu {
                        reason: "duplicate series on the left side of a one-to-one join"
                            .to_string(),
                    }
                );
            }
        }

        let swap = self.cardinality == Cardinality::OneToMany;
        let mut out = Vec::new();
        for many_rv in &many {
            session.check_deadline()?;
            let key = join_key(&many_rv.key, &self.on, &self.ignoring);
            let Some(one_rv) = one_map.get(&key) else {
                continue;
            };
            let many_rows = rows_by_ts(&many_rv.rows)?;
            let one_rows = rows_by_ts(&one_rv.rows)?;

            let mut rows = Vec::new();
            for (ts, many_v) in &many_rows {
                let Some(one_v) = one_rows.get(ts) else {
                    continue;
                };
                // lhs op rhs, regardless of which side is the "many" side
                let v = if swap {
                    self.op.apply(*one_v, *many_v)
                } else {
                    self.op.apply(*many_v, *one_v)
                };
                rows.push((*ts, v));
            }
            out.push(RangeVector::doubles(
                self.result_key(&one_rv.key, &many_rv.key),
                rows,
            ));
        }

        Ok(ExecResult::from_vectors(schema, out))
    }
}

/// AND / OR / UNLESS between two vector streams, joined on label keys.
#[derive(Debug)]
pub struct SetOperatorExec {
    lhs: Arc<dyn ExecPlan>,
    rhs: Arc<dyn ExecPlan>,
    op: SetOperator,
    on: Vec<String>,
    ignoring: Vec<String>,
    dispatcher: Arc<dyn PlanDispatcher>,
    transformers: Vec<Arc<dyn RangeVectorTransformer>>,
}

impl SetOperatorExec {
    /// Build a set-operator node.
    pub fn new(
        lhs: Arc<dyn ExecPlan>,
        rhs: Arc<dyn ExecPlan>,
        op: SetOperator,
        on: Vec<String>,
        ignoring: Vec<String>,
    ) -> Self {
        let children = [Arc::clone(&lhs), Arc::clone(&rhs)];
        let dispatcher = pick_dispatcher(&children);
        Self {
            lhs,
            rhs,
            op,
            on,
            ignoring,
            dispatcher,
            transformers: vec![],
        }
    }

    /// Attach a transformer stage.
    pub fn add_range_vector_transformer(&mut self, t: Arc<dyn RangeVectorTransformer>) {
        self.transformers.push(t);
    }
}

/// Merge rows of two vectors with identical full label sets: lhs rows win,
/// rhs rows fill timestamps lhs does not cover.
fn stitch(lhs: &RowData, rhs: &RowData) -> RowData {
    match (lhs, rhs) {
        (RowData::Doubles(a), RowData::Doubles(b)) => {
            let mut merged: BTreeMap<i64, f64> = b.iter().copied().collect();
            for (ts, v) in a {
                merged.insert(*ts, *v);
            }
            RowData::Doubles(merged.into_iter().collect())
        }
        _ => lhs.clone(),
    }
}

#[async_trait]
impl ExecPlan for SetOperatorExec {
    fn name(&self) -> &'static str {
        "SetOperatorExec"
    }

    fn children(&self) -> Vec<Arc<dyn ExecPlan>> {
        vec![Arc::clone(&self.lhs), Arc::clone(&self.rhs)]
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
        let lhs = self
            .lhs
            .dispatcher()
            .dispatch(&self.lhs, store, session)
            .await?;
        let rhs = self
            .rhs
            .dispatcher()
            .dispatch(&self.rhs, store, session)
            .await?;
        let (schema, lhs_vectors) = lhs.collect().await?;
        let (_, rhs_vectors) = rhs.collect().await?;

        let rhs_keys: HashMap<RangeVectorKey, &RangeVector> = rhs_vectors
            .iter()
            .map(|rv| (join_key(&rv.key, &self.on, &self.ignoring), rv))
            .collect();
        let lhs_keys: HashMap<RangeVectorKey, &RangeVector> = lhs_vectors
            .iter()
            .map(|rv| (join_key(&rv.key, &self.on, &self.ignoring), rv))
            .collect();

        let out = match self.op {
            SetOperator::And => lhs_vectors
                .iter()
                .filter_map(|rv| {
                    let key = join_key(&rv.key, &self.on, &self.ignoring);
                    let rhs_rv = rhs_keys.get(&key)?;
                    let rhs_rows: BTreeMap<i64, f64> = match &rhs_rv.rows {
                        RowData::Doubles(rows) => rows.iter().copied().collect(),
                        RowData::Histograms(rows) => {
                            rows.iter().map(|(t, h)| (*t, h.total() as f64)).collect()
                        }
                    };
                    let rows = match &rv.rows {
                        RowData::Doubles(rows) => rows
                            .iter()
                            .map(|(ts, v)| {
                                // mask where rhs is missing or NaN
                                match rhs_rows.get(ts) {
                                    Some(r) if !r.is_nan() => (*ts, *v),
                                    _ => (*ts, f64::NAN),
                                }
                            })
                            .collect(),
                        RowData::Histograms(_) => return Some(rv.clone()),
                    };
                    Some(RangeVector::doubles(rv.key.clone(), rows))
                })
                .collect::<Vec<_>>(),

            SetOperator::Or => {
                let mut out = Vec::new();
                let full_lhs: HashMap<&RangeVectorKey, &RangeVector> =
                    lhs_vectors.iter().map(|rv| (&rv.key, rv)).collect();
                for rv in &lhs_vectors {
                    // stitch in rhs rows when the full label sets coincide
                    let stitched = rhs_vectors
                        .iter()
                        .find(|r| r.key == rv.key)
                        .map(|r| stitch(&rv.rows, &r.rows))
                        .unwrap_or_else(|| rv.rows.clone());
                    out.push(RangeVector {
                        key: rv.key.clone(),
                        rows: stitched,
                    });
                }
                for rv in &rhs_vectors {
                    let key = join_key(&rv.key, &self.on, &self.ignoring);
                    if !lhs_keys.contains_key(&key) && !full_lhs.contains_key(&rv.key) {
                        out.push(rv.clone());
                    }
                }
                out
            }

            SetOperator::Unless => lhs_vectors
                .iter()
                .filter(|rv| {
                    let key = join_key(&rv.key, &self.on, &self.ignoring);
                    !rhs_keys.contains_key(&key)
                })
                .cloned()
                .collect(),
        };

        Ok(ExecResult::from_vectors(schema, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::run_plan;
    use crate::ResultSchema;

    /// A fixed-output plan node for join tests.
    #[derive(Debug)]
    struct FixedExec {
        vectors: Vec<RangeVector>,
    }

    #[async_trait]
    impl ExecPlan for FixedExec {
        fn name(&self) -> &'static str {
            "FixedExec"
        }

        fn dispatcher(&self) -> Arc<dyn PlanDispatcher> {
            Arc::new(crate::exec::InProcessPlanDispatcher)
        }

        async fn do_execute(
            &self,
            _store: &Arc<TimeSeriesMemStore>,
            _session: &QuerySession,
        ) -> Result<ExecResult> {
            Ok(ExecResult::from_vectors(
                ResultSchema::time_series(),
                self.vectors.clone(),
            ))
        }
    }

    fn fixed(vectors: Vec<RangeVector>) -> Arc<dyn ExecPlan> {
        Arc::new(FixedExec { vectors })
    }

    fn series(labels: &[(&str, &str)], rows: &[(i64, f64)]) -> RangeVector {
        RangeVector::doubles(
            RangeVectorKey::from_labels(labels.iter().copied()),
            rows.to_vec(),
        )
    }

    async fn store() -> Arc<TimeSeriesMemStore> {
        use chunk_store::MemColumnStore;
        let backend = Arc::new(MemColumnStore::new());
        Arc::new(TimeSeriesMemStore::new(
            backend,
            None,
            Arc::new(prism_time::SystemProvider::new()),
        ))
    }

    async fn run(plan: Arc<dyn ExecPlan>) -> Vec<RangeVector> {
        let session = QuerySession::new(&Default::default(), &Default::default());
        let result = run_plan(&plan, &store().await, &session).await.unwrap();
        let (_, vectors) = result.collect().await.unwrap();
        vectors
    }

    #[tokio::test]
    async fn test_one_to_one_join() {
        // scenario C: lhs + rhs with equal keys
        let lhs = fixed(vec![series(
            &[("a", "1"), ("job", "x")],
            &[(10, 1.0), (20, 2.0), (30, 3.0)],
        )]);
        let rhs = fixed(vec![series(
            &[("a", "1"), ("job", "x")],
            &[(10, 10.0), (20, 20.0), (30, 30.0)],
        )]);
        let join = Arc::new(BinaryJoinExec::new(
            lhs,
            rhs,
            BinaryOperator::Add,
            Cardinality::OneToOne,
            vec![],
            vec![],
            vec![],
        )) as Arc<dyn ExecPlan>;

        let out = run(join).await;
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].key,
            RangeVectorKey::from_labels([("a", "1"), ("job", "x")])
        );
        assert_eq!(
            out[0].rows.as_doubles().unwrap(),
            &[(10, 11.0), (20, 22.0), (30, 33.0)]
        );
    }

    #[tokio::test]
    async fn test_one_to_one_rejects_duplicates() {
        let lhs = fixed(vec![
            series(&[("a", "1"), ("b", "1")], &[(10, 1.0)]),
            series(&[("a", "1"), ("b", "2")], &[(10, 2.0)]),
        ]);
        let rhs = fixed(vec![series(&[("a", "1")], &[(10, 5.0)])]);
        let join = Arc::new(BinaryJoinExec::new(
            lhs,
            rhs,
            BinaryOperator::Add,
            Cardinality::OneToOne,
            vec!["a".into()],
            vec![],
            vec![],
        )) as Arc<dyn ExecPlan>;

        let session = QuerySession::new(&Default::default(), &Default::default());
        let err = run_plan(&join, &store().await, &session)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::QueryError::BadQuery { .. }));
    }

    #[tokio::test]
    async fn test_many_to_one_includes_labels() {
        let lhs = fixed(vec![
            series(&[("a", "1"), ("inst", "i1")], &[(10, 1.0)]),
            series(&[("a", "1"), ("inst", "i2")], &[(10, 2.0)]),
        ]);
        let rhs = fixed(vec![series(&[("a", "1"), ("role", "db")], &[(10, 10.0)])]);
        let join = Arc::new(BinaryJoinExec::new(
            lhs,
            rhs,
            BinaryOperator::Mul,
            Cardinality::ManyToOne,
            vec!["a".into()],
            vec![],
            vec!["role".into()],
        )) as Arc<dyn ExecPlan>;

        let mut out = run(join).await;
        out.sort_by(|x, y| x.key.cmp(&y.key));
        assert_eq!(out.len(), 2);
        // join key projected to `on`, plus the included label
        assert_eq!(out[0].key.get("role"), Some("db"));
        assert_eq!(out[0].rows.as_doubles().unwrap(), &[(10, 10.0)]);
        assert_eq!(out[1].rows.as_doubles().unwrap(), &[(10, 20.0)]);
    }

    #[tokio::test]
    async fn test_and_with_empty_lhs() {
        // scenario D: empty lhs
        let lhs = fixed(vec![]);
        let rhs = fixed(vec![series(&[("a", "1")], &[(10, 1.0)])]);
        let and = Arc::new(SetOperatorExec::new(
            Arc::clone(&lhs),
            Arc::clone(&rhs),
            SetOperator::And,
            vec![],
            vec![],
        )) as Arc<dyn ExecPlan>;
        assert!(run(and).await.is_empty());

        let or = Arc::new(SetOperatorExec::new(
            lhs,
            rhs,
            SetOperator::Or,
            vec![],
            vec![],
        )) as Arc<dyn ExecPlan>;
        let out = run(or).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, RangeVectorKey::from_labels([("a", "1")]));
    }

    #[tokio::test]
    async fn test_and_masks_nan() {
        let lhs = fixed(vec![series(&[("a", "1")], &[(10, 1.0), (20, 2.0)])]);
        let rhs = fixed(vec![series(&[("a", "1")], &[(10, f64::NAN)])]);
        let and = Arc::new(SetOperatorExec::new(
            lhs,
            rhs,
            SetOperator::And,
            vec![],
            vec![],
        )) as Arc<dyn ExecPlan>;

        let out = run(and).await;
        let rows = out[0].rows.as_doubles().unwrap();
        assert!(rows[0].1.is_nan());
        assert!(rows[1].1.is_nan());
    }

    #[tokio::test]
    async fn test_unless_removes_matches() {
        let lhs = fixed(vec![
            series(&[("a", "1")], &[(10, 1.0)]),
            series(&[("a", "2")], &[(10, 2.0)]),
        ]);
        let rhs = fixed(vec![series(&[("a", "1")], &[(10, 9.0)])]);
        let unless = Arc::new(SetOperatorExec::new(
            lhs,
            rhs,
            SetOperator::Unless,
            vec![],
            vec![],
        )) as Arc<dyn ExecPlan>;

        let out = run(unless).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, RangeVectorKey::from_labels([("a", "2")]));
    }

    #[tokio::test]
    async fn test_or_stitches_identical_keys() {
        let lhs = fixed(vec![series(&[("a", "1")], &[(10, 1.0), (30, 3.0)])]);
        let rhs = fixed(vec![series(&[("a", "1")], &[(10, 9.0), (20, 2.0)])]);
        let or = Arc::new(SetOperatorExec::new(
            lhs,
            rhs,
            SetOperator::Or,
            vec![],
            vec![],
        )) as Arc<dyn ExecPlan>;

        let out = run(or).await;
        assert_eq!(out.len(), 1);
        // lhs wins at 10, rhs fills 20
        assert_eq!(
            out[0].rows.as_doubles().unwrap(),
            &[(10, 1.0), (20, 2.0), (30, 3.0)]
        );
    }

    #[tokio::test]
    async fn test_comparison_join_filters() {
        let lhs = fixed(vec![series(&[("a", "1")], &[(10, 5.0), (20, 1.0)])]);
        let rhs = fixed(vec![series(&[("a", "1")], &[(10, 3.0), (20, 3.0)])]);
        let join = Arc::new(BinaryJoinExec::new(
            lhs,
            rhs,
            BinaryOperator::Gt,
            Cardinality::OneToOne,
            vec![],
            vec![],
            vec![],
        )) as Arc<dyn ExecPlan>;

        let out = run(join).await;
        let rows = out[0].rows.as_doubles().unwrap();
        assert_eq!(rows[0], (10, 5.0));
        assert!(rows[1].1.is_nan());
    }
}
