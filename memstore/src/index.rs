//! Inverted index from label pairs to partition-id bitmaps.
//!
//! Postings are roaring bitmaps keyed by interned `(name, value)` pairs.
//! Additions accumulate in a pending buffer and become searchable only at
//! explicit [`PartKeyIndex::commit`] points; queries run against the
//! copy-on-write snapshot taken at query start and may observe a slightly
//! stale index between commits.

use crate::{BadRegexSnafu, Result};
use croaring::Bitmap;
use data_types::{ColumnFilter, FilterOp, PartitionId};
use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// An immutable, committed view of the index.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    postings: HashMap<(Arc<str>, Arc<str>), Bitmap>,
    values_by_label: BTreeMap<Arc<str>, Vec<Arc<str>>>,
    all: Bitmap,
}

impl IndexSnapshot {
    /// Every committed partition id.
    pub fn all(&self) -> &Bitmap {
        &self.all
    }

    /// The committed values of one label, sorted.
    pub fn label_values(&self, label: &str) -> Vec<String> {
        self.values_by_label
            .get(label)
            .map(|vs| vs.iter().map(|v| v.to_string()).collect())
            .unwrap_or_default()
    }

    fn postings_for(&self, label: &str, value: &str) -> Bitmap {
        self.postings
            .get(&(Arc::from(label), Arc::from(value)))
            .cloned()
            .unwrap_or_else(Bitmap::create)
    }

    fn postings_matching(&self, label: &str, pattern: &regex::Regex) -> Bitmap {
        let mut out = Bitmap::create();
        if let Some(values) = self.values_by_label.get(label) {
            for value in values {
                if pattern.is_match(value) {
                    out.or_inplace(&self.postings_for(label, value));
                }
            }
        }
        out
    }

    /// Resolve filters to the matching partition ids (AND across filters).
    pub fn resolve(&self, filters: &[ColumnFilter]) -> Result<Bitmap> {
        let mut result = self.all.clone();
        for filter in filters {
            let matching = match &filter.op {
                FilterOp::Equals(v) => self.postings_for(&filter.column, v),
                FilterOp::NotEquals(v) => {
                    let mut keep = self.all.clone();
                    keep.andnot_inplace(&self.postings_for(&filter.column, v));
                    keep
                }
                FilterOp::In(vs) => {
                    let mut keep = Bitmap::create();
                    for v in vs {
                        keep.or_inplace(&self.postings_for(&filter.column, v));
                    }
                    keep
                }
                FilterOp::EqualsRegex(pattern) => {
                    let re = compile_anchored(pattern)?;
                    self.postings_matching(&filter.column, &re)
                }
                FilterOp::NotEqualsRegex(pattern) => {
                    let re = compile_anchored(pattern)?;
                    let mut keep = self.all.clone();
                    keep.andnot_inplace(&self.postings_matching(&filter.column, &re));
                    keep
                }
            };
            result.and_inplace(&matching);
            if result.is_empty() {
                break;
            }
        }
        Ok(result)
    }
}

fn compile_anchored(pattern: &str) -> Result<regex::Regex> {
    regex::Regex::new(&format!("^(?:{pattern})$")).context(BadRegexSnafu { pattern })
}

/// The shard's label index with explicit commit points.
#[derive(Debug, Default)]
pub struct PartKeyIndex {
    committed: RwLock<Arc<IndexSnapshot>>,
    pending: Mutex<Vec<(PartitionId, Vec<(String, String)>)>>,
    interned: Mutex<HashSet<Arc<str>>>,
}

impl PartKeyIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a new partition's labels. Not searchable until
    /// [`PartKeyIndex::commit`].
    pub fn add_partition(&self, id: PartitionId, labels: Vec<(String, String)>) {
        self.pending.lock().push((id, labels));
    }

    /// Publish all pending additions as a new snapshot.
    pub fn commit(&self) {
        let pending: Vec<_> = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return;
        }

        let mut interned = self.interned.lock();
        let mut intern = |s: &str| -> Arc<str> {
            if let Some(v) = interned.get(s) {
                return Arc::clone(v);
            }
            let v: Arc<str> = Arc::from(s);
            interned.insert(Arc::clone(&v));
            v
        };

        let old = Arc::clone(&*self.committed.read());
        let mut postings = old.postings.clone();
        let mut all = old.all.clone();
        for (id, labels) in pending {
            all.add(id.get());
            for (name, value) in labels {
                postings
                    .entry((intern(&name), intern(&value)))
                    .or_insert_with(Bitmap::create)
                    .add(id.get());
            }
        }

        let mut values_by_label: BTreeMap<Arc<str>, Vec<Arc<str>>> = BTreeMap::new();
        for (name, value) in postings.keys() {
            values_by_label
                .entry(Arc::clone(name))
                .or_default()
                .push(Arc::clone(value));
        }
        for values in values_by_label.values_mut() {
            values.sort();
        }

        *self.committed.write() = Arc::new(IndexSnapshot {
            postings,
            values_by_label,
            all,
        });
    }

    /// The current committed snapshot. Queries hold one for their whole
    /// run.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&*self.committed.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use data_types::FilterOp;

    fn index_with(entries: &[(u32, &[(&str, &str)])]) -> PartKeyIndex {
        let index = PartKeyIndex::new();
        for (id, labels) in entries {
            index.add_partition(
                PartitionId::new(*id),
                labels
                    .iter()
                    .map(|(n, v)| (n.to_string(), v.to_string()))
                    .collect(),
            );
        }
        index.commit();
        index
    }

    fn ids(bitmap: &Bitmap) -> Vec<u32> {
        bitmap.iter().collect()
    }

    #[test]
    fn test_equals_and_not_equals() {
        let index = index_with(&[
            (1, &[("app", "x"), ("dc", "eu")]),
            (2, &[("app", "x"), ("dc", "us")]),
            (3, &[("app", "y"), ("dc", "eu")]),
        ]);
        let snap = index.snapshot();

        let hits = snap.resolve(&[ColumnFilter::equals("app", "x")]).unwrap();
        assert_eq!(ids(&hits), vec![1, 2]);

        let hits = snap
            .resolve(&[
                ColumnFilter::equals("app", "x"),
                ColumnFilter::new("dc", FilterOp::NotEquals("us".into())),
            ])
            .unwrap();
        assert_eq!(ids(&hits), vec![1]);

        let hits = snap.resolve(&[ColumnFilter::equals("app", "nope")]).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_regex_filters_are_anchored() {
        let index = index_with(&[
            (1, &[("job", "api")]),
            (2, &[("job", "api-canary")]),
            (3, &[("job", "worker")]),
        ]);
        let snap = index.snapshot();

        // unanchored "api" would match "api-canary" too
        let hits = snap
            .resolve(&[ColumnFilter::new("job", FilterOp::EqualsRegex("api".into()))])
            .unwrap();
        assert_eq!(ids(&hits), vec![1]);

        let hits = snap
            .resolve(&[ColumnFilter::new(
                "job",
                FilterOp::EqualsRegex("api.*".into()),
            )])
            .unwrap();
        assert_eq!(ids(&hits), vec![1, 2]);

        let hits = snap
            .resolve(&[ColumnFilter::new(
                "job",
                FilterOp::NotEqualsRegex("api.*".into()),
            )])
            .unwrap();
        assert_eq!(ids(&hits), vec![3]);
    }

    #[test]
    fn test_bad_regex_surfaces() {
        let index = index_with(&[(1, &[("job", "api")])]);
        let snap = index.snapshot();
        assert_matches!(
            snap.resolve(&[ColumnFilter::new(
                "job",
                FilterOp::EqualsRegex("(".into()),
            )]),
            Err(crate::Error::BadRegex { .. })
        );
    }

    #[test]
    fn test_in_filter() {
        let index = index_with(&[
            (1, &[("dc", "eu")]),
            (2, &[("dc", "us")]),
            (3, &[("dc", "ap")]),
        ]);
        let snap = index.snapshot();
        let hits = snap
            .resolve(&[ColumnFilter::new(
                "dc",
                FilterOp::In(vec!["eu".into(), "ap".into()]),
            )])
            .unwrap();
        assert_eq!(ids(&hits), vec![1, 3]);
    }

    #[test]
    fn test_additions_invisible_until_commit() {
        let index = index_with(&[(1, &[("app", "x")])]);
        index.add_partition(PartitionId::new(2), vec![("app".into(), "x".into())]);

        // a snapshot taken now sees only the committed partition
        let snap = index.snapshot();
        let hits = snap.resolve(&[ColumnFilter::equals("app", "x")]).unwrap();
        assert_eq!(ids(&hits), vec![1]);

        index.commit();
        let hits = index
            .snapshot()
            .resolve(&[ColumnFilter::equals("app", "x")])
            .unwrap();
        assert_eq!(ids(&hits), vec![1, 2]);

        // the old snapshot is unchanged
        let hits = snap.resolve(&[ColumnFilter::equals("app", "x")]).unwrap();
        assert_eq!(ids(&hits), vec![1]);
    }

    #[test]
    fn test_label_values() {
        let index = index_with(&[
            (1, &[("dc", "us")]),
            (2, &[("dc", "eu")]),
            (3, &[("app", "x")]),
        ]);
        let snap = index.snapshot();
        assert_eq!(snap.label_values("dc"), vec!["eu", "us"]);
        assert!(snap.label_values("nope").is_empty());
    }
}
