//! Kestrel field indexer.
//!
//! Named extractors map a managed object to the values it references (a
//! secret name, an external name). Lookups answer "which objects reference
//! value X" from an ordered posting map. Writers publish a fresh snapshot;
//! readers never block.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::{Resource, ResourceExt};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::trace;

pub type Values = SmallVec<[String; 2]>;
pub type Extractor<K> = Arc<dyn Fn(&K) -> Values + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    epoch: u64,
    postings: BTreeMap<(String, String), BTreeSet<ObjectKey>>,
    entries: FxHashMap<ObjectKey, Vec<(String, String)>>,
}

impl Snapshot {
    fn drop_key(&mut self, key: &ObjectKey) {
        if let Some(old) = self.entries.remove(key) {
            for posting in old {
                let empty = match self.postings.get_mut(&posting) {
                    Some(set) => {
                        set.remove(key);
                        set.is_empty()
                    }
                    None => false,
                };
                if empty {
                    self.postings.remove(&posting);
                }
            }
        }
    }
}

/// Secondary index over objects of kind `K`.
pub struct FieldIndex<K> {
    extractors: Vec<(String, Extractor<K>)>,
    state: ArcSwap<Snapshot>,
}

impl<K: Resource> Default for FieldIndex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> FieldIndex<K> {
    pub fn new() -> Self {
        Self { extractors: Vec::new(), state: ArcSwap::from_pointee(Snapshot::default()) }
    }

    /// Add a named extractor. Empty values are never indexed.
    pub fn register<F>(mut self, index: impl Into<String>, f: F) -> Self
    where
        F: Fn(&K) -> Values + Send + Sync + 'static,
    {
        self.extractors.push((index.into(), Arc::new(f)));
        self
    }

    pub fn indexes(&self) -> impl Iterator<Item = &str> {
        self.extractors.iter().map(|(n, _)| n.as_str())
    }

    /// Run the named extractor without touching the index.
    pub fn extract(&self, index: &str, obj: &K) -> Values {
        self.extractors
            .iter()
            .filter(|(n, _)| n == index)
            .flat_map(|(_, f)| f(obj))
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Insert or refresh the postings of `obj`.
    pub fn upsert(&self, obj: &K) {
        let key = ObjectKey::of(obj);
        let mut fresh = Vec::new();
        for (index, f) in &self.extractors {
            for v in f(obj) {
                if !v.is_empty() {
                    fresh.push((index.clone(), v));
                }
            }
        }
        fresh.sort();
        fresh.dedup();
        self.state.rcu(|cur| {
            let mut next = (**cur).clone();
            next.drop_key(&key);
            for posting in &fresh {
                next.postings.entry(posting.clone()).or_default().insert(key.clone());
            }
            if !fresh.is_empty() {
                next.entries.insert(key.clone(), fresh.clone());
            }
            next.epoch = cur.epoch.saturating_add(1);
            next
        });
        trace!(key = %key, "index upsert");
    }

    pub fn remove(&self, key: &ObjectKey) {
        self.state.rcu(|cur| {
            let mut next = (**cur).clone();
            next.drop_key(key);
            next.epoch = cur.epoch.saturating_add(1);
            next
        });
    }

    /// All objects whose `index` extractor produced `value`.
    pub fn lookup(&self, index: &str, value: &str) -> Vec<ObjectKey> {
        let snap = self.state.load();
        snap.postings
            .get(&(index.to_string(), value.to_string()))
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Like [`lookup`](Self::lookup), restricted to one namespace.
    pub fn referencing(&self, index: &str, namespace: &str, value: &str) -> Vec<ObjectKey> {
        self.lookup(index, value).into_iter().filter(|k| k.namespace == namespace).collect()
    }

    /// Values currently indexed for one object.
    pub fn values(&self, index: &str, key: &ObjectKey) -> Vec<String> {
        let snap = self.state.load();
        snap.entries
            .get(key)
            .map(|e| e.iter().filter(|(i, _)| i == index).map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    pub fn epoch(&self) -> u64 {
        self.state.load().epoch
    }

    pub fn len(&self) -> usize {
        self.state.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
