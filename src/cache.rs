//! In-memory object cache with secondary indexes and event delivery
//!
//! [`ClusterStore`] is the read side the controllers are built on: a map of
//! objects keyed by `{cluster}|{name}`, with named secondary indexes and
//! synchronous add/update/delete notifications. Controllers register indexes
//! and event handlers at construction and only ever read; writes come from
//! the environment that keeps the cache in sync with upstream storage, so
//! the view may lag slightly behind reality and consumers must tolerate
//! stale reads.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::RwLock;

use crate::cluster::{logical_cluster_from, LogicalClusterName};
use crate::error::{Error, Result};

/// An object that can live in a [`ClusterStore`].
pub trait StoreObject: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    fn logical_cluster(&self) -> LogicalClusterName {
        logical_cluster_from(self.metadata())
    }
}

/// Cache key of an object: `{cluster}|{name}`.
pub fn to_cluster_aware_key(cluster: &LogicalClusterName, name: &str) -> String {
    format!("{cluster}|{name}")
}

/// Splits a `{cluster}|{name}` key produced by [`to_cluster_aware_key`].
pub fn split_cluster_aware_key(key: &str) -> Result<(LogicalClusterName, String)> {
    match key.split_once('|') {
        Some((cluster, name)) if !name.is_empty() => {
            Ok((LogicalClusterName::new(cluster), name.to_string()))
        }
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

pub fn object_key<T: StoreObject>(obj: &T) -> String {
    to_cluster_aware_key(&obj.logical_cluster(), obj.name())
}

/// A change observed on the cache.
///
/// `final_state_unknown` marks a deletion the cache only learned about
/// indirectly (e.g. during a resync); `obj` is then the last state the cache
/// ever saw, not necessarily the state at deletion time.
pub enum Event<T> {
    Added(Arc<T>),
    Updated { old: Arc<T>, new: Arc<T> },
    Deleted { obj: Arc<T>, final_state_unknown: bool },
}

impl<T> Event<T> {
    /// The object the event is about, regardless of variant.
    pub fn object(&self) -> &Arc<T> {
        match self {
            Event::Added(obj) => obj,
            Event::Updated { new, .. } => new,
            Event::Deleted { obj, .. } => obj,
        }
    }
}

pub type EventHandler<T> = Box<dyn Fn(&Event<T>) + Send + Sync>;
pub type IndexFn<T> = Box<dyn Fn(&T) -> Vec<String> + Send + Sync>;

pub struct ClusterStore<T: StoreObject> {
    inner: RwLock<Inner<T>>,
    handlers: RwLock<Vec<EventHandler<T>>>,
}

struct Inner<T> {
    objects: HashMap<String, Arc<T>>,
    indexers: HashMap<&'static str, IndexFn<T>>,
    // index name -> index value -> object keys
    indices: HashMap<&'static str, HashMap<String, BTreeSet<String>>>,
}

impl<T: StoreObject> Default for ClusterStore<T> {
    fn default() -> Self {
        ClusterStore {
            inner: RwLock::new(Inner {
                objects: HashMap::new(),
                indexers: HashMap::new(),
                indices: HashMap::new(),
            }),
            handlers: RwLock::new(Vec::new()),
        }
    }
}

impl<T: StoreObject> ClusterStore<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a named index. A no-op when an index of that name already
    /// exists; existing objects are back-filled.
    pub fn add_indexer(&self, name: &'static str, index_fn: IndexFn<T>) {
        let mut inner = self.inner.write();
        if inner.indexers.contains_key(name) {
            return;
        }
        let mut postings: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (key, obj) in &inner.objects {
            for value in index_fn(obj) {
                postings.entry(value).or_default().insert(key.clone());
            }
        }
        inner.indexers.insert(name, index_fn);
        inner.indices.insert(name, postings);
    }

    /// Registers an event handler invoked synchronously on every change.
    pub fn add_event_handler(&self, handler: EventHandler<T>) {
        self.handlers.write().push(handler);
    }

    /// Inserts or replaces an object, reindexes it, and delivers an
    /// add/update event.
    pub fn apply(&self, obj: T) {
        let obj = Arc::new(obj);
        let key = object_key(obj.as_ref());
        let old = {
            let mut inner = self.inner.write();
            let old = inner.objects.insert(key.clone(), Arc::clone(&obj));
            if let Some(old) = &old {
                inner.unindex(&key, old);
            }
            inner.index(&key, obj.as_ref());
            old
        };
        let event = match old {
            Some(old) => Event::Updated {
                old,
                new: Arc::clone(&obj),
            },
            None => Event::Added(Arc::clone(&obj)),
        };
        self.dispatch(&event);
    }

    /// Removes an object and delivers a delete event. Returns the removed
    /// object, if any.
    pub fn delete(&self, cluster: &LogicalClusterName, name: &str) -> Option<Arc<T>> {
        self.remove(cluster, name, false)
    }

    /// Removes an object whose deletion was only observed indirectly; the
    /// delivered event carries `final_state_unknown`.
    pub fn delete_final_state_unknown(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
    ) -> Option<Arc<T>> {
        self.remove(cluster, name, true)
    }

    fn remove(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
        final_state_unknown: bool,
    ) -> Option<Arc<T>> {
        let key = to_cluster_aware_key(cluster, name);
        let old = {
            let mut inner = self.inner.write();
            let old = inner.objects.remove(&key)?;
            inner.unindex(&key, &old);
            old
        };
        self.dispatch(&Event::Deleted {
            obj: Arc::clone(&old),
            final_state_unknown,
        });
        Some(old)
    }

    pub fn get(&self, cluster: &LogicalClusterName, name: &str) -> Result<Arc<T>> {
        let key = to_cluster_aware_key(cluster, name);
        self.inner
            .read()
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(T::KIND, key))
    }

    pub fn list(&self) -> Vec<Arc<T>> {
        let mut objects: Vec<_> = self.inner.read().objects.values().cloned().collect();
        objects.sort_by(|a, b| object_key(a.as_ref()).cmp(&object_key(b.as_ref())));
        objects
    }

    pub fn list_cluster(&self, cluster: &LogicalClusterName) -> Vec<Arc<T>> {
        self.list()
            .into_iter()
            .filter(|obj| obj.logical_cluster() == *cluster)
            .collect()
    }

    /// Objects whose index `name` contains `value`, in key order.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<T>>> {
        let inner = self.inner.read();
        let postings = inner
            .indices
            .get(name)
            .ok_or_else(|| Error::Internal(format!("index {name:?} does not exist")))?;
        let keys = match postings.get(value) {
            Some(keys) => keys,
            None => return Ok(Vec::new()),
        };
        Ok(keys
            .iter()
            .filter_map(|key| inner.objects.get(key).cloned())
            .collect())
    }

    /// Cache keys of the objects indexed under `value`, in order.
    pub fn index_keys(&self, name: &str, value: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let postings = inner
            .indices
            .get(name)
            .ok_or_else(|| Error::Internal(format!("index {name:?} does not exist")))?;
        Ok(postings
            .get(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dispatch(&self, event: &Event<T>) {
        for handler in self.handlers.read().iter() {
            handler(event);
        }
    }
}

impl<T: StoreObject> Inner<T> {
    fn index(&mut self, key: &str, obj: &T) {
        for (&name, index_fn) in &self.indexers {
            let postings = self.indices.entry(name).or_default();
            for value in index_fn(obj) {
                postings.entry(value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str, obj: &T) {
        for (name, index_fn) in &self.indexers {
            if let Some(postings) = self.indices.get_mut(name) {
                for value in index_fn(obj) {
                    if let Some(keys) = postings.get_mut(&value) {
                        keys.remove(key);
                        if keys.is_empty() {
                            postings.remove(&value);
                        }
                    }
                }
            }
        }
    }
}
