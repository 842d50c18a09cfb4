//! Label-indexed cache of fleet membership.
//!
//! A single writer (the sync worker) applies [`ClusterEvent`]s; any number of request
//! handlers read concurrently. Reads never touch the network.

use crate::feed::ClusterEvent;
use crate::metrics_defs::{INDEXED_CLUSTERS, REGISTRY_EVENTS};
use crate::types::{Cluster, ClusterName};
use parking_lot::RwLock;
use shared::{counter, gauge};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum IndexError {
    #[error("the cluster index has not completed its initial sync")]
    NotSynced,
}

/// Extracts the single value a cluster is indexed under.
///
/// Clusters without the label are left out of the index entirely; that is how a
/// cluster signals it does not belong to this fleet.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelIndex {
    label: String,
}

impl LabelIndex {
    pub fn new<L>(label: L) -> Self
    where
        L: Into<String>,
    {
        Self {
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn index_value<'a>(&self, cluster: &'a Cluster) -> Option<&'a str> {
        cluster.label(&self.label)
    }
}

#[derive(Default)]
struct IndexData {
    /// Every known cluster and the index value it was filed under, if any.
    by_name: HashMap<ClusterName, (Arc<Cluster>, Option<String>)>,
    /// Index value -> clusters, ordered by name so enumeration is stable.
    by_value: HashMap<String, BTreeMap<ClusterName, Arc<Cluster>>>,
}

impl IndexData {
    fn insert(&mut self, indexer: &LabelIndex, cluster: Cluster) {
        self.remove(cluster.name());

        let name = cluster.name().to_string();
        let value = indexer.index_value(&cluster).map(str::to_string);
        let cluster = Arc::new(cluster);

        if let Some(value) = &value {
            self.by_value
                .entry(value.clone())
                .or_default()
                .insert(name.clone(), cluster.clone());
        }
        self.by_name.insert(name, (cluster, value));
    }

    fn remove(&mut self, name: &str) {
        let Some((_, Some(value))) = self.by_name.remove(name) else {
            return;
        };

        if let Some(bucket) = self.by_value.get_mut(&value) {
            bucket.remove(name);
            if bucket.is_empty() {
                self.by_value.remove(&value);
            }
        }
    }

    fn indexed_count(&self) -> usize {
        self.by_value.values().map(BTreeMap::len).sum()
    }
}

pub struct ClusterIndex {
    indexer: LabelIndex,
    data: RwLock<IndexData>,
    // Flips to true on the first full listing and never goes back.
    synced: watch::Sender<bool>,
}

impl ClusterIndex {
    pub fn new(indexer: LabelIndex) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            indexer,
            data: RwLock::new(IndexData::default()),
            synced,
        }
    }

    pub fn indexer(&self) -> &LabelIndex {
        &self.indexer
    }

    pub fn apply(&self, event: ClusterEvent) {
        let kind = event.kind();
        let mut data = self.data.write();

        match event {
            ClusterEvent::Applied(cluster) => {
                tracing::debug!(cluster = %cluster.name(), "Cluster applied");
                data.insert(&self.indexer, cluster);
            }
            ClusterEvent::Deleted(name) => {
                tracing::debug!(cluster = %name, "Cluster deleted");
                data.remove(&name);
            }
            ClusterEvent::Restarted(clusters) => {
                let mut fresh = IndexData::default();
                for cluster in clusters {
                    fresh.insert(&self.indexer, cluster);
                }
                *data = fresh;
                tracing::info!(
                    clusters = data.by_name.len(),
                    indexed = data.indexed_count(),
                    "Cluster index resynced"
                );
            }
        }

        let indexed = data.indexed_count();
        drop(data);

        counter!(REGISTRY_EVENTS, "kind" => kind).increment(1);
        gauge!(INDEXED_CLUSTERS).set(indexed as f64);

        if kind == "restarted" {
            self.synced.send_if_modified(|synced| !std::mem::replace(synced, true));
        }
    }

    /// Clusters filed under `value`, ordered by name.
    pub fn by_index(&self, value: &str) -> Result<Vec<Arc<Cluster>>, IndexError> {
        if !self.is_synced() {
            return Err(IndexError::NotSynced);
        }

        let data = self.data.read();
        Ok(data
            .by_value
            .get(value)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.data.read().by_name.get(name).map(|(c, _)| c.clone())
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the first full listing has been applied.
    pub async fn wait_until_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as `self`, so this can only fail if it was dropped.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}
