use crate::types::{Cluster, ClusterList, ClusterName};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// A change in fleet membership, shaped after a Kubernetes watch stream.
#[derive(Clone, Debug, PartialEq)]
pub enum ClusterEvent {
    /// The cluster was created or updated.
    Applied(Cluster),
    Deleted(ClusterName),
    /// A full listing that replaces everything previously seen.
    Restarted(Vec<Cluster>),
}

impl ClusterEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::Applied(_) => "applied",
            ClusterEvent::Deleted(_) => "deleted",
            ClusterEvent::Restarted(_) => "restarted",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FeedError {
    #[error("could not read cluster list from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse cluster list: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("cluster registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid cluster registry URL: {0}")]
    InvalidUrl(String),
    #[error("cluster registry answered with unexpected status {0}")]
    UnexpectedStatus(reqwest::StatusCode),
    #[error("cluster registry unavailable after retries")]
    RetriesExceeded,
}

/// Source of cluster membership events.
///
/// `Ok(None)` means the feed has ended and no further events will arrive.
#[async_trait]
pub trait ClusterFeed: Send {
    async fn next_event(&mut self) -> Result<Option<ClusterEvent>, FeedError>;
}

/// Reads a `ClusterList` document (YAML or JSON) and re-reads it every resync period.
pub struct FileClusterFeed {
    path: PathBuf,
    resync_period: Duration,
    loaded: bool,
}

impl FileClusterFeed {
    pub fn new<P>(path: P, resync_period: Duration) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            path: path.into(),
            resync_period,
            loaded: false,
        }
    }

    async fn load(&self) -> Result<Vec<Cluster>, FeedError> {
        let doc = tokio::fs::read(&self.path)
            .await
            .map_err(|source| FeedError::Read {
                path: self.path.clone(),
                source,
            })?;
        let list: ClusterList = serde_yaml::from_slice(&doc)?;
        Ok(list.items)
    }
}

#[async_trait]
impl ClusterFeed for FileClusterFeed {
    async fn next_event(&mut self) -> Result<Option<ClusterEvent>, FeedError> {
        if self.loaded {
            tokio::time::sleep(self.resync_period).await;
        }
        // Only mark as loaded on success so a broken file is retried promptly.
        let clusters = self.load().await?;
        self.loaded = true;
        Ok(Some(ClusterEvent::Restarted(clusters)))
    }
}

/// Feed driven by an in-process channel, for embedders that already run a watch.
pub struct ChannelFeed {
    rx: mpsc::Receiver<ClusterEvent>,
}

impl ChannelFeed {
    pub fn new(buffer: usize) -> (mpsc::Sender<ClusterEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl ClusterFeed for ChannelFeed {
    async fn next_event(&mut self) -> Result<Option<ClusterEvent>, FeedError> {
        Ok(self.rx.recv().await)
    }
}
