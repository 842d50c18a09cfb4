pub mod config;
pub mod external;
pub mod feed;
pub mod index;
pub mod metrics_defs;
pub mod types;

use crate::config::Source;
use crate::external::ExternalRegistryFeed;
use crate::feed::{ClusterFeed, FeedError, FileClusterFeed};
use crate::index::{ClusterIndex, LabelIndex};
use crate::metrics_defs::FEED_ERRORS;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const BASE_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("could not set up cluster feed: {0}")]
    Feed(#[from] FeedError),
    #[error("cluster index did not sync within {0:?}")]
    SyncTimeout(Duration),
}

#[derive(Debug)]
enum Command {
    // Stop the sync worker. The index keeps its last contents.
    Shutdown,
}

struct RegistryInner {
    index: Arc<ClusterIndex>,
    #[allow(dead_code)]
    handle: tokio::task::JoinHandle<()>,
    tx: mpsc::Sender<Command>,
}

/// Owns the cluster index and the worker that keeps it in sync with a feed.
///
/// The worker stops when [`ClusterRegistry::shutdown`] is called or when the last
/// handle is dropped.
#[derive(Clone)]
pub struct ClusterRegistry {
    inner: Arc<RegistryInner>,
}

impl ClusterRegistry {
    /// Builds the feed described by `config` and starts syncing into a new index.
    pub fn from_config(config: &config::Config) -> Result<Self, RegistryError> {
        let feed: Box<dyn ClusterFeed> = match &config.source {
            Source::File {
                path,
                resync_period_secs,
            } => Box::new(FileClusterFeed::new(
                path.clone(),
                Duration::from_secs(*resync_period_secs),
            )),
            Source::External {
                url,
                namespace,
                resync_period_secs,
            } => Box::new(ExternalRegistryFeed::new(
                url,
                namespace,
                Duration::from_secs(*resync_period_secs),
            )?),
        };

        let index = ClusterIndex::new(LabelIndex::new(config.labels.tenancy_label.clone()));
        Ok(Self::spawn(feed, Arc::new(index)))
    }

    pub fn spawn(feed: Box<dyn ClusterFeed>, index: Arc<ClusterIndex>) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(8);

        let index_clone = index.clone();
        let handle = tokio::spawn(async move {
            run_sync(feed, index_clone, rx).await;
        });

        ClusterRegistry {
            inner: Arc::new(RegistryInner { index, handle, tx }),
        }
    }

    pub fn index(&self) -> Arc<ClusterIndex> {
        self.inner.index.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.index.is_synced()
    }

    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<(), RegistryError> {
        tokio::time::timeout(timeout, self.inner.index.wait_until_synced())
            .await
            .map_err(|_| RegistryError::SyncTimeout(timeout))
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.tx.send(Command::Shutdown).await;
    }
}

async fn run_sync(
    mut feed: Box<dyn ClusterFeed>,
    index: Arc<ClusterIndex>,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut failures: u32 = 0;

    loop {
        // Backoff happens inside the sync step so a shutdown can cut it short.
        tokio::select! {
            cmd = rx.recv() => {
                // A closed channel means every registry handle is gone.
                tracing::info!(command = ?cmd, "Stopping cluster sync");
                return;
            }
            keep_going = sync_step(feed.as_mut(), &index, &mut failures) => {
                if !keep_going {
                    return;
                }
            }
        }
    }
}

// Applies the next feed event, or waits out the retry delay after a failure.
// Returns false once the feed has ended.
async fn sync_step(
    feed: &mut (dyn ClusterFeed + 'static),
    index: &ClusterIndex,
    failures: &mut u32,
) -> bool {
    match feed.next_event().await {
        Ok(Some(event)) => {
            *failures = 0;
            index.apply(event);
            true
        }
        Ok(None) => {
            tracing::warn!("Cluster feed ended, index will no longer be updated");
            false
        }
        Err(e) => {
            counter!(FEED_ERRORS).increment(1);
            let delay = retry_delay(*failures);
            *failures = failures.saturating_add(1);
            tracing::warn!(
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Failed to read cluster feed"
            );
            tokio::time::sleep(delay).await;
            true
        }
    }
}

fn retry_delay(failures: u32) -> Duration {
    let millis = BASE_RETRY_DELAY_MS.saturating_mul(2_u64.saturating_pow(failures));
    Duration::from_millis(millis.min(MAX_RETRY_DELAY_MS))
}
