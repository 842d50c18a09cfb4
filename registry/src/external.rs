use crate::feed::{ClusterEvent, ClusterFeed, FeedError};
use crate::types::ClusterList;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

const BASE_DELAY: u64 = 500;
const MAX_RETRIES: u32 = 3;

/// Polls a remote cluster registry API and emits a full listing every resync period.
pub struct ExternalRegistryFeed {
    client: reqwest::Client,
    clusters_url: Url,
    resync_period: Duration,
    loaded: bool,
}

impl ExternalRegistryFeed {
    pub fn new(base_url: &str, namespace: &str, resync_period: Duration) -> Result<Self, FeedError> {
        let full_url = format!(
            "{}/apis/clusterregistry.k8s.io/v1alpha1/namespaces/{}/clusters",
            base_url.trim_end_matches('/'),
            namespace
        );
        let clusters_url =
            Url::parse(&full_url).map_err(|e| FeedError::InvalidUrl(e.to_string()))?;

        Ok(ExternalRegistryFeed {
            client: reqwest::Client::new(),
            clusters_url,
            resync_period,
            loaded: false,
        })
    }

    pub async fn list_clusters(&self) -> Result<ClusterList, FeedError> {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,     // 429
            StatusCode::INTERNAL_SERVER_ERROR, // 500
            StatusCode::BAD_GATEWAY,           // 502
            StatusCode::SERVICE_UNAVAILABLE,   // 503
            StatusCode::GATEWAY_TIMEOUT,       // 504
        ];

        let mut retries = 0;

        loop {
            let response = self.client.get(self.clusters_url.clone()).send().await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response.json::<ClusterList>().await?);
            }

            if !RETRIABLE_STATUS_CODES.contains(&status) {
                return Err(FeedError::UnexpectedStatus(status));
            }
            if retries >= MAX_RETRIES {
                return Err(FeedError::RetriesExceeded);
            }

            let retry_millis = BASE_DELAY * 2_u64.pow(retries);
            tracing::warn!(%status, retry_millis, "Cluster registry request failed, retrying");
            sleep(Duration::from_millis(retry_millis)).await;
            retries += 1;
        }
    }
}

#[async_trait]
impl ClusterFeed for ExternalRegistryFeed {
    async fn next_event(&mut self) -> Result<Option<ClusterEvent>, FeedError> {
        if self.loaded {
            sleep(self.resync_period).await;
        }
        let list = self.list_clusters().await?;
        self.loaded = true;
        Ok(Some(ClusterEvent::Restarted(list.items)))
    }
}
