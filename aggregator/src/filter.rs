//! Turns query parameters into a [`RequestFilter`] and selects candidate clusters.

use crate::types::Location;
use registry::config::Labels;
use registry::index::{ClusterIndex, IndexError};
use registry::types::Cluster;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestFilter {
    /// Path relayed to every cluster. Required.
    pub uri: String,
    /// Empty matches every region.
    pub region: String,
    /// Empty matches every environment.
    pub environment: String,
}

impl RequestFilter {
    /// Reads `uri`, `region` and `envType`. Unknown parameters are ignored and the
    /// first occurrence of a repeated parameter wins.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut filter = RequestFilter::default();
        let mut seen = HashSet::new();

        for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
            let slot = match key.as_ref() {
                "uri" => &mut filter.uri,
                "region" => &mut filter.region,
                "envType" => &mut filter.environment,
                _ => continue,
            };
            if seen.insert(key.clone()) {
                *slot = value.into_owned();
            }
        }
        filter
    }
}

/// A cluster chosen for dispatch, with the location it is reported under.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub cluster: Arc<Cluster>,
    pub location: Location,
}

impl Candidate {
    pub fn name(&self) -> &str {
        self.cluster.name()
    }
}

pub struct ClusterSelector {
    index: Arc<ClusterIndex>,
    labels: Labels,
    env_whitelist: HashSet<String>,
}

impl ClusterSelector {
    pub fn new(index: Arc<ClusterIndex>, labels: Labels, env_whitelist: &[String]) -> Self {
        ClusterSelector {
            index,
            labels,
            env_whitelist: env_whitelist.iter().cloned().collect(),
        }
    }

    /// Tenancy-tagged clusters matching `filter`, in index order.
    ///
    /// A cluster outside the environment whitelist is never returned, even when
    /// the filter names its environment explicitly.
    pub fn select(&self, filter: &RequestFilter) -> Result<Vec<Candidate>, IndexError> {
        let clusters = self.index.by_index(&self.labels.tenancy_value)?;

        Ok(clusters
            .into_iter()
            .filter_map(|cluster| {
                let region = cluster.label(&self.labels.region_label).unwrap_or("");
                let environment = cluster.label(&self.labels.environment_label).unwrap_or("");

                let selected = (filter.region.is_empty() || filter.region == region)
                    && (filter.environment.is_empty() || filter.environment == environment)
                    && self.env_whitelist.contains(environment);
                if !selected {
                    return None;
                }

                let location = Location {
                    region: region.to_string(),
                    env_type: environment.to_string(),
                };
                Some(Candidate { cluster, location })
            })
            .collect())
    }
}
