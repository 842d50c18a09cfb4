use serde::Deserialize;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("label name for {0} cannot be empty")]
    EmptyLabel(&'static str),
    #[error("tenancy value cannot be empty")]
    EmptyTenancyValue,
    #[error("resync period cannot be 0")]
    InvalidResyncPeriod,
    #[error("sync timeout cannot be 0")]
    InvalidSyncTimeout,
}

/// Label names used to read fleet membership and location off cluster objects.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Labels {
    /// Label the index is built on.
    pub tenancy_label: String,
    /// Index value selecting the clusters that belong to this fleet.
    pub tenancy_value: String,
    pub region_label: String,
    pub environment_label: String,
}

impl Default for Labels {
    fn default() -> Self {
        Labels {
            tenancy_label: "customer".into(),
            tenancy_value: "paas".into(),
            region_label: "region".into(),
            environment_label: "paas-env".into(),
        }
    }
}

fn default_resync_period_secs() -> u64 {
    60
}

fn default_namespace() -> String {
    "kube-system".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum Source {
    File {
        path: PathBuf,
        #[serde(default = "default_resync_period_secs")]
        resync_period_secs: u64,
    },
    External {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
        #[serde(default = "default_resync_period_secs")]
        resync_period_secs: u64,
    },
}

fn default_sync_timeout_secs() -> u64 {
    60
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub labels: Labels,
    pub source: Source,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("tenancy", &self.labels.tenancy_label),
            ("region", &self.labels.region_label),
            ("environment", &self.labels.environment_label),
        ] {
            if value.is_empty() {
                return Err(ValidationError::EmptyLabel(field));
            }
        }
        if self.labels.tenancy_value.is_empty() {
            return Err(ValidationError::EmptyTenancyValue);
        }

        let resync = match &self.source {
            Source::File {
                resync_period_secs, ..
            } => *resync_period_secs,
            Source::External {
                resync_period_secs, ..
            } => *resync_period_secs,
        };
        if resync == 0 {
            return Err(ValidationError::InvalidResyncPeriod);
        }

        if self.sync_timeout_secs == 0 {
            return Err(ValidationError::InvalidSyncTimeout);
        }
        Ok(())
    }
}
