//! Wire types returned by the aggregator API.

use serde::{Deserialize, Serialize};

pub const GROUP_NAME: &str = "aggregator.voyager.atl-paas.net";
pub const API_VERSION: &str = "v1";

pub fn group_version() -> String {
    format!("{GROUP_NAME}/{API_VERSION}")
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub region: String,
    pub env_type: String,
}

/// One cluster's outcome within an aggregated response.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub name: String,
    #[serde(flatten)]
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Aggregate {
    pub fn new(name: String, location: Location) -> Self {
        Aggregate {
            name,
            location,
            body: None,
            status_code: 0,
            error: None,
        }
    }

    pub fn succeeded(mut self, status_code: u16, body: serde_json::Value) -> Self {
        self.status_code = status_code;
        self.body = Some(body);
        self.error = None;
        self
    }

    pub fn failed(mut self, status_code: u16, error: String) -> Self {
        self.status_code = status_code;
        self.error = Some(error);
        self
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateList {
    pub kind: String,
    pub api_version: String,
    pub items: Vec<Aggregate>,
}

impl AggregateList {
    pub fn new(items: Vec<Aggregate>) -> Self {
        AggregateList {
            kind: "AggregateList".into(),
            api_version: group_version(),
            items,
        }
    }
}

/// Discovery document served at the API root.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceList {
    pub kind: String,
    pub api_version: String,
    pub group_version: String,
    pub resources: Vec<serde_json::Value>,
}

impl Default for ApiResourceList {
    fn default() -> Self {
        ApiResourceList {
            kind: "APIResourceList".into(),
            api_version: "v1".into(),
            group_version: group_version(),
            resources: Vec::new(),
        }
    }
}

/// Kubernetes `Status` object, so `kubectl` can render gateway failures.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub kind: String,
    pub api_version: String,
    pub status: String,
    pub message: String,
    pub reason: String,
    pub code: u16,
}

impl Status {
    pub fn failure(code: u16, reason: &str, message: String) -> Self {
        Status {
            kind: "Status".into(),
            api_version: "v1".into(),
            status: "Failure".into(),
            message,
            reason: reason.into(),
            code,
        }
    }
}
