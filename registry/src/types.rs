//! Cluster objects as published by the cluster registry (`clusterregistry.k8s.io/v1alpha1`).
//!
//! The gateway only reads these. Fields the gateway never looks at are not modelled and
//! are ignored during deserialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ClusterName = String;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ObjectMeta {
    pub name: ClusterName,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerEndpoint {
    #[serde(rename = "clientCIDR", default)]
    pub client_cidr: String,
    pub server_address: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesApiEndpoints {
    #[serde(default)]
    pub server_endpoints: Vec<ServerEndpoint>,
    /// PEM encoded certificate authority bundle. Base64 on the wire, like every
    /// `[]byte` field in Kubernetes JSON.
    #[serde(default, with = "base64_bytes")]
    pub ca_bundle: Vec<u8>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub kubernetes_api_endpoints: KubernetesApiEndpoints,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Cluster {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ClusterSpec,
}

impl Cluster {
    pub fn new<N>(name: N) -> Self
    where
        N: Into<ClusterName>,
    {
        Cluster {
            metadata: ObjectMeta {
                name: name.into(),
                labels: BTreeMap::new(),
            },
            spec: ClusterSpec::default(),
        }
    }

    pub fn with_label<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_endpoint<A>(mut self, server_address: A, ca_bundle: Vec<u8>) -> Self
    where
        A: Into<String>,
    {
        self.spec.kubernetes_api_endpoints = KubernetesApiEndpoints {
            server_endpoints: vec![ServerEndpoint {
                client_cidr: "0.0.0.0/0".into(),
                server_address: server_address.into(),
            }],
            ca_bundle,
        };
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    /// The first advertised API server address.
    pub fn server_address(&self) -> Option<&str> {
        self.spec
            .kubernetes_api_endpoints
            .server_endpoints
            .first()
            .map(|e| e.server_address.as_str())
    }

    pub fn ca_bundle(&self) -> &[u8] {
        &self.spec.kubernetes_api_endpoints.ca_bundle
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClusterList {
    #[serde(default)]
    pub items: Vec<Cluster>,
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.trim())
            .map_err(serde::de::Error::custom)
    }
}
