//! Serde models of the Consul configuration entries the gateway manages.
//!
//! Field casing follows the Consul HTTP API. Every entry written by this
//! controller is stamped with `Meta["managed_by"] = "consul-api-gateway"` so
//! garbage collection can recognize ownership.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const MANAGED_BY_KEY: &str = "managed_by";
pub const MANAGED_BY_VALUE: &str = "consul-api-gateway";

/// Meta key recording which gateway owns an entry, as `namespace/service`.
pub const GATEWAY_META_KEY: &str = "consul-api-gateway/gateway";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Kind")]
pub enum ConfigEntry {
    #[serde(rename = "ingress-gateway")]
    IngressGateway(IngressGateway),
    #[serde(rename = "service-router")]
    ServiceRouter(ServiceRouter),
    #[serde(rename = "service-splitter")]
    ServiceSplitter(ServiceSplitter),
    #[serde(rename = "service-defaults")]
    ServiceDefaults(ServiceDefaults),
}

impl ConfigEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IngressGateway(_) => "ingress-gateway",
            Self::ServiceRouter(_) => "service-router",
            Self::ServiceSplitter(_) => "service-splitter",
            Self::ServiceDefaults(_) => "service-defaults",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::IngressGateway(entry) => &entry.name,
            Self::ServiceRouter(entry) => &entry.name,
            Self::ServiceSplitter(entry) => &entry.name,
            Self::ServiceDefaults(entry) => &entry.name,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::IngressGateway(entry) => entry.namespace.as_deref(),
            Self::ServiceRouter(entry) => entry.namespace.as_deref(),
            Self::ServiceSplitter(entry) => entry.namespace.as_deref(),
            Self::ServiceDefaults(entry) => entry.namespace.as_deref(),
        }
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        match self {
            Self::IngressGateway(entry) => &entry.meta,
            Self::ServiceRouter(entry) => &entry.meta,
            Self::ServiceSplitter(entry) => &entry.meta,
            Self::ServiceDefaults(entry) => &entry.meta,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.meta().get(MANAGED_BY_KEY).map(String::as_str) == Some(MANAGED_BY_VALUE)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IngressGateway {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "TLS", skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsEntry>,
    pub listeners: Vec<IngressListener>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TlsEntry {
    pub enabled: bool,
    #[serde(rename = "TLSMinVersion", skip_serializing_if = "Option::is_none")]
    pub tls_min_version: Option<String>,
    #[serde(rename = "TLSMaxVersion", skip_serializing_if = "Option::is_none")]
    pub tls_max_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cipher_suites: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IngressListener {
    pub port: u16,
    pub protocol: String,
    pub services: Vec<IngressService>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IngressService {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRouter {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub routes: Vec<ServiceRouteRule>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRouteRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#match: Option<ServiceRoute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<RouteDestination>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRoute {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpRouteMatch>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpRouteMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_exact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header: Vec<RouteHeaderMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query_param: Vec<RouteQueryParamMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteHeaderMatch {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteQueryParamMatch {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exact: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RouteDestination {
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_rewrite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HeaderMutations>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeaderMutations {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub add: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl HeaderMutations {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.set.is_empty() && self.remove.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSplitter {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub splits: Vec<ServiceSplit>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSplit {
    /// Percentage of traffic, 0..=100 with two decimal places of precision.
    pub weight: f32,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceDefaults {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, convert_args};

    #[test]
    fn entries_serialize_with_consul_casing() {
        let entry = ConfigEntry::IngressGateway(IngressGateway {
            name: "gw".to_string(),
            namespace: None,
            tls: Some(TlsEntry {
                enabled: true,
                tls_min_version: Some("TLSv1_2".to_string()),
                ..Default::default()
            }),
            listeners: vec![IngressListener {
                port: 80,
                protocol: "http".to_string(),
                services: vec![IngressService {
                    name: "web".to_string(),
                    namespace: None,
                    hosts: vec!["web.example.com".to_string()],
                }],
            }],
            meta: convert_args!(btreemap!(MANAGED_BY_KEY => MANAGED_BY_VALUE)),
        });

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["Kind"], "ingress-gateway");
        assert_eq!(value["Name"], "gw");
        assert_eq!(value["TLS"]["Enabled"], true);
        assert_eq!(value["Listeners"][0]["Services"][0]["Hosts"][0], "web.example.com");
        assert_eq!(value["Meta"]["managed_by"], "consul-api-gateway");

        let parsed: ConfigEntry = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, entry);
        assert!(parsed.is_managed());
    }
}
