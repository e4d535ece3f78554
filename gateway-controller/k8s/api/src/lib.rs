#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use k8s_gateway_api as gateway;
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Namespace, Pod, PodSpec, PodStatus, Secret, Service, ServicePort, ServiceSpec,
            ServiceStatus,
        },
    },
    apimachinery::{
        self,
        pkg::apis::meta::v1::{Condition, LabelSelector, Time},
    },
    NamespaceResourceScope,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    runtime::watcher::Event as WatchEvent,
    Client, Error,
};

/// Matches a reference-grant `from`/`to` group against the Gateway API and
/// core groups, treating the empty string and the core group as equivalent.
pub fn group_matches(grant_group: &str, group: Option<&str>) -> bool {
    let group = group.unwrap_or_default();
    let grant_group = normalize_group(grant_group);
    normalize_group(group) == grant_group
}

fn normalize_group(group: &str) -> &str {
    match group {
        "" | "core" => "",
        other => other,
    }
}

/// Whether a backend object reference points at a core `Service`; the only
/// backend kind the mesh can resolve.
pub fn backend_ref_is_service(backend: &gateway::BackendObjectReference) -> bool {
    backend
        .kind
        .as_deref()
        .map(|kind| kind.eq_ignore_ascii_case("service"))
        .unwrap_or(true)
        && backend
            .group
            .as_deref()
            .map(|group| normalize_group(group).is_empty())
            .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_normalization() {
        assert!(group_matches("", None));
        assert!(group_matches("core", Some("")));
        assert!(group_matches("gateway.networking.k8s.io", Some("gateway.networking.k8s.io")));
        assert!(!group_matches("gateway.networking.k8s.io", None));
    }

    #[test]
    fn service_backend_detection() {
        let service = gateway::BackendObjectReference {
            group: None,
            kind: None,
            name: "web".to_string(),
            namespace: None,
            port: Some(80),
        };
        assert!(backend_ref_is_service(&service));

        let other = gateway::BackendObjectReference {
            group: Some("example.com".to_string()),
            kind: Some("Bucket".to_string()),
            name: "web".to_string(),
            namespace: None,
            port: None,
        };
        assert!(!backend_ref_is_service(&other));
    }
}
