//! Snapshot index over the watched resources.
//!
//! Each `kubert` watch applies into this index under its write lock; the
//! index records the slim summary the validators need and forwards an event
//! to the reconciler. No validation or I/O happens on the watch path.

use crate::{
    reference_grant::GrantSummary,
    SharedConfig,
};
use ahash::AHashMap as HashMap;
use consul_gateway_controller_k8s_api::{self as k8s, gateway, ResourceExt};
use futures::prelude::*;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info_span;

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Change notifications handed to the reconciler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Gateway(ResourceId),
    HttpRoute(ResourceId),
    TcpRoute(ResourceId),
    /// Pod or service churn: revalidate the gateways of one namespace.
    GatewaysInNamespace(String),
    /// Secret or reference-grant churn: revalidate everything TLS touches.
    AllGateways,
    /// Reference-grant or namespace-label churn: revalidate route admission.
    AllRoutes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub phase: Option<String>,
    pub ready: bool,
    pub unschedulable: bool,
    pub pod_ip: Option<String>,
    pub host_ip: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceSummary {
    pub type_: Option<String>,
    pub cluster_ip: Option<String>,
    /// LoadBalancer ingress IPs and hostnames, in status order.
    pub load_balancer: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretSummary {
    pub is_tls: bool,
}

pub struct Index {
    config: SharedConfig,
    events: UnboundedSender<Event>,

    gateways: HashMap<ResourceId, gateway::Gateway>,
    http_routes: HashMap<ResourceId, gateway::HttpRoute>,
    tcp_routes: HashMap<ResourceId, gateway::TcpRoute>,
    grants: HashMap<ResourceId, GrantSummary>,
    pods: HashMap<ResourceId, PodSummary>,
    services: HashMap<ResourceId, ServiceSummary>,
    secrets: HashMap<ResourceId, SecretSummary>,
    namespaces: HashMap<String, BTreeMap<String, String>>,
}

impl Index {
    pub fn shared(config: SharedConfig, events: UnboundedSender<Event>) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            config,
            events,
            gateways: HashMap::default(),
            http_routes: HashMap::default(),
            tcp_routes: HashMap::default(),
            grants: HashMap::default(),
            pods: HashMap::default(),
            services: HashMap::default(),
            secrets: HashMap::default(),
            namespaces: HashMap::default(),
        }))
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            tracing::error!("reconciler event channel closed");
        }
    }

    // === snapshot reads ===

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn gateway(&self, id: &ResourceId) -> Option<gateway::Gateway> {
        self.gateways.get(id).cloned()
    }

    pub fn gateway_ids(&self) -> Vec<ResourceId> {
        self.gateways.keys().cloned().collect()
    }

    pub fn gateway_ids_in(&self, namespace: &str) -> Vec<ResourceId> {
        self.gateways
            .keys()
            .filter(|id| id.namespace == namespace)
            .cloned()
            .collect()
    }

    /// Resolves a gateway's Kubernetes namespace by service name; used when
    /// rendering route parent statuses.
    pub fn gateway_namespace(&self, name: &str) -> Option<String> {
        self.gateways
            .keys()
            .find(|id| id.name == name)
            .map(|id| id.namespace.clone())
    }

    pub fn http_route(&self, id: &ResourceId) -> Option<gateway::HttpRoute> {
        self.http_routes.get(id).cloned()
    }

    pub fn http_route_ids(&self) -> Vec<ResourceId> {
        self.http_routes.keys().cloned().collect()
    }

    pub fn tcp_route(&self, id: &ResourceId) -> Option<gateway::TcpRoute> {
        self.tcp_routes.get(id).cloned()
    }

    pub fn tcp_route_ids(&self) -> Vec<ResourceId> {
        self.tcp_routes.keys().cloned().collect()
    }

    pub fn pods_for_gateway(&self, namespace: &str, name: &str) -> Vec<PodSummary> {
        let mut pods: Vec<_> = self
            .pods
            .iter()
            .filter(|(id, pod)| {
                id.namespace == namespace
                    && pod.labels.get(&self.config.pod_gateway_label).map(String::as_str)
                        == Some(name)
            })
            .map(|(_, pod)| pod.clone())
            .collect();
        pods.sort_by(|a, b| a.name.cmp(&b.name));
        pods
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<ServiceSummary> {
        self.services
            .get(&ResourceId::new(namespace, name))
            .cloned()
    }

    pub fn service_exists(&self, namespace: &str, name: &str) -> bool {
        self.services.contains_key(&ResourceId::new(namespace, name))
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretSummary> {
        self.secrets.get(&ResourceId::new(namespace, name)).cloned()
    }

    pub fn grants_in(&self, namespace: &str) -> Vec<GrantSummary> {
        let mut grants: Vec<_> = self
            .grants
            .iter()
            .filter(|(id, _)| id.namespace == namespace)
            .collect();
        grants.sort_by(|(a, _), (b, _)| a.cmp(b));
        grants.into_iter().map(|(_, grant)| grant.clone()).collect()
    }

    pub fn namespace_labels(&self, namespace: &str) -> BTreeMap<String, String> {
        self.namespaces.get(namespace).cloned().unwrap_or_default()
    }

    /// Captures everything route validation needs so the lock can be dropped
    /// before the resolver is consulted.
    pub(crate) fn route_context(&self, route_namespace: &str) -> crate::route::RouteContext {
        let mut grants: HashMap<String, Vec<GrantSummary>> = HashMap::default();
        for (id, grant) in &self.grants {
            grants
                .entry(id.namespace.clone())
                .or_default()
                .push(grant.clone());
        }
        crate::route::RouteContext {
            namespace_labels: self.namespace_labels(route_namespace),
            grants,
        }
    }

    pub fn apply_namespace(&mut self, namespace: String, labels: BTreeMap<String, String>) {
        if self.namespaces.insert(namespace, labels.clone()) != Some(labels) {
            self.emit(Event::AllRoutes);
        }
    }

    pub fn delete_namespace(&mut self, namespace: &str) {
        if self.namespaces.remove(namespace).is_some() {
            self.emit(Event::AllRoutes);
        }
    }
}

impl kubert::index::IndexNamespacedResource<gateway::Gateway> for Index {
    fn apply(&mut self, resource: gateway::Gateway) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let _span = info_span!("apply", kind = "Gateway", %namespace, %name).entered();
        let id = ResourceId::new(&namespace, &name);

        if resource.spec.gateway_class_name != self.config.gateway_class {
            // The gateway may have been ours under a previous class name.
            if self.gateways.remove(&id).is_some() {
                self.emit(Event::Gateway(id));
            }
            return;
        }

        self.gateways.insert(id.clone(), resource);
        self.emit(Event::Gateway(id));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.gateways.remove(&id).is_some() {
            self.emit(Event::Gateway(id));
        }
    }
}

impl kubert::index::IndexNamespacedResource<gateway::HttpRoute> for Index {
    fn apply(&mut self, resource: gateway::HttpRoute) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let _span = info_span!("apply", kind = "HTTPRoute", %namespace, %name).entered();
        let id = ResourceId::new(namespace, name);
        self.http_routes.insert(id.clone(), resource);
        self.emit(Event::HttpRoute(id));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.http_routes.remove(&id).is_some() {
            self.emit(Event::HttpRoute(id));
        }
    }
}

impl kubert::index::IndexNamespacedResource<gateway::TcpRoute> for Index {
    fn apply(&mut self, resource: gateway::TcpRoute) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let _span = info_span!("apply", kind = "TCPRoute", %namespace, %name).entered();
        let id = ResourceId::new(namespace, name);
        self.tcp_routes.insert(id.clone(), resource);
        self.emit(Event::TcpRoute(id));
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.tcp_routes.remove(&id).is_some() {
            self.emit(Event::TcpRoute(id));
        }
    }
}

impl kubert::index::IndexNamespacedResource<gateway::ReferenceGrant> for Index {
    fn apply(&mut self, resource: gateway::ReferenceGrant) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace, name);
        let grant = GrantSummary::from(resource.spec);
        if self.grants.insert(id, grant).is_none() {
            tracing::debug!("indexed new ReferenceGrant");
        }
        self.emit(Event::AllGateways);
        self.emit(Event::AllRoutes);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.grants.remove(&id).is_some() {
            self.emit(Event::AllGateways);
            self.emit(Event::AllRoutes);
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, resource: k8s::Pod) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let id = ResourceId::new(&namespace, &name);

        let summary = pod_summary(name, resource);
        // Only gateway pods are interesting; everything else would churn the
        // reconciler for no reason.
        if !summary.labels.contains_key(&self.config.pod_gateway_label) {
            return;
        }
        if self.pods.insert(id, summary.clone()) != Some(summary) {
            self.emit(Event::GatewaysInNamespace(namespace));
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(&namespace, name);
        if self.pods.remove(&id).is_some() {
            self.emit(Event::GatewaysInNamespace(namespace));
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, resource: k8s::Service) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let id = ResourceId::new(&namespace, name);

        let summary = service_summary(&resource);
        if self.services.insert(id, summary.clone()) != Some(summary) {
            self.emit(Event::GatewaysInNamespace(namespace));
            // Route backends resolve against services as well.
            self.emit(Event::AllRoutes);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(&namespace, name);
        if self.services.remove(&id).is_some() {
            self.emit(Event::GatewaysInNamespace(namespace));
            self.emit(Event::AllRoutes);
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Secret> for Index {
    fn apply(&mut self, resource: k8s::Secret) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace, name);

        let summary = SecretSummary {
            is_tls: resource.type_.as_deref() == Some("kubernetes.io/tls"),
        };
        if self.secrets.insert(id, summary.clone()) != Some(summary) {
            self.emit(Event::AllGateways);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if self.secrets.remove(&id).is_some() {
            self.emit(Event::AllGateways);
        }
    }
}

fn pod_summary(name: String, pod: k8s::Pod) -> PodSummary {
    let labels = pod.metadata.labels.unwrap_or_default().into_iter().collect();
    let status = pod.status.unwrap_or_default();

    let mut ready = false;
    let mut unschedulable = false;
    for condition in status.conditions.iter().flatten() {
        match condition.type_.as_str() {
            "Ready" => ready = condition.status == "True",
            "PodScheduled" => {
                unschedulable = condition.status == "False"
                    && condition.reason.as_deref() == Some("Unschedulable");
            }
            _ => {}
        }
    }

    PodSummary {
        name,
        labels,
        phase: status.phase,
        ready,
        unschedulable,
        pod_ip: status.pod_ip,
        host_ip: status.host_ip,
    }
}

fn service_summary(service: &k8s::Service) -> ServiceSummary {
    let spec = service.spec.as_ref();
    let load_balancer = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| {
            ingress
                .iter()
                .flat_map(|entry| entry.ip.clone().into_iter().chain(entry.hostname.clone()))
                .collect()
        })
        .unwrap_or_default();

    ServiceSummary {
        type_: spec.and_then(|spec| spec.type_.clone()),
        cluster_ip: spec.and_then(|spec| spec.cluster_ip.clone()),
        load_balancer,
    }
}

/// Feeds namespace label changes into the index. Namespaces are
/// cluster-scoped, so they bypass the namespaced kubert indexing and are
/// processed from the raw watch stream instead.
pub async fn process_namespaces(
    index: SharedIndex,
    events: impl Stream<Item = k8s::WatchEvent<k8s::Namespace>>,
) {
    tokio::pin!(events);
    while let Some(event) = events.next().await {
        match event {
            k8s::WatchEvent::Applied(namespace) => {
                let name = namespace.name_unchecked();
                let labels = namespace
                    .metadata
                    .labels
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                index.write().apply_namespace(name, labels);
            }
            k8s::WatchEvent::Deleted(namespace) => {
                let name = namespace.name_unchecked();
                index.write().delete_namespace(&name);
            }
            k8s::WatchEvent::Restarted(namespaces) => {
                let mut index = index.write();
                for namespace in namespaces {
                    let name = namespace.name_unchecked();
                    let labels = namespace
                        .metadata
                        .labels
                        .unwrap_or_default()
                        .into_iter()
                        .collect();
                    index.apply_namespace(name, labels);
                }
            }
        }
    }
}
