//! The reconcile manager: event-driven glue between the watches and the
//! store.
//!
//! Watch handlers only record snapshots and emit events; this task does the
//! real work: validation against the snapshots, store mutation with
//! optimistic-concurrency predicates, and status publication. Infrastructure
//! errors are logged and left for the next event or the periodic resync;
//! user-data errors never reach this level (they are conditions by now).

use crate::{
    gateway as gateway_validation,
    gateway::{META_K8S_NAME, META_K8S_NAMESPACE},
    index::{Event, ResourceId, SharedIndex},
    route as route_validation, SharedConfig,
};
use anyhow::Result;
use consul_gateway_controller_core::{
    BackendResolver, GatewayId, ResolutionError, ResolvedService,
};
use consul_gateway_controller_k8s_status as status;
use consul_gateway_controller_state::{GatewaySnapshot, RouteStatus, Store};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{info_span, Instrument};

pub struct Reconciler<R> {
    config: SharedConfig,
    index: SharedIndex,
    store: Store,
    resolver: Arc<R>,
    statuses: UnboundedSender<status::Update>,
    events: UnboundedReceiver<Event>,
}

impl<R: BackendResolver> Reconciler<R> {
    pub fn new(
        config: SharedConfig,
        index: SharedIndex,
        store: Store,
        resolver: Arc<R>,
        statuses: UnboundedSender<status::Update>,
        events: UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            config,
            index,
            store,
            resolver,
            statuses,
            events,
        }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            if let Err(error) = self
                .handle(event.clone())
                .instrument(info_span!("reconcile", ?event))
                .await
            {
                tracing::warn!(%error, "reconciliation failed; awaiting next event or resync");
            }
        }
    }

    async fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::Gateway(id) => self.reconcile_gateway(id).await,
            Event::HttpRoute(id) => self.reconcile_http_route(id).await,
            Event::TcpRoute(id) => self.reconcile_tcp_route(id).await,
            Event::GatewaysInNamespace(namespace) => {
                let ids = self.index.read().gateway_ids_in(&namespace);
                let mut first_error = None;
                for id in ids {
                    if let Err(error) = self.reconcile_gateway(id).await {
                        first_error.get_or_insert(error);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
            Event::AllGateways => {
                let ids = self.index.read().gateway_ids();
                let mut first_error = None;
                for id in ids {
                    if let Err(error) = self.reconcile_gateway(id).await {
                        first_error.get_or_insert(error);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
            Event::AllRoutes => {
                let http_ids = self.index.read().http_route_ids();
                let tcp_ids = self.index.read().tcp_route_ids();
                let mut first_error = None;
                for id in http_ids {
                    if let Err(error) = self.reconcile_http_route(id).await {
                        first_error.get_or_insert(error);
                    }
                }
                for id in tcp_ids {
                    if let Err(error) = self.reconcile_tcp_route(id).await {
                        first_error.get_or_insert(error);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    async fn reconcile_gateway(&self, id: ResourceId) -> Result<()> {
        let raw = self.index.read().gateway(&id);
        let Some(raw) = raw else {
            let gateway_id = GatewayId::new(&self.config.consul_namespace, &id.name);
            self.store.delete_gateway(&gateway_id).await?;
            for route_status in self.store.routes_referencing(&gateway_id).await {
                self.push_route_status(route_status);
            }
            return Ok(());
        };

        let validated = {
            let index = self.index.read();
            gateway_validation::validate(&self.config, &id, &raw, &index)
        };
        let gateway_id = validated.id.clone();
        let generation = validated.generation;

        let result = self
            .store
            .upsert_gateway_if(validated, move |current| current.generation <= generation)
            .await;

        self.push_gateway_status(&gateway_id).await;
        for route_status in self.store.routes_referencing(&gateway_id).await {
            self.push_route_status(route_status);
        }
        result.map(|_| ())
    }

    async fn reconcile_http_route(&self, id: ResourceId) -> Result<()> {
        let raw = self.index.read().http_route(&id);
        let Some(raw) = raw else {
            self.store
                .delete_route(&route_validation::http_route_id(&id))
                .await?;
            return Ok(());
        };

        let context = self.index.read().route_context(&id.namespace);
        let validated =
            route_validation::validate_http(&self.config, &id, raw, &context, self.resolver.as_ref())
                .await?;
        self.upsert_route(validated).await
    }

    async fn reconcile_tcp_route(&self, id: ResourceId) -> Result<()> {
        let raw = self.index.read().tcp_route(&id);
        let Some(raw) = raw else {
            self.store
                .delete_route(&route_validation::tcp_route_id(&id))
                .await?;
            return Ok(());
        };

        let context = self.index.read().route_context(&id.namespace);
        let validated =
            route_validation::validate_tcp(&self.config, &id, raw, &context, self.resolver.as_ref())
                .await?;
        self.upsert_route(validated).await
    }

    async fn upsert_route(&self, route: consul_gateway_controller_core::Route) -> Result<()> {
        let route_id = route.id().to_string();
        let generation = route.common().generation;
        let parents: Vec<GatewayId> = route
            .common()
            .parent_refs
            .iter()
            .map(|parent| parent.gateway.clone())
            .collect();

        let result = self
            .store
            .upsert_route_if(route, move |current| {
                current.common().generation <= generation
            })
            .await;

        if let Some(route_status) = self.store.route_status(&route_id).await {
            self.push_route_status(route_status);
        }
        for parent in parents {
            self.push_gateway_status(&parent).await;
        }
        result.map(|_| ())
    }

    async fn push_gateway_status(&self, id: &GatewayId) {
        let Some(snapshot) = self.store.gateway_snapshot(id).await else {
            return;
        };
        let Some(resource_id) = gateway_resource_id(&snapshot) else {
            tracing::debug!(gateway = %id, "gateway snapshot has no provenance; skipping status");
            return;
        };
        let generation = snapshot.gateway.generation;
        self.send(status::Update::Gateway {
            id: resource_id,
            generation,
            snapshot,
        });
    }

    fn push_route_status(&self, route_status: RouteStatus) {
        let Some((kind, resource_id)) = parse_route_id(&route_status.id) else {
            tracing::error!(id = %route_status.id, "malformed route id");
            return;
        };

        let parents = route_status
            .parents
            .iter()
            .map(|(gateway_id, accepted)| {
                let namespace = self
                    .index
                    .read()
                    .gateway_namespace(&gateway_id.service)
                    .unwrap_or_else(|| resource_id.namespace.clone());
                status::RouteParent {
                    namespace,
                    name: gateway_id.service.clone(),
                    accepted: accepted.clone(),
                }
            })
            .collect();

        let update = match kind {
            RouteIdKind::Http => status::Update::HttpRoute {
                id: resource_id,
                generation: route_status.generation,
                parents,
                resolved_refs: route_status.resolved_refs,
            },
            RouteIdKind::Tcp => status::Update::TcpRoute {
                id: resource_id,
                generation: route_status.generation,
                parents,
                resolved_refs: route_status.resolved_refs,
            },
        };
        self.send(update);
    }

    fn send(&self, update: status::Update) {
        if self.statuses.send(update).is_err() {
            tracing::error!("status controller channel closed");
        }
    }
}

enum RouteIdKind {
    Http,
    Tcp,
}

fn parse_route_id(id: &str) -> Option<(RouteIdKind, status::ResourceId)> {
    let mut parts = id.splitn(3, '/');
    let kind = match parts.next()? {
        "http" => RouteIdKind::Http,
        "tcp" => RouteIdKind::Tcp,
        _ => return None,
    };
    let namespace = parts.next()?;
    let name = parts.next()?;
    Some((kind, status::ResourceId::new(namespace, name)))
}

fn gateway_resource_id(snapshot: &GatewaySnapshot) -> Option<status::ResourceId> {
    let namespace = snapshot.gateway.meta.get(META_K8S_NAMESPACE)?;
    let name = snapshot.gateway.meta.get(META_K8S_NAME)?;
    Some(status::ResourceId::new(namespace, name))
}

/// Resolves route backends against the indexed Kubernetes services: a
/// backend resolves iff the Service exists, and maps onto the Consul service
/// of the same name in the configured destination namespace.
pub struct ServiceBackendResolver {
    index: SharedIndex,
    consul_namespace: String,
}

impl ServiceBackendResolver {
    pub fn new(index: SharedIndex, consul_namespace: String) -> Self {
        Self {
            index,
            consul_namespace,
        }
    }
}

#[async_trait::async_trait]
impl BackendResolver for ServiceBackendResolver {
    async fn resolve(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        target_namespace: Option<&str>,
    ) -> Result<std::result::Result<ResolvedService, ResolutionError>> {
        if kind != "Service" {
            return Ok(Err(ResolutionError::UnsupportedKind(format!(
                "cannot resolve backend kind {kind}"
            ))));
        }
        let namespace = target_namespace.unwrap_or(namespace);
        if !self.index.read().service_exists(namespace, name) {
            return Ok(Err(ResolutionError::NotFound(format!(
                "service {namespace}/{name} not found"
            ))));
        }

        let mut service = ResolvedService::new(name);
        if !self.consul_namespace.is_empty() {
            service = service.with_namespace(&self.consul_namespace);
        }
        Ok(Ok(service))
    }
}
