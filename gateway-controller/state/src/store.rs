use crate::{
    binding,
    gateway::{GatewayEntry, GatewaySnapshot},
    metrics::StoreMetrics,
    route::{BindOutcome, RouteEntry, RouteStatus},
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use consul_gateway_controller_core::{
    Condition, Gateway, GatewayId, GatewayInSync, Route, SyncAdapter,
};
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::RwLock;
use tokio::time::{Duration, MissedTickBehavior};

/// Shared handle to the store. Mutations serialize on the write lock; the
/// sync to the adapter happens while the lock is held, trading throughput for
/// a linear write history downstream.
#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
    adapter: Arc<dyn SyncAdapter>,
    metrics: StoreMetrics,
}

#[derive(Default)]
struct Inner {
    gateways: HashMap<GatewayId, GatewayEntry>,
    routes: HashMap<String, RouteEntry>,
}

impl Store {
    pub fn new(adapter: Arc<dyn SyncAdapter>, metrics: StoreMetrics) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            adapter,
            metrics,
        }
    }

    /// Inserts or replaces a gateway, rebinding every known route against its
    /// listeners and syncing the result downstream.
    pub async fn upsert_gateway(&self, gateway: Gateway) -> Result<bool> {
        self.upsert_gateway_if(gateway, |_| true).await
    }

    /// As `upsert_gateway`, but only applies when `update_if` approves the
    /// currently stored record. This is the optimistic-concurrency hook:
    /// callers pass e.g. "only overwrite if the generation advanced".
    pub async fn upsert_gateway_if(
        &self,
        gateway: Gateway,
        update_if: impl FnOnce(&Gateway) -> bool,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let id = gateway.id.clone();

        match inner.gateways.get(&id) {
            Some(existing) => {
                if !update_if(&existing.gateway) {
                    tracing::trace!(gateway = %id, "skipping gateway upsert");
                    return Ok(false);
                }
            }
            None => {
                self.metrics.active_gateways.inc();
            }
        }

        let mut entry = GatewayEntry::new(gateway);
        for route in inner.routes.values_mut() {
            bind_route(&mut entry, route);
        }
        inner.gateways.insert(id.clone(), entry);

        self.sync_gateway(&mut inner, &id).await?;
        Ok(true)
    }

    /// Inserts or replaces a route, rebinding it against every gateway its
    /// parent references name and syncing every gateway whose listener route
    /// sets changed.
    pub async fn upsert_route(&self, route: Route) -> Result<bool> {
        self.upsert_route_if(route, |_| true).await
    }

    pub async fn upsert_route_if(
        &self,
        route: Route,
        update_if: impl FnOnce(&Route) -> bool,
    ) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let id = route.id().to_string();

        if let Some(existing) = inner.routes.get(&id) {
            if !update_if(&existing.route) {
                tracing::trace!(route = %id, "skipping route upsert");
                return Ok(false);
            }
        }

        let mut affected = BTreeSet::new();
        for (gateway_id, entry) in inner.gateways.iter_mut() {
            if entry.remove_route(&id) {
                affected.insert(gateway_id.clone());
            }
        }

        let mut route_entry = RouteEntry::new(route);
        let parents: BTreeSet<GatewayId> = route_entry
            .route
            .common()
            .parent_refs
            .iter()
            .map(|parent| parent.gateway.clone())
            .collect();
        for gateway_id in parents {
            match inner.gateways.get_mut(&gateway_id) {
                Some(entry) => {
                    if bind_route(entry, &mut route_entry) {
                        affected.insert(gateway_id);
                    }
                }
                None => {
                    route_entry
                        .bound
                        .insert(gateway_id, BindOutcome::GatewayNotFound);
                }
            }
        }
        inner.routes.insert(id, route_entry);

        let mut first_error = None;
        for gateway_id in affected {
            if let Err(error) = self.sync_gateway(&mut inner, &gateway_id).await {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(true),
        }
    }

    /// Removes a gateway and fans the deletion out: the adapter clears every
    /// downstream entry, each route drops its parent record, and the gauge
    /// decrements.
    pub async fn delete_gateway(&self, id: &GatewayId) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.gateways.remove(id).is_none() {
            return Ok(false);
        }
        self.metrics.active_gateways.dec();
        for route in inner.routes.values_mut() {
            route.on_gateway_removed(id);
        }
        self.adapter.clear(id).await?;
        Ok(true)
    }

    /// Removes a route and resyncs every gateway that had bound it.
    pub async fn delete_route(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.routes.remove(id).is_none() {
            return Ok(false);
        }

        let mut affected = BTreeSet::new();
        for (gateway_id, entry) in inner.gateways.iter_mut() {
            if entry.remove_route(id) {
                affected.insert(gateway_id.clone());
            }
        }

        let mut first_error = None;
        for gateway_id in affected {
            if let Err(error) = self.sync_gateway(&mut inner, &gateway_id).await {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(true),
        }
    }

    pub async fn get_gateway(&self, id: &GatewayId) -> Option<Gateway> {
        self.inner
            .read()
            .await
            .gateways
            .get(id)
            .map(|entry| entry.gateway.clone())
    }

    pub async fn list_gateways(&self) -> Vec<Gateway> {
        self.inner
            .read()
            .await
            .gateways
            .values()
            .map(|entry| entry.gateway.clone())
            .collect()
    }

    pub async fn gateway_snapshot(&self, id: &GatewayId) -> Option<GatewaySnapshot> {
        self.inner
            .read()
            .await
            .gateways
            .get(id)
            .map(GatewayEntry::snapshot)
    }

    pub async fn get_route(&self, id: &str) -> Option<Route> {
        self.inner
            .read()
            .await
            .routes
            .get(id)
            .map(|entry| entry.route.clone())
    }

    pub async fn route_status(&self, id: &str) -> Option<RouteStatus> {
        self.inner.read().await.routes.get(id).map(RouteEntry::status)
    }

    /// Statuses of every route with a parent reference to the given gateway;
    /// used to refresh route statuses after a gateway changes.
    pub async fn routes_referencing(&self, id: &GatewayId) -> Vec<RouteStatus> {
        self.inner
            .read()
            .await
            .routes
            .values()
            .filter(|entry| {
                entry
                    .route
                    .common()
                    .parent_refs
                    .iter()
                    .any(|parent| &parent.gateway == id)
            })
            .map(RouteEntry::status)
            .collect()
    }

    /// Syncs every gateway regardless of dirty bits, healing drift from
    /// out-of-band changes downstream.
    pub async fn sync_all(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let ids: Vec<GatewayId> = inner.gateways.keys().cloned().collect();
        let mut first_error = None;
        for id in ids {
            if let Some(entry) = inner.gateways.get_mut(&id) {
                entry.needs_sync = true;
            }
            if let Err(error) = self.sync_gateway(&mut inner, &id).await {
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// The periodic resync loop. The runtime spawns exactly one of these per
    /// process; the first tick fires immediately.
    pub async fn run_periodic_sync(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(error) = self.sync_all().await {
                tracing::warn!(%error, "periodic resync failed");
            }
        }
    }

    /// Pushes a gateway's resolved form to the adapter when any of its dirty
    /// bits are set. On success all bits clear and `InSync` goes true; on
    /// failure the error lands in the `InSync` condition and the bits stay
    /// set so the periodic resync retries.
    async fn sync_gateway(&self, inner: &mut Inner, id: &GatewayId) -> Result<()> {
        let resolved = match inner.gateways.get(id) {
            Some(entry) if entry.is_dirty() => entry.resolve(&inner.routes),
            _ => return Ok(()),
        };

        self.metrics.sync_operations.inc();
        tracing::debug!(gateway = %id, "syncing gateway");
        let result = self.adapter.sync(&resolved).await;

        if let Some(entry) = inner.gateways.get_mut(id) {
            match &result {
                Ok(()) => {
                    entry.mark_clean();
                    entry.gateway.conditions.in_sync = Condition::active(GatewayInSync::InSync);
                }
                Err(error) => {
                    self.metrics.sync_errors.inc();
                    entry.gateway.conditions.in_sync =
                        Condition::new(false, GatewayInSync::SyncError, error);
                }
            }
        }
        result
    }
}

/// Binds a route to the first accepting listener of a gateway, recording the
/// outcome on the route. Returns whether the route was bound (and a listener
/// therefore dirtied).
fn bind_route(entry: &mut GatewayEntry, route_entry: &mut RouteEntry) -> bool {
    let id = entry.gateway.id.clone();
    let sections: Vec<Option<String>> = route_entry
        .route
        .common()
        .parent_refs
        .iter()
        .filter(|parent| parent.gateway == id)
        .map(|parent| parent.section_name.clone())
        .collect();
    if sections.is_empty() {
        route_entry.bound.remove(&id);
        return false;
    }

    let mut outcome = None;
    for section in sections {
        match binding::try_bind(&entry.gateway, section.as_deref(), &route_entry.route) {
            Ok((index, listener_name)) => {
                let listener = &mut entry.listeners[index];
                listener.routes.insert(route_entry.route.id().to_string());
                listener.needs_sync = true;
                route_entry
                    .bound
                    .insert(id, BindOutcome::Bound(listener_name));
                return true;
            }
            Err(error) => {
                if outcome.is_none() {
                    outcome = Some(error);
                }
            }
        }
    }

    if let Some(error) = outcome {
        tracing::debug!(gateway = %id, route = %route_entry.route.id(), %error, "route failed to bind");
        route_entry.bound.insert(id, BindOutcome::Failed(error));
    }
    false
}
