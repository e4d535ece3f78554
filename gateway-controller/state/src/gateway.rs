use crate::route::RouteEntry;
use ahash::AHashMap as HashMap;
use consul_gateway_controller_core::{
    Gateway, ResolvedGateway, ResolvedListener, Route,
};
use std::collections::BTreeSet;

/// A gateway as held by the store: the validated gateway plus the runtime
/// state the store owns, the per-listener route sets and sync dirty bits.
///
/// Listeners never hold route objects, only ids; route upserts swap the
/// snapshot in the route table atomically without touching listener state.
#[derive(Debug)]
pub struct GatewayEntry {
    pub gateway: Gateway,
    pub listeners: Vec<ListenerState>,
    /// Gateway-level dirty bit, set on creation and on any gateway change.
    pub needs_sync: bool,
}

#[derive(Debug, Default)]
pub struct ListenerState {
    /// Ids of the routes bound to this listener.
    pub routes: BTreeSet<String>,
    pub needs_sync: bool,
}

/// A read-only view handed to the status controller: the gateway plus the
/// per-listener attached route counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewaySnapshot {
    pub gateway: Gateway,
    pub listeners: Vec<ListenerSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerSnapshot {
    pub name: String,
    pub attached_routes: usize,
}

impl GatewayEntry {
    pub fn new(gateway: Gateway) -> Self {
        let listeners = gateway
            .listeners
            .iter()
            .map(|_| ListenerState {
                routes: BTreeSet::new(),
                needs_sync: true,
            })
            .collect();
        Self {
            gateway,
            listeners,
            needs_sync: true,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.needs_sync || self.listeners.iter().any(|l| l.needs_sync)
    }

    pub fn mark_clean(&mut self) {
        self.needs_sync = false;
        for listener in &mut self.listeners {
            listener.needs_sync = false;
        }
    }

    /// Removes a route id from every listener, marking any listener whose
    /// route set shrank as needing a sync. Returns whether anything changed.
    pub fn remove_route(&mut self, route_id: &str) -> bool {
        let mut changed = false;
        for listener in &mut self.listeners {
            if listener.routes.remove(route_id) {
                listener.needs_sync = true;
                changed = true;
            }
        }
        changed
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            gateway: self.gateway.clone(),
            listeners: self
                .gateway
                .listeners
                .iter()
                .zip(&self.listeners)
                .map(|(config, state)| ListenerSnapshot {
                    name: config.name.clone(),
                    attached_routes: state.routes.len(),
                })
                .collect(),
        }
    }

    /// Recomputes the resolved form handed to the sync adapter. Only usable
    /// listeners are included; bound routes are looked up by id and their
    /// current snapshots embedded. Routes within a listener are ordered by
    /// id so the downstream merge is deterministic.
    pub fn resolve(&self, routes: &HashMap<String, RouteEntry>) -> ResolvedGateway {
        let mut resolved = ResolvedGateway::new(self.gateway.id.clone());
        resolved.meta = self.gateway.meta.clone();

        for (config, state) in self.gateway.listeners.iter().zip(&self.listeners) {
            if !config.conditions.usable() {
                continue;
            }
            let mut listener = ResolvedListener::new(&config.name, config.protocol, config.port);
            listener.hostname = config.hostname.clone();
            listener.tls = config.tls.clone();

            for route_id in &state.routes {
                match routes.get(route_id).map(|entry| &entry.route) {
                    Some(Route::Http(route)) => listener.http_routes.push(route.clone()),
                    Some(Route::Tcp(route)) => listener.tcp_routes.push(route.clone()),
                    None => {}
                }
            }
            resolved.listeners.push(listener);
        }

        resolved
    }
}
