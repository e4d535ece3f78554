use crate::{
    gateway::{Protocol, TlsParams},
    route::{HttpRoute, TcpRoute},
    GatewayId,
};
use std::collections::BTreeMap;

/// The fully-resolved form of a gateway handed to the sync adapter: one entry
/// per usable listener, each carrying the snapshots of the routes bound to it.
///
/// Constructed once per reconcile by the store; tests build instances through
/// the fluent constructors without touching the Kubernetes surface.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedGateway {
    pub id: GatewayId,
    pub meta: BTreeMap<String, String>,
    pub listeners: Vec<ResolvedListener>,
}

impl ResolvedGateway {
    pub fn new(id: GatewayId) -> Self {
        Self {
            id,
            meta: BTreeMap::new(),
            listeners: Vec::new(),
        }
    }

    pub fn with_meta(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_listener(mut self, listener: ResolvedListener) -> Self {
        self.listeners.push(listener);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedListener {
    pub name: String,
    pub hostname: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
    pub tls: Option<TlsParams>,
    pub http_routes: Vec<HttpRoute>,
    pub tcp_routes: Vec<TcpRoute>,
}

impl ResolvedListener {
    pub fn new(name: impl ToString, protocol: Protocol, port: u16) -> Self {
        Self {
            name: name.to_string(),
            hostname: None,
            port,
            protocol,
            tls: None,
            http_routes: Vec::new(),
            tcp_routes: Vec::new(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl ToString) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    pub fn with_tls(mut self, tls: TlsParams) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_http_route(mut self, route: HttpRoute) -> Self {
        self.http_routes.push(route);
        self
    }

    pub fn with_tcp_route(mut self, route: TcpRoute) -> Self {
        self.tcp_routes.push(route);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.http_routes.is_empty() && self.tcp_routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResolvedService;

    #[test]
    fn builder_round_trip() {
        let gateway = ResolvedGateway::new(GatewayId::new("", "gw"))
            .with_meta("managed_by", "consul-api-gateway")
            .with_listener(
                ResolvedListener::new("default", Protocol::Http, 80).with_http_route(
                    HttpRoute::new("default/web", "web", "default"),
                ),
            );
        assert_eq!(gateway.listeners.len(), 1);
        assert!(!gateway.listeners[0].is_empty());
        assert_eq!(
            gateway.meta.get("managed_by").map(String::as_str),
            Some("consul-api-gateway")
        );

        let listener = ResolvedListener::new("tcp", Protocol::Tcp, 9000)
            .with_tcp_route(TcpRoute::new("default/db", "db", "default").with_backend(
                ResolvedService::new("db"),
            ));
        assert_eq!(listener.tcp_routes.len(), 1);
    }
}
