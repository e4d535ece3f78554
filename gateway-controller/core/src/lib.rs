#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod conditions;
mod errors;
mod gateway;
mod resolved;
mod route;

pub use self::{
    conditions::{
        Condition, GatewayConditions, GatewayInSync, GatewayReady, GatewayScheduled,
        ListenerConditions, ListenerConflicted, ListenerDetached, ListenerReady,
        ListenerResolvedRefs, RouteAccepted, RouteResolvedRefs,
    },
    errors::{BindError, ResolutionError, ResolutionErrors},
    gateway::{
        hostnames_overlap, AllowedRoutes, Gateway, Listener, MetaExpression, MetaSelector,
        NamespacePolicy, Protocol, RouteKind, SelectorOperator, TlsParams, TlsVersion,
        SUPPORTED_CIPHER_SUITES,
    },
    resolved::{ResolvedGateway, ResolvedListener},
    route::{
        CommonRoute, HeaderMatch, HeaderModifier, HttpFilter, HttpMatch, HttpPathModifier,
        HttpRedirect, HttpRoute, HttpRouteRule, HttpUrlRewrite, Method, ParentRef, PathMatch,
        QueryParamMatch, Route, TcpRoute, WeightedBackend,
    },
};

use anyhow::Result;
use std::fmt;

/// Identifies a gateway by its Consul namespace and service name. This is the
/// key under which the store, the sync adapter, and Consul itself agree on a
/// single gateway.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct GatewayId {
    pub namespace: String,
    pub service: String,
}

impl GatewayId {
    pub fn new(namespace: impl ToString, service: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            service: service.to_string(),
        }
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.service)
        } else {
            write!(f, "{}/{}", self.namespace, self.service)
        }
    }
}

/// Pushes resolved gateway configuration to the downstream mesh. The store
/// calls `sync` under its write lock so that the sequence of versions visible
/// downstream matches the sequence of successful upserts.
#[async_trait::async_trait]
pub trait SyncAdapter: Send + Sync + 'static {
    async fn sync(&self, gateway: &ResolvedGateway) -> Result<()>;

    /// Removes every entry owned by the given gateway.
    async fn clear(&self, id: &GatewayId) -> Result<()>;
}

/// Resolves a route backend reference to a concrete mesh service.
///
/// Resolution failures that stem from user data (missing service, unsupported
/// kind) are returned as `ResolutionError` so that validators can attach them
/// as conditions; infrastructure failures use the `anyhow` error path and
/// abort the reconcile attempt instead.
#[async_trait::async_trait]
pub trait BackendResolver: Send + Sync + 'static {
    async fn resolve(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        target_namespace: Option<&str>,
    ) -> Result<std::result::Result<ResolvedService, ResolutionError>>;
}

/// A backend after resolution: the Consul service a listener ultimately
/// forwards to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedService {
    pub service: String,
    pub namespace: Option<String>,
}

impl ResolvedService {
    pub fn new(service: impl ToString) -> Self {
        Self {
            service: service.to_string(),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl ToString) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_id_display() {
        assert_eq!(GatewayId::new("", "gw").to_string(), "gw");
        assert_eq!(GatewayId::new("team-a", "gw").to_string(), "team-a/gw");
    }
}
