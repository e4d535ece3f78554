#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Consul-facing side of the control plane: the config-entry model, the
//! translation from resolved gateways, the ordered sync adapter, and the thin
//! HTTP client the traits are implemented over.

mod client;
mod entries;
mod http;
mod sync;
mod translate;

pub use self::{
    client::{
        Acl, AclToken, AgentService, CatalogAgent, CertPair, ConfigEntries, LeafCerts,
        GLOBAL_MANAGEMENT_POLICY_ID,
    },
    entries::{
        ConfigEntry, HeaderMutations, HttpRouteMatch, IngressGateway, IngressListener,
        IngressService, RouteDestination, RouteHeaderMatch, RouteQueryParamMatch, ServiceDefaults,
        ServiceRoute, ServiceRouteRule, ServiceRouter, ServiceSplit, ServiceSplitter, TlsEntry,
        GATEWAY_META_KEY, MANAGED_BY_KEY, MANAGED_BY_VALUE,
    },
    http::HttpConsul,
    sync::ConsulSyncAdapter,
    translate::{translate, TranslatedGateway},
};
