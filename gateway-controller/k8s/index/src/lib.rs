#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Watches Gateway API resources (plus the pods, services, secrets,
//! namespaces, and reference grants that enrich them), validates them into
//! the core model, and drives the store.
//!
//! The kubert-driven [`Index`] only maintains lightweight snapshots and
//! forwards change events over a channel; the [`Reconciler`] task consumes
//! those events, validates against the snapshots, and performs the async
//! store and status work.

mod gateway;
mod index;
mod reconciler;
mod reference_grant;
mod route;

pub use self::{
    index::{
        process_namespaces, Event, Index, PodSummary, ResourceId, SecretSummary, ServiceSummary,
        SharedIndex,
    },
    reconciler::{Reconciler, ServiceBackendResolver},
    reference_grant::{GrantFrom, GrantSummary, GrantTo},
};

use std::sync::Arc;

/// Cluster-level configuration shared by the index, the validators, and the
/// reconciler.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Only gateways whose `gatewayClassName` matches are managed.
    pub gateway_class: String,
    /// Consul namespace the gateway services live in; empty for OSS Consul.
    pub consul_namespace: String,
    /// Label carrying the owning gateway's name on gateway pods.
    pub pod_gateway_label: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            gateway_class: "consul-api-gateway".to_string(),
            consul_namespace: String::new(),
            pod_gateway_label: "consul.hashicorp.com/gateway".to_string(),
        }
    }
}

pub type SharedConfig = Arc<ClusterConfig>;
