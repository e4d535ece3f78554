//! Rendering of core condition sets into Kubernetes `metav1.Condition`s and
//! Gateway API status blocks.

use chrono::offset::Utc;
use consul_gateway_controller_core::{Condition, GatewayConditions, ListenerConditions, RouteKind};
use consul_gateway_controller_k8s_api::{self as k8s, gateway};
use consul_gateway_controller_state::GatewaySnapshot;
use std::fmt;

pub const CONTROLLER_NAME: &str = "hashicorp.com/consul-api-gateway-controller";

fn condition<R: fmt::Display>(
    type_: &str,
    condition: &Condition<R>,
    observed_generation: i64,
) -> k8s::Condition {
    k8s::Condition {
        last_transition_time: k8s::Time(Utc::now()),
        message: condition.message.clone(),
        observed_generation: Some(observed_generation),
        reason: condition.reason.to_string(),
        status: if condition.status { "True" } else { "False" }.to_string(),
        type_: type_.to_string(),
    }
}

fn gateway_conditions(conditions: &GatewayConditions, generation: i64) -> Vec<k8s::Condition> {
    vec![
        condition("Scheduled", &conditions.scheduled, generation),
        condition("Ready", &conditions.ready, generation),
        condition("InSync", &conditions.in_sync, generation),
    ]
}

fn listener_conditions(conditions: &ListenerConditions, generation: i64) -> Vec<k8s::Condition> {
    vec![
        condition("Conflicted", &conditions.conflicted, generation),
        condition("Detached", &conditions.detached, generation),
        condition("Ready", &conditions.ready, generation),
        condition("ResolvedRefs", &conditions.resolved_refs, generation),
    ]
}

fn supported_kinds(kinds: &'static [RouteKind]) -> Vec<gateway::RouteGroupKind> {
    kinds
        .iter()
        .map(|kind| gateway::RouteGroupKind {
            group: Some("gateway.networking.k8s.io".to_string()),
            kind: match kind {
                RouteKind::Http => "HTTPRoute".to_string(),
                RouteKind::Tcp => "TCPRoute".to_string(),
            },
        })
        .collect()
}

/// Renders the full Gateway status block from a store snapshot.
pub(crate) fn gateway_status(snapshot: &GatewaySnapshot, generation: i64) -> gateway::GatewayStatus {
    let addresses = snapshot
        .gateway
        .addresses
        .iter()
        .map(|address| gateway::GatewayAddress {
            r#type: Some(address_type(address).to_string()),
            value: address.clone(),
        })
        .collect();

    let listeners = snapshot
        .gateway
        .listeners
        .iter()
        .zip(&snapshot.listeners)
        .map(|(listener, state)| gateway::ListenerStatus {
            name: listener.name.clone(),
            supported_kinds: supported_kinds(listener.protocol.supported_route_kinds()),
            attached_routes: state.attached_routes as u16,
            conditions: listener_conditions(&listener.conditions, generation),
        })
        .collect();

    gateway::GatewayStatus {
        addresses: Some(addresses),
        conditions: Some(gateway_conditions(&snapshot.gateway.conditions, generation)),
        listeners: Some(listeners),
    }
}

fn address_type(address: &str) -> &'static str {
    if address.parse::<std::net::IpAddr>().is_ok() {
        "IPAddress"
    } else {
        "Hostname"
    }
}

/// Renders a route's per-parent status entries.
pub(crate) fn route_status(
    parents: &[crate::controller::RouteParent],
    resolved_refs: &Condition<consul_gateway_controller_core::RouteResolvedRefs>,
    generation: i64,
) -> gateway::RouteStatus {
    let parents = parents
        .iter()
        .map(|parent| gateway::RouteParentStatus {
            parent_ref: gateway::ParentReference {
                group: Some("gateway.networking.k8s.io".to_string()),
                kind: Some("Gateway".to_string()),
                namespace: Some(parent.namespace.clone()),
                name: parent.name.clone(),
                section_name: None,
                port: None,
            },
            controller_name: CONTROLLER_NAME.to_string(),
            conditions: vec![
                condition("Accepted", &parent.accepted, generation),
                condition("ResolvedRefs", resolved_refs, generation),
            ],
        })
        .collect();

    gateway::RouteStatus { parents }
}
