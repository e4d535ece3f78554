//! Gateway validation: raw Gateway API objects become `core::Gateway` values
//! with per-listener condition sets. User-data problems never escape as
//! errors; they land in conditions and the gateway keeps reconciling.

use crate::{index::Index, reference_grant::grant_allows, ClusterConfig, ResourceId};
use consul_gateway_controller_core::{
    self as core, Condition, GatewayId, GatewayReady, GatewayScheduled, ListenerConflicted,
    ListenerDetached, ListenerReady, ListenerResolvedRefs, MetaExpression, MetaSelector,
    NamespacePolicy, Protocol, RouteKind, SelectorOperator, TlsParams,
};
use consul_gateway_controller_k8s_api::{gateway, group_matches, LabelSelector};
use std::collections::BTreeMap;

const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

/// Meta keys recording the originating Kubernetes object.
pub const META_K8S_NAMESPACE: &str = "external-source/namespace";
pub const META_K8S_NAME: &str = "external-source/name";

pub(crate) fn validate(
    config: &ClusterConfig,
    id: &ResourceId,
    gw: &gateway::Gateway,
    index: &Index,
) -> core::Gateway {
    let mut out = core::Gateway::new(GatewayId::new(&config.consul_namespace, &id.name));
    out.source_namespace = id.namespace.clone();
    out.generation = gw.metadata.generation.unwrap_or_default();
    out.meta
        .insert(META_K8S_NAMESPACE.to_string(), id.namespace.clone());
    out.meta.insert(META_K8S_NAME.to_string(), id.name.clone());

    for listener in &gw.spec.listeners {
        out.listeners
            .push(validate_listener(listener, &id.namespace, index));
    }
    mark_conflicts(&mut out.listeners);

    let pods = index.pods_for_gateway(&id.namespace, &id.name);
    let (scheduled, pod_ready) = pod_conditions(&pods);
    out.conditions.scheduled = scheduled;
    out.pod_ready = pod_ready;

    let service = index.service(&id.namespace, &id.name);
    out.addresses = assign_addresses(service.as_ref(), &pods);
    out.service_ready = match &service {
        None => true,
        Some(_) => !out.addresses.is_empty(),
    };

    // Listeners that validated cleanly become Ready once the pods and
    // service are; everything else stays Pending until the world catches up.
    for listener in &mut out.listeners {
        if listener.conditions.pending() && out.pod_ready && out.service_ready {
            listener.conditions.ready = Condition::active(ListenerReady::Ready);
        }
    }

    let user_addresses = gw
        .spec
        .addresses
        .as_ref()
        .map(|addresses| !addresses.is_empty())
        .unwrap_or(false);
    out.conditions.ready = if user_addresses {
        Condition::new(
            false,
            GatewayReady::AddressNotAssigned,
            "gateway addresses are assigned by the controller; spec.addresses is not supported",
        )
    } else if out.listeners.iter().any(|l| l.conditions.invalid()) {
        Condition::inactive(GatewayReady::ListenersNotValid)
    } else if !out.pod_ready
        || !out.service_ready
        || out.listeners.iter().any(|l| l.conditions.pending())
    {
        Condition::inactive(GatewayReady::ListenersNotReady)
    } else {
        Condition::active(GatewayReady::Ready)
    };

    out
}

fn validate_listener(
    listener: &gateway::Listener,
    gateway_namespace: &str,
    index: &Index,
) -> core::Listener {
    let name = if listener.name.is_empty() {
        "default"
    } else {
        listener.name.as_str()
    };
    let protocol = Protocol::parse(&listener.protocol);
    let mut out = core::Listener::new(
        name,
        protocol.unwrap_or(Protocol::Udp),
        listener.port,
    );
    out.hostname = listener.hostname.clone();

    if protocol.is_none() || out.protocol.supported_route_kinds().is_empty() {
        out.conditions.detached = Condition::new(
            true,
            ListenerDetached::UnsupportedProtocol,
            format!("unsupported listener protocol: {}", listener.protocol),
        );
        out.conditions.ready = Condition::new(
            false,
            ListenerReady::Invalid,
            format!("unsupported listener protocol: {}", listener.protocol),
        );
        return out;
    }

    if let Some(allowed) = &listener.allowed_routes {
        if let Some(kinds) = &allowed.kinds {
            let mut valid = Vec::new();
            let mut invalid = Vec::new();
            for kind in kinds {
                match route_kind(kind) {
                    Some(kind) if out.protocol.supported_route_kinds().contains(&kind) => {
                        valid.push(kind)
                    }
                    _ => invalid.push(kind.kind.clone()),
                }
            }
            if !invalid.is_empty() {
                out.conditions.detached = Condition::new(
                    true,
                    ListenerDetached::InvalidRouteKinds,
                    format!("unsupported route kinds: {}", invalid.join(", ")),
                );
                out.conditions.ready = Condition::new(
                    false,
                    ListenerReady::Invalid,
                    "listener allows route kinds its protocol does not support",
                );
            }
            out.allowed.kinds = valid;
        }
        if let Some(namespaces) = &allowed.namespaces {
            out.allowed.namespaces = namespace_policy(namespaces);
        }
    }

    if out.protocol.requires_tls() {
        validate_tls(listener, gateway_namespace, index, &mut out);
    }

    out
}

fn validate_tls(
    listener: &gateway::Listener,
    gateway_namespace: &str,
    index: &Index,
    out: &mut core::Listener,
) {
    let Some(tls) = &listener.tls else {
        out.conditions.ready = Condition::new(
            false,
            ListenerReady::Invalid,
            format!("{} listeners require TLS configuration", out.protocol),
        );
        return;
    };

    if tls.mode.as_deref() == Some("Passthrough") {
        out.conditions.ready = Condition::new(
            false,
            ListenerReady::Invalid,
            "TLS passthrough is not supported",
        );
        return;
    }

    let refs = tls
        .certificate_refs
        .as_deref()
        .unwrap_or_default();
    let Some(cert_ref) = refs.first() else {
        out.conditions.resolved_refs = Condition::new(
            false,
            ListenerResolvedRefs::InvalidCertificateRef,
            "listener has no certificate references",
        );
        return;
    };
    if refs.len() > 1 {
        tracing::warn!(
            listener = %out.name,
            "multiple certificate references; only the first is used"
        );
    }

    let kind_ok = cert_ref
        .kind
        .as_deref()
        .map(|kind| kind.eq_ignore_ascii_case("secret"))
        .unwrap_or(true)
        && group_matches("", cert_ref.group.as_deref());
    if !kind_ok {
        out.conditions.resolved_refs = Condition::new(
            false,
            ListenerResolvedRefs::InvalidCertificateRef,
            "certificate references must point at core Secrets",
        );
        return;
    }

    let secret_namespace = cert_ref
        .namespace
        .as_deref()
        .unwrap_or(gateway_namespace);
    if secret_namespace != gateway_namespace {
        let grants = index.grants_in(secret_namespace);
        let allowed = grant_allows(
            &grants,
            GATEWAY_API_GROUP,
            "Gateway",
            gateway_namespace,
            "",
            "Secret",
            &cert_ref.name,
        );
        if !allowed {
            out.conditions.resolved_refs = Condition::new(
                false,
                ListenerResolvedRefs::RefNotPermitted,
                format!(
                    "no ReferenceGrant in {secret_namespace} permits the certificate reference"
                ),
            );
            return;
        }
    }

    match index.secret(secret_namespace, &cert_ref.name) {
        Some(secret) if secret.is_tls => {}
        Some(_) => {
            out.conditions.resolved_refs = Condition::new(
                false,
                ListenerResolvedRefs::InvalidCertificateRef,
                format!(
                    "secret {secret_namespace}/{} is not of type kubernetes.io/tls",
                    cert_ref.name
                ),
            );
            return;
        }
        None => {
            out.conditions.resolved_refs = Condition::new(
                false,
                ListenerResolvedRefs::InvalidCertificateRef,
                format!("secret {secret_namespace}/{} not found", cert_ref.name),
            );
            return;
        }
    }

    let certificates = vec![format!("k8s://{secret_namespace}/{}", cert_ref.name)];
    let options = tls.options.clone().unwrap_or_default();
    match TlsParams::from_options(certificates, &options) {
        Ok(params) => out.tls = Some(params),
        Err(message) => {
            out.conditions.ready = Condition::new(false, ListenerReady::Invalid, message);
        }
    }
}

fn route_kind(kind: &gateway::RouteGroupKind) -> Option<RouteKind> {
    if !kind
        .group
        .as_deref()
        .map(|group| group.is_empty() || group == GATEWAY_API_GROUP)
        .unwrap_or(true)
    {
        return None;
    }
    match kind.kind.as_str() {
        "HTTPRoute" => Some(RouteKind::Http),
        "TCPRoute" => Some(RouteKind::Tcp),
        _ => None,
    }
}

fn namespace_policy(namespaces: &gateway::RouteNamespaces) -> NamespacePolicy {
    match namespaces.from.as_deref() {
        Some("All") => NamespacePolicy::All,
        Some("Selector") => NamespacePolicy::Selector(
            namespaces
                .selector
                .as_ref()
                .map(selector)
                .unwrap_or_default(),
        ),
        _ => NamespacePolicy::Same,
    }
}

fn selector(selector: &LabelSelector) -> MetaSelector {
    MetaSelector {
        match_labels: selector.match_labels.clone().unwrap_or_default(),
        match_expressions: selector
            .match_expressions
            .iter()
            .flatten()
            .filter_map(|requirement| {
                let operator = match requirement.operator.as_str() {
                    "In" => SelectorOperator::In,
                    "NotIn" => SelectorOperator::NotIn,
                    "Exists" => SelectorOperator::Exists,
                    "DoesNotExist" => SelectorOperator::DoesNotExist,
                    _ => return None,
                };
                Some(MetaExpression {
                    key: requirement.key.clone(),
                    operator,
                    values: requirement.values.clone().unwrap_or_default(),
                })
            })
            .collect(),
    }
}

/// Listeners sharing a port must agree on protocol, and within a protocol
/// must declare distinct hostnames. Violations mark the colliding listeners;
/// they never abort the gateway.
fn mark_conflicts(listeners: &mut [core::Listener]) {
    let mut by_port: BTreeMap<u16, Vec<usize>> = BTreeMap::new();
    for (index, listener) in listeners.iter().enumerate() {
        by_port.entry(listener.port).or_default().push(index);
    }

    for (port, bucket) in by_port {
        if bucket.len() < 2 {
            continue;
        }

        let protocols_differ = bucket
            .iter()
            .any(|&i| listeners[i].protocol != listeners[bucket[0]].protocol);
        if protocols_differ {
            for &i in &bucket {
                listeners[i].conditions.conflicted = Condition::new(
                    true,
                    ListenerConflicted::ProtocolConflict,
                    format!("multiple listeners on port {port} with different protocols"),
                );
            }
            continue;
        }

        for (position, &i) in bucket.iter().enumerate() {
            let duplicate = bucket.iter().enumerate().any(|(other_position, &other)| {
                other_position != position
                    && listeners[other].hostname == listeners[i].hostname
            });
            if duplicate {
                listeners[i].conditions.conflicted = Condition::new(
                    true,
                    ListenerConflicted::HostnameConflict,
                    format!("multiple listeners on port {port} with the same hostname"),
                );
            }
        }
    }
}

/// Derives the gateway's scheduled condition from the phases of its pods.
fn pod_conditions(
    pods: &[crate::index::PodSummary],
) -> (Condition<GatewayScheduled>, bool) {
    if pods.is_empty() {
        return (
            Condition::new(
                false,
                GatewayScheduled::NotReconciled,
                "no gateway pods found",
            ),
            false,
        );
    }

    let mut unschedulable = false;
    let mut pending = false;
    let mut failed = false;
    let mut unknown = false;
    for pod in pods {
        match pod.phase.as_deref() {
            Some("Running") if pod.ready => {
                return (Condition::active(GatewayScheduled::Scheduled), true);
            }
            Some("Running") | Some("Pending") if pod.unschedulable => unschedulable = true,
            Some("Running") | Some("Pending") => pending = true,
            Some("Succeeded") | Some("Failed") => failed = true,
            _ => unknown = true,
        }
    }

    let condition = if unschedulable {
        Condition::new(
            false,
            GatewayScheduled::NoResources,
            "gateway pods cannot be scheduled",
        )
    } else if pending {
        Condition::new(
            false,
            GatewayScheduled::NotReconciled,
            "gateway pods are not yet ready",
        )
    } else if failed {
        Condition::new(false, GatewayScheduled::PodFailed, "gateway pods have failed")
    } else {
        debug_assert!(unknown);
        Condition::new(
            false,
            GatewayScheduled::Unknown,
            "gateway pods are in an unknown state",
        )
    };
    (condition, false)
}

/// Address assignment policy by service type: no service uses pod IPs,
/// LoadBalancers use their ingress records, ClusterIP services use the
/// cluster IP, and NodePort services use the pods' host IPs. Addresses are
/// deduplicated preserving discovery order.
fn assign_addresses(
    service: Option<&crate::index::ServiceSummary>,
    pods: &[crate::index::PodSummary],
) -> Vec<String> {
    let raw: Vec<String> = match service {
        None => pods.iter().filter_map(|pod| pod.pod_ip.clone()).collect(),
        Some(service) => match service.type_.as_deref() {
            Some("LoadBalancer") => service.load_balancer.clone(),
            Some("NodePort") => pods.iter().filter_map(|pod| pod.host_ip.clone()).collect(),
            _ => service.cluster_ip.clone().into_iter().collect(),
        },
    };

    let mut seen = std::collections::BTreeSet::new();
    raw.into_iter()
        .filter(|address| !address.is_empty() && seen.insert(address.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Event, Index, PodSummary, ServiceSummary};
    use consul_gateway_controller_k8s_api as k8s;
    use kubert::index::IndexNamespacedResource;
    use maplit::{btreemap, convert_args};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn test_index() -> (crate::SharedIndex, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        (Index::shared(Arc::new(ClusterConfig::default()), tx), rx)
    }

    fn listener(name: &str, port: u16, protocol: &str) -> gateway::Listener {
        gateway::Listener {
            name: name.to_string(),
            hostname: None,
            port,
            protocol: protocol.to_string(),
            tls: None,
            allowed_routes: None,
        }
    }

    fn gateway_object(listeners: Vec<gateway::Listener>) -> gateway::Gateway {
        gateway::Gateway {
            metadata: k8s::ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("gw".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: gateway::GatewaySpec {
                gateway_class_name: "consul-api-gateway".to_string(),
                listeners,
                addresses: None,
            },
            status: None,
        }
    }

    fn ready_pod() -> k8s::Pod {
        k8s::Pod {
            metadata: k8s::ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("gw-pod".to_string()),
                labels: Some(convert_args!(btreemap!(
                    "consul.hashicorp.com/gateway" => "gw",
                ))),
                ..Default::default()
            },
            spec: None,
            status: Some(k8s::PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![k8s::api::core::v1::PodCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                pod_ip: Some("10.0.0.5".to_string()),
                host_ip: Some("192.168.1.10".to_string()),
                ..Default::default()
            }),
        }
    }

    fn validate_with(index: &crate::SharedIndex, gw: &gateway::Gateway) -> core::Gateway {
        let config = ClusterConfig::default();
        let id = ResourceId::new("default", "gw");
        validate(&config, &id, gw, &index.read())
    }

    #[test]
    fn ready_gateway_with_running_pod() {
        let (index, _rx) = test_index();
        index.write().apply(ready_pod());

        let gw = gateway_object(vec![listener("default", 80, "HTTP")]);
        let validated = validate_with(&index, &gw);

        assert!(validated.conditions.scheduled.status);
        assert!(validated.pod_ready);
        assert_eq!(validated.addresses, vec!["10.0.0.5".to_string()]);
        assert_eq!(
            validated.conditions.ready.reason,
            GatewayReady::Ready
        );
        assert_eq!(
            validated.listeners[0].conditions.ready.reason,
            ListenerReady::Ready
        );
    }

    #[test]
    fn protocol_conflict_marks_both_listeners() {
        let (index, _rx) = test_index();
        index.write().apply(ready_pod());

        let gw = gateway_object(vec![
            listener("a", 1, "HTTP"),
            listener("b", 1, "UDP"),
        ]);
        let validated = validate_with(&index, &gw);

        for l in &validated.listeners {
            assert!(l.conditions.conflicted.status, "{} not conflicted", l.name);
            assert_eq!(
                l.conditions.conflicted.reason,
                ListenerConflicted::ProtocolConflict
            );
        }
        assert_eq!(
            validated.conditions.ready.reason,
            GatewayReady::ListenersNotValid
        );
    }

    #[test]
    fn hostname_conflict_on_shared_port() {
        let (index, _rx) = test_index();
        let mut a = listener("a", 443, "HTTP");
        a.hostname = Some("app.example.com".to_string());
        let mut b = listener("b", 443, "HTTP");
        b.hostname = Some("app.example.com".to_string());
        let mut c = listener("c", 443, "HTTP");
        c.hostname = Some("other.example.com".to_string());

        let validated = validate_with(&index, &gateway_object(vec![a, b, c]));
        assert!(validated.listeners[0].conditions.conflicted.status);
        assert!(validated.listeners[1].conditions.conflicted.status);
        assert!(!validated.listeners[2].conditions.conflicted.status);
        assert_eq!(
            validated.listeners[0].conditions.conflicted.reason,
            ListenerConflicted::HostnameConflict
        );
    }

    #[test]
    fn unschedulable_pod_reports_no_resources() {
        let (index, _rx) = test_index();
        let mut pod = ready_pod();
        pod.status = Some(k8s::PodStatus {
            phase: Some("Pending".to_string()),
            conditions: Some(vec![k8s::api::core::v1::PodCondition {
                type_: "PodScheduled".to_string(),
                status: "False".to_string(),
                reason: Some("Unschedulable".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        index.write().apply(pod);

        let validated = validate_with(&index, &gateway_object(vec![listener("l", 80, "HTTP")]));
        assert_eq!(
            validated.conditions.scheduled.reason,
            GatewayScheduled::NoResources
        );
    }

    #[test]
    fn ready_gateway_regresses_when_pods_disappear() {
        let (index, _rx) = test_index();
        index.write().apply(ready_pod());
        let gw = gateway_object(vec![listener("default", 80, "HTTP")]);
        assert!(validate_with(&index, &gw).conditions.scheduled.status);

        let pods = index.read().pods_for_gateway("default", "gw");
        for pod in pods {
            IndexNamespacedResource::<k8s::Pod>::delete(
                &mut *index.write(),
                "default".to_string(),
                pod.name,
            );
        }
        let revalidated = validate_with(&index, &gw);
        assert_eq!(
            revalidated.conditions.scheduled.reason,
            GatewayScheduled::NotReconciled
        );
        assert!(!revalidated.conditions.ready.status);
    }

    #[test]
    fn user_supplied_addresses_are_rejected() {
        let (index, _rx) = test_index();
        index.write().apply(ready_pod());
        let mut gw = gateway_object(vec![listener("default", 80, "HTTP")]);
        gw.spec.addresses = Some(vec![gateway::GatewayAddress {
            r#type: None,
            value: "1.2.3.4".to_string(),
        }]);

        let validated = validate_with(&index, &gw);
        assert_eq!(
            validated.conditions.ready.reason,
            GatewayReady::AddressNotAssigned
        );
    }

    #[test]
    fn address_policy_by_service_type() {
        let pods = vec![PodSummary {
            pod_ip: Some("10.0.0.5".to_string()),
            host_ip: Some("192.168.1.10".to_string()),
            ..Default::default()
        }];

        assert_eq!(assign_addresses(None, &pods), vec!["10.0.0.5".to_string()]);

        let lb = ServiceSummary {
            type_: Some("LoadBalancer".to_string()),
            cluster_ip: Some("172.16.0.1".to_string()),
            load_balancer: vec!["35.1.1.1".to_string(), "lb.example.com".to_string()],
        };
        assert_eq!(
            assign_addresses(Some(&lb), &pods),
            vec!["35.1.1.1".to_string(), "lb.example.com".to_string()]
        );

        let cluster_ip = ServiceSummary {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("172.16.0.1".to_string()),
            load_balancer: Vec::new(),
        };
        assert_eq!(
            assign_addresses(Some(&cluster_ip), &pods),
            vec!["172.16.0.1".to_string()]
        );

        let node_port = ServiceSummary {
            type_: Some("NodePort".to_string()),
            cluster_ip: Some("172.16.0.1".to_string()),
            load_balancer: Vec::new(),
        };
        assert_eq!(
            assign_addresses(Some(&node_port), &pods),
            vec!["192.168.1.10".to_string()]
        );
    }

    fn tls_secret(namespace: &str, name: &str) -> k8s::Secret {
        k8s::Secret {
            metadata: k8s::ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            ..Default::default()
        }
    }

    fn https_listener(options: Option<BTreeMap<String, String>>) -> gateway::Listener {
        gateway::Listener {
            name: "https".to_string(),
            hostname: None,
            port: 443,
            protocol: "HTTPS".to_string(),
            tls: Some(gateway::GatewayTlsConfig {
                mode: Some("Terminate".to_string()),
                certificate_refs: Some(vec![gateway::SecretObjectReference {
                    group: None,
                    kind: Some("Secret".to_string()),
                    name: "cert".to_string(),
                    namespace: None,
                }]),
                options,
            }),
            allowed_routes: None,
        }
    }

    #[test]
    fn tls_min_version_option_is_resolved() {
        let (index, _rx) = test_index();
        index.write().apply(ready_pod());
        index.write().apply(tls_secret("default", "cert"));

        let options = Some(convert_args!(btreemap!(
            "tls_min_version" => "TLSv1_2",
        )));
        let gw = gateway_object(vec![https_listener(options)]);
        let validated = validate_with(&index, &gw);

        let listener = &validated.listeners[0];
        assert_eq!(listener.conditions.ready.reason, ListenerReady::Ready);
        let tls = listener.tls.as_ref().unwrap();
        assert_eq!(tls.min_version, Some(core::TlsVersion::Tls1_2));
        assert_eq!(tls.certificates, vec!["k8s://default/cert".to_string()]);
    }

    #[test]
    fn cipher_suites_with_tls13_min_version_invalidate_the_listener() {
        let (index, _rx) = test_index();
        index.write().apply(ready_pod());
        index.write().apply(tls_secret("default", "cert"));

        let options = Some(convert_args!(btreemap!(
            "tls_min_version" => "TLSv1_3",
            "tls_cipher_suites" => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        )));
        let gw = gateway_object(vec![https_listener(options)]);
        let validated = validate_with(&index, &gw);

        let listener = &validated.listeners[0];
        assert_eq!(listener.conditions.ready.reason, ListenerReady::Invalid);
        assert_eq!(
            listener.conditions.ready.message,
            "configuring TLS cipher suites is only supported for TLS 1.2 and earlier"
        );
    }

    #[test]
    fn cross_namespace_certificate_requires_a_grant() {
        let (index, _rx) = test_index();
        index.write().apply(ready_pod());
        index.write().apply(tls_secret("certs", "cert"));

        let mut l = https_listener(None);
        l.tls.as_mut().unwrap().certificate_refs = Some(vec![gateway::SecretObjectReference {
            group: None,
            kind: Some("Secret".to_string()),
            name: "cert".to_string(),
            namespace: Some("certs".to_string()),
        }]);
        let gw = gateway_object(vec![l.clone()]);

        let validated = validate_with(&index, &gw);
        assert_eq!(
            validated.listeners[0].conditions.resolved_refs.reason,
            ListenerResolvedRefs::RefNotPermitted
        );

        index.write().apply(gateway::ReferenceGrant {
            metadata: k8s::ObjectMeta {
                namespace: Some("certs".to_string()),
                name: Some("allow-gw".to_string()),
                ..Default::default()
            },
            spec: gateway::ReferenceGrantSpec {
                from: vec![gateway::ReferenceGrantFrom {
                    group: "gateway.networking.k8s.io".to_string(),
                    kind: "Gateway".to_string(),
                    namespace: "default".to_string(),
                }],
                to: vec![gateway::ReferenceGrantTo {
                    group: "".to_string(),
                    kind: "Secret".to_string(),
                    name: None,
                }],
            },
        });

        let validated = validate_with(&index, &gw);
        assert!(validated.listeners[0].conditions.resolved_refs.status);
        assert_eq!(
            validated.listeners[0].tls.as_ref().unwrap().certificates,
            vec!["k8s://certs/cert".to_string()]
        );
    }

    #[test]
    fn passthrough_tls_is_invalid() {
        let (index, _rx) = test_index();
        let mut l = https_listener(None);
        l.tls.as_mut().unwrap().mode = Some("Passthrough".to_string());
        let validated = validate_with(&index, &gateway_object(vec![l]));
        assert_eq!(
            validated.listeners[0].conditions.ready.reason,
            ListenerReady::Invalid
        );
    }

    #[test]
    fn missing_certificate_secret_is_an_invalid_ref() {
        let (index, _rx) = test_index();
        let validated = validate_with(&index, &gateway_object(vec![https_listener(None)]));
        assert_eq!(
            validated.listeners[0].conditions.resolved_refs.reason,
            ListenerResolvedRefs::InvalidCertificateRef
        );
    }
}
