//! Translation from a resolved gateway to Consul configuration entries.
//!
//! Every bound HTTP route becomes a virtual service in the discovery chain:
//! the ingress listener forwards matching hosts to the route's service name,
//! a `service-router` on that name applies the rule matches, and weighted
//! rules point at per-rule synthetic services carrying a `service-splitter`.
//! Routes within a listener are translated in ascending route-id order so
//! that repeated syncs of the same state emit identical entries.

use crate::entries::{
    ConfigEntry, HeaderMutations, HttpRouteMatch, IngressGateway, IngressListener, IngressService,
    RouteDestination, RouteHeaderMatch, RouteQueryParamMatch, ServiceDefaults, ServiceRoute,
    ServiceRouteRule, ServiceRouter, ServiceSplit, ServiceSplitter, TlsEntry, GATEWAY_META_KEY,
    MANAGED_BY_KEY, MANAGED_BY_VALUE,
};
use consul_gateway_controller_core::{
    HeaderMatch, HttpFilter, HttpPathModifier, HttpRoute, HttpRouteRule, PathMatch, Protocol,
    QueryParamMatch, ResolvedGateway, ResolvedListener, TlsParams,
};
use std::collections::BTreeMap;

/// The full entry set for a gateway: the ingress entry plus the supporting
/// routers, splitters, and defaults. The ingress entry is kept separate
/// because the sync protocol writes it after the supporting entries.
#[derive(Clone, Debug, PartialEq)]
pub struct TranslatedGateway {
    pub ingress: IngressGateway,
    pub supporting: Vec<ConfigEntry>,
}

pub fn translate(gateway: &ResolvedGateway) -> TranslatedGateway {
    let meta = ownership_meta(gateway);
    let namespace = namespace_of(gateway);

    let mut listeners = Vec::new();
    let mut supporting = Vec::new();
    let mut tls: Option<TlsEntry> = None;

    for listener in &gateway.listeners {
        if listener.is_empty() {
            continue;
        }
        match listener.protocol {
            Protocol::Http | Protocol::Https => {
                let mut services = Vec::new();
                let mut routes: Vec<&HttpRoute> = listener.http_routes.iter().collect();
                routes.sort_by(|a, b| a.common.id.cmp(&b.common.id));

                for route in routes {
                    let service_name = route_service_name(gateway, route);
                    services.push(IngressService {
                        name: service_name.clone(),
                        namespace: namespace.clone(),
                        hosts: listener_hosts(listener, route),
                    });
                    supporting.extend(translate_http_route(
                        &service_name,
                        namespace.clone(),
                        route,
                        &meta,
                    ));
                }

                listeners.push(IngressListener {
                    port: listener.port,
                    protocol: "http".to_string(),
                    services,
                });
            }
            Protocol::Tcp | Protocol::Tls => {
                let mut services = Vec::new();
                let mut routes: Vec<_> = listener.tcp_routes.iter().collect();
                routes.sort_by(|a, b| a.common.id.cmp(&b.common.id));
                for route in routes {
                    if let Some(backend) = &route.backend {
                        services.push(IngressService {
                            name: backend.service.clone(),
                            namespace: backend.namespace.clone().or_else(|| namespace.clone()),
                            hosts: Vec::new(),
                        });
                    }
                }
                listeners.push(IngressListener {
                    port: listener.port,
                    protocol: "tcp".to_string(),
                    services,
                });
            }
            Protocol::Udp => {}
        }

        // Ingress TLS parameters are entry-wide in Consul; the first TLS
        // listener's parameters win.
        if tls.is_none() {
            if let Some(params) = &listener.tls {
                tls = Some(tls_entry(params));
            }
        }
    }

    let ingress = IngressGateway {
        name: gateway.id.service.clone(),
        namespace: namespace.clone(),
        tls,
        listeners,
        meta,
    };

    TranslatedGateway { ingress, supporting }
}

fn ownership_meta(gateway: &ResolvedGateway) -> BTreeMap<String, String> {
    let mut meta = gateway.meta.clone();
    meta.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string());
    meta.insert(GATEWAY_META_KEY.to_string(), gateway.id.to_string());
    meta
}

fn namespace_of(gateway: &ResolvedGateway) -> Option<String> {
    if gateway.id.namespace.is_empty() {
        None
    } else {
        Some(gateway.id.namespace.clone())
    }
}

/// The virtual service name a route occupies in the discovery chain. Route
/// ids are `namespace/name`, so flattening them keeps names unique across
/// namespaces.
fn route_service_name(gateway: &ResolvedGateway, route: &HttpRoute) -> String {
    format!(
        "{}-{}",
        gateway.id.service,
        route.common.id.replace('/', "-")
    )
}

/// Hostnames the ingress should forward to this route: the overlap of the
/// route's hostnames with the listener, or the listener hostname itself.
fn listener_hosts(listener: &ResolvedListener, route: &HttpRoute) -> Vec<String> {
    if !route.hostnames.is_empty() {
        return route.hostnames.clone();
    }
    match listener.hostname.as_deref() {
        None | Some("") | Some("*") => Vec::new(),
        Some(hostname) => vec![hostname.to_string()],
    }
}

fn tls_entry(params: &TlsParams) -> TlsEntry {
    TlsEntry {
        enabled: true,
        tls_min_version: params.min_version.map(|v| v.as_str().to_string()),
        tls_max_version: params.max_version.map(|v| v.as_str().to_string()),
        cipher_suites: params.cipher_suites.clone(),
    }
}

fn translate_http_route(
    service_name: &str,
    namespace: Option<String>,
    route: &HttpRoute,
    meta: &BTreeMap<String, String>,
) -> Vec<ConfigEntry> {
    let mut entries = Vec::new();
    let mut router_rules = Vec::new();

    entries.push(ConfigEntry::ServiceDefaults(ServiceDefaults {
        name: service_name.to_string(),
        namespace: namespace.clone(),
        protocol: "http".to_string(),
        meta: meta.clone(),
    }));

    for (index, rule) in route.rules.iter().enumerate() {
        let destination = rule_destination(service_name, namespace.clone(), index, rule);

        if rule.backends.len() > 1 {
            let split_name = rule_service_name(service_name, index);
            entries.push(ConfigEntry::ServiceDefaults(ServiceDefaults {
                name: split_name.clone(),
                namespace: namespace.clone(),
                protocol: "http".to_string(),
                meta: meta.clone(),
            }));
            entries.push(ConfigEntry::ServiceSplitter(ServiceSplitter {
                name: split_name,
                namespace: namespace.clone(),
                splits: splits(rule),
                meta: meta.clone(),
            }));
        }

        if rule.matches.is_empty() {
            router_rules.push(ServiceRouteRule {
                r#match: None,
                destination: Some(destination),
            });
        } else {
            for matcher in &rule.matches {
                router_rules.push(ServiceRouteRule {
                    r#match: Some(ServiceRoute {
                        http: Some(http_match(matcher)),
                    }),
                    destination: Some(destination.clone()),
                });
            }
        }
    }

    entries.push(ConfigEntry::ServiceRouter(ServiceRouter {
        name: service_name.to_string(),
        namespace,
        routes: router_rules,
        meta: meta.clone(),
    }));

    entries
}

fn rule_service_name(service_name: &str, rule_index: usize) -> String {
    format!("{service_name}-rule-{rule_index}")
}

/// The destination for one rule: the single backend directly, or the per-rule
/// synthetic service when traffic is split across weighted backends.
fn rule_destination(
    service_name: &str,
    namespace: Option<String>,
    rule_index: usize,
    rule: &HttpRouteRule,
) -> RouteDestination {
    let (service, namespace) = match rule.backends.as_slice() {
        [single] => (
            single.service.service.clone(),
            single.service.namespace.clone().or(namespace),
        ),
        _ => (rule_service_name(service_name, rule_index), namespace),
    };

    let mut destination = RouteDestination {
        service,
        namespace,
        prefix_rewrite: None,
        request_headers: None,
    };

    for filter in &rule.filters {
        match filter {
            HttpFilter::HeaderModifier(modifier) => {
                let mutations = HeaderMutations {
                    add: modifier.add.clone(),
                    set: modifier.set.clone(),
                    remove: modifier.remove.clone(),
                };
                if !mutations.is_empty() {
                    destination.request_headers = Some(mutations);
                }
            }
            HttpFilter::UrlRewrite(rewrite) => {
                if let Some(HttpPathModifier::Prefix(prefix) | HttpPathModifier::Full(prefix)) =
                    &rewrite.path
                {
                    destination.prefix_rewrite = Some(prefix.clone());
                }
            }
            HttpFilter::Redirect(_) => {
                // Service routers cannot express redirects; the filter is
                // accepted by validation but has no data-plane rendering.
                tracing::warn!(service = %destination.service, "dropping redirect filter with no router equivalent");
            }
        }
    }

    destination
}

fn splits(rule: &HttpRouteRule) -> Vec<ServiceSplit> {
    let total: u32 = rule.backends.iter().map(|b| u32::from(b.weight)).sum();
    let total = total.max(1) as f32;
    rule.backends
        .iter()
        .map(|backend| ServiceSplit {
            weight: (f32::from(backend.weight) / total * 10_000.0).round() / 100.0,
            service: backend.service.service.clone(),
            namespace: backend.service.namespace.clone(),
        })
        .collect()
}

fn http_match(matcher: &consul_gateway_controller_core::HttpMatch) -> HttpRouteMatch {
    let mut http = HttpRouteMatch::default();

    match &matcher.path {
        PathMatch::Exact(path) => http.path_exact = Some(path.clone()),
        PathMatch::Prefix(path) => http.path_prefix = Some(path.clone()),
        PathMatch::Regex(pattern) => http.path_regex = Some(pattern.clone()),
    }

    for header in &matcher.headers {
        http.header.push(match header {
            HeaderMatch::Exact(name, value) => RouteHeaderMatch {
                name: name.clone(),
                exact: Some(value.clone()),
                regex: None,
            },
            HeaderMatch::Regex(name, value) => RouteHeaderMatch {
                name: name.clone(),
                exact: None,
                regex: Some(value.clone()),
            },
        });
    }

    for query_param in &matcher.query_params {
        http.query_param.push(match query_param {
            QueryParamMatch::Exact(name, value) => RouteQueryParamMatch {
                name: name.clone(),
                exact: Some(value.clone()),
                regex: None,
            },
            QueryParamMatch::Regex(name, value) => RouteQueryParamMatch {
                name: name.clone(),
                exact: None,
                regex: Some(value.clone()),
            },
        });
    }

    if let Some(method) = &matcher.method {
        http.methods.push(method.to_string());
    }

    http
}

#[cfg(test)]
mod tests {
    use super::*;
    use consul_gateway_controller_core::{
        GatewayId, HeaderModifier, HttpMatch, Method, ResolvedService, TcpRoute, WeightedBackend,
    };
    use maplit::{btreemap, convert_args};

    fn http_gateway() -> ResolvedGateway {
        ResolvedGateway::new(GatewayId::new("", "gw")).with_listener(
            ResolvedListener::new("default", Protocol::Http, 80).with_http_route(
                HttpRoute::new("default/web", "web", "default")
                    .with_hostname("web.example.com")
                    .with_rule(HttpRouteRule {
                        matches: vec![HttpMatch {
                            path: PathMatch::Prefix("/api".to_string()),
                            method: Some(Method::GET),
                            ..Default::default()
                        }],
                        filters: Vec::new(),
                        backends: vec![WeightedBackend::new(ResolvedService::new("web"))],
                    }),
            ),
        )
    }

    #[test]
    fn http_listener_produces_router_and_defaults() {
        let translated = translate(&http_gateway());

        assert_eq!(translated.ingress.name, "gw");
        assert_eq!(translated.ingress.listeners.len(), 1);
        let listener = &translated.ingress.listeners[0];
        assert_eq!(listener.protocol, "http");
        assert_eq!(listener.services.len(), 1);
        assert_eq!(listener.services[0].name, "gw-default-web");
        assert_eq!(listener.services[0].hosts, vec!["web.example.com".to_string()]);

        let kinds: Vec<_> = translated.supporting.iter().map(ConfigEntry::kind).collect();
        assert_eq!(kinds, vec!["service-defaults", "service-router"]);

        let ConfigEntry::ServiceRouter(router) = &translated.supporting[1] else {
            panic!("expected a service-router");
        };
        assert_eq!(router.name, "gw-default-web");
        assert_eq!(router.routes.len(), 1);
        let http = router.routes[0]
            .r#match
            .as_ref()
            .and_then(|m| m.http.as_ref())
            .unwrap();
        assert_eq!(http.path_prefix.as_deref(), Some("/api"));
        assert_eq!(http.methods, vec!["GET".to_string()]);
        assert_eq!(
            router.routes[0].destination.as_ref().unwrap().service,
            "web"
        );
    }

    #[test]
    fn weighted_backends_produce_a_splitter() {
        let gateway = ResolvedGateway::new(GatewayId::new("", "gw")).with_listener(
            ResolvedListener::new("default", Protocol::Http, 80).with_http_route(
                HttpRoute::new("default/web", "web", "default").with_rule(HttpRouteRule {
                    matches: Vec::new(),
                    filters: Vec::new(),
                    backends: vec![
                        WeightedBackend::new(ResolvedService::new("v1")).with_weight(3),
                        WeightedBackend::new(ResolvedService::new("v2")).with_weight(1),
                    ],
                }),
            ),
        );

        let translated = translate(&gateway);
        let splitter = translated
            .supporting
            .iter()
            .find_map(|entry| match entry {
                ConfigEntry::ServiceSplitter(splitter) => Some(splitter),
                _ => None,
            })
            .expect("expected a splitter");
        assert_eq!(splitter.name, "gw-default-web-rule-0");
        assert_eq!(splitter.splits.len(), 2);
        assert!((splitter.splits[0].weight - 75.0).abs() < f32::EPSILON);
        assert!((splitter.splits[1].weight - 25.0).abs() < f32::EPSILON);

        // The router forwards to the synthetic split service.
        let ConfigEntry::ServiceRouter(router) = translated
            .supporting
            .iter()
            .find(|entry| entry.kind() == "service-router")
            .unwrap()
        else {
            panic!("expected a service-router");
        };
        assert_eq!(
            router.routes[0].destination.as_ref().unwrap().service,
            "gw-default-web-rule-0"
        );
    }

    #[test]
    fn filters_map_to_destination_fields() {
        let modifier = HeaderModifier {
            set: convert_args!(btreemap!("x-upstream" => "gw")),
            ..Default::default()
        };
        let gateway = ResolvedGateway::new(GatewayId::new("", "gw")).with_listener(
            ResolvedListener::new("default", Protocol::Http, 80).with_http_route(
                HttpRoute::new("default/web", "web", "default").with_rule(HttpRouteRule {
                    matches: Vec::new(),
                    filters: vec![
                        HttpFilter::HeaderModifier(modifier),
                        HttpFilter::UrlRewrite(consul_gateway_controller_core::HttpUrlRewrite {
                            hostname: None,
                            path: Some(HttpPathModifier::Prefix("/v2".to_string())),
                        }),
                    ],
                    backends: vec![WeightedBackend::new(ResolvedService::new("web"))],
                }),
            ),
        );

        let translated = translate(&gateway);
        let ConfigEntry::ServiceRouter(router) = translated
            .supporting
            .iter()
            .find(|entry| entry.kind() == "service-router")
            .unwrap()
        else {
            panic!("expected a service-router");
        };
        let destination = router.routes[0].destination.as_ref().unwrap();
        assert_eq!(destination.prefix_rewrite.as_deref(), Some("/v2"));
        assert_eq!(
            destination
                .request_headers
                .as_ref()
                .unwrap()
                .set
                .get("x-upstream")
                .map(String::as_str),
            Some("gw")
        );
    }

    #[test]
    fn tcp_listener_forwards_to_the_backend() {
        let gateway = ResolvedGateway::new(GatewayId::new("", "gw")).with_listener(
            ResolvedListener::new("tcp", Protocol::Tcp, 9000).with_tcp_route(
                TcpRoute::new("default/db", "db", "default")
                    .with_backend(ResolvedService::new("db")),
            ),
        );

        let translated = translate(&gateway);
        assert!(translated.supporting.is_empty());
        assert_eq!(translated.ingress.listeners[0].protocol, "tcp");
        assert_eq!(translated.ingress.listeners[0].services[0].name, "db");
    }

    #[test]
    fn empty_listeners_are_omitted() {
        let gateway = ResolvedGateway::new(GatewayId::new("", "gw"))
            .with_listener(ResolvedListener::new("default", Protocol::Http, 80));
        let translated = translate(&gateway);
        assert!(translated.ingress.listeners.is_empty());
    }

    #[test]
    fn entries_are_stamped_with_ownership() {
        let translated = translate(&http_gateway());
        assert!(translated
            .supporting
            .iter()
            .all(|entry| entry.is_managed()));
        assert_eq!(
            translated.ingress.meta.get(GATEWAY_META_KEY).map(String::as_str),
            Some("gw")
        );
    }
}
