use crate::{
    conditions::{GatewayConditions, ListenerConditions},
    GatewayId,
};
use std::collections::BTreeMap;
use std::fmt;

/// Listener protocols understood by the gateway. UDP is representable so that
/// a listener declaring it can be marked unsupported rather than dropped.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Tls,
    Udp,
}

/// Route kinds a listener can carry. The set of variants is closed; the
/// validators and the binding engine both match on it exhaustively.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum RouteKind {
    Http,
    Tcp,
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Some(Self::Http),
            "HTTPS" => Some(Self::Https),
            "TCP" => Some(Self::Tcp),
            "TLS" => Some(Self::Tls),
            "UDP" => Some(Self::Udp),
            _ => None,
        }
    }

    /// The fixed table of route kinds supported per protocol. An empty slice
    /// means the protocol itself is unsupported.
    pub fn supported_route_kinds(&self) -> &'static [RouteKind] {
        match self {
            Self::Http | Self::Https => &[RouteKind::Http],
            Self::Tcp | Self::Tls => &[RouteKind::Tcp],
            Self::Udp => &[],
        }
    }

    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Https | Self::Tls)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Tcp => "TCP",
            Self::Tls => "TLS",
            Self::Udp => "UDP",
        };
        f.write_str(s)
    }
}

/// TLS protocol versions accepted in listener options.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
}

impl TlsVersion {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TLSv1_0" => Some(Self::Tls1_0),
            "TLSv1_1" => Some(Self::Tls1_1),
            "TLSv1_2" => Some(Self::Tls1_2),
            "TLSv1_3" => Some(Self::Tls1_3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tls1_0 => "TLSv1_0",
            Self::Tls1_1 => "TLSv1_1",
            Self::Tls1_2 => "TLSv1_2",
            Self::Tls1_3 => "TLSv1_3",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cipher suites the data plane accepts when TLS 1.2 or earlier is in play.
pub const SUPPORTED_CIPHER_SUITES: &[&str] = &[
    "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305",
    "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
    "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
    "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305",
    "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
    "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
];

/// Resolved TLS material and parameters for a listener.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsParams {
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    pub cipher_suites: Vec<String>,
    /// SDS resource names (secret URIs) for the certificates this listener
    /// serves. Only the first certificate reference is consumed.
    pub certificates: Vec<String>,
}

impl TlsParams {
    /// Applies the free-form listener option map on top of resolved
    /// certificates. Returns the message for a `Ready.Invalid` condition on
    /// the first bad option.
    pub fn from_options(
        certificates: Vec<String>,
        options: &BTreeMap<String, String>,
    ) -> Result<Self, String> {
        let mut params = TlsParams {
            certificates,
            ..Default::default()
        };

        if let Some(value) = options.get("tls_min_version") {
            params.min_version = Some(
                TlsVersion::parse(value)
                    .ok_or_else(|| format!("unsupported minimum TLS version: {value}"))?,
            );
        }
        if let Some(value) = options.get("tls_max_version") {
            params.max_version = Some(
                TlsVersion::parse(value)
                    .ok_or_else(|| format!("unsupported maximum TLS version: {value}"))?,
            );
        }
        if let Some(value) = options.get("tls_cipher_suites") {
            if params.min_version > Some(TlsVersion::Tls1_2) {
                return Err(
                    "configuring TLS cipher suites is only supported for TLS 1.2 and earlier"
                        .to_string(),
                );
            }
            for suite in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                if !SUPPORTED_CIPHER_SUITES.contains(&suite) {
                    return Err(format!("unsupported TLS cipher suite: {suite}"));
                }
                params.cipher_suites.push(suite.to_string());
            }
        }

        Ok(params)
    }
}

/// Which namespaces a listener accepts routes from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NamespacePolicy {
    #[default]
    Same,
    All,
    Selector(MetaSelector),
}

/// A label selector over route namespaces, mirroring the Kubernetes selector
/// semantics the k8s layer feeds in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaSelector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<MetaExpression>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaExpression {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl MetaSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
        for expression in &self.match_expressions {
            let value = labels.get(&expression.key);
            let ok = match expression.operator {
                SelectorOperator::In => {
                    value.is_some_and(|v| expression.values.iter().any(|e| e == v))
                }
                SelectorOperator::NotIn => {
                    !value.is_some_and(|v| expression.values.iter().any(|e| e == v))
                }
                SelectorOperator::Exists => value.is_some(),
                SelectorOperator::DoesNotExist => value.is_none(),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// Route admission policy for a listener.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowedRoutes {
    /// Explicitly allowed kinds. Empty means the protocol's supported kinds.
    pub kinds: Vec<RouteKind>,
    pub namespaces: NamespacePolicy,
}

impl AllowedRoutes {
    pub fn allows_kind(&self, protocol: Protocol, kind: RouteKind) -> bool {
        if !protocol.supported_route_kinds().contains(&kind) {
            return false;
        }
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    pub fn allows_namespace(
        &self,
        gateway_namespace: &str,
        route_namespace: &str,
        route_namespace_labels: &BTreeMap<String, String>,
    ) -> bool {
        match &self.namespaces {
            NamespacePolicy::Same => gateway_namespace == route_namespace,
            NamespacePolicy::All => true,
            NamespacePolicy::Selector(selector) => selector.matches(route_namespace_labels),
        }
    }
}

/// A single port/protocol slot on a gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    /// Unique within the gateway; defaults to `"default"`.
    pub name: String,
    /// `None`, `""`, and `"*"` are all wildcard.
    pub hostname: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
    pub tls: Option<TlsParams>,
    pub allowed: AllowedRoutes,
    pub conditions: ListenerConditions,
}

impl Listener {
    pub fn new(name: impl ToString, protocol: Protocol, port: u16) -> Self {
        Self {
            name: name.to_string(),
            hostname: None,
            port,
            protocol,
            tls: None,
            allowed: AllowedRoutes::default(),
            conditions: ListenerConditions::default(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.hostname.as_deref(), None | Some("") | Some("*"))
    }

    /// Whether any of the route's hostnames overlap this listener's hostname.
    /// Routes with no hostnames match every listener.
    pub fn hostname_matches(&self, route_hostnames: &[String]) -> bool {
        if self.is_wildcard() || route_hostnames.is_empty() {
            return true;
        }
        let hostname = self.hostname.as_deref().unwrap_or_default();
        route_hostnames
            .iter()
            .any(|candidate| hostnames_overlap(hostname, candidate))
    }
}

/// Hostname overlap with single-level wildcard support on either side:
/// `*.example.com` overlaps `a.example.com` and `*.example.com`, but not
/// `example.com` or `a.b.example.com` per the one-label wildcard rule.
pub fn hostnames_overlap(a: &str, b: &str) -> bool {
    fn wildcard_covers(pattern: &str, host: &str) -> bool {
        let suffix = &pattern[1..]; // ".example.com"
        match host.strip_prefix("*") {
            // Two wildcards overlap when either suffix contains the other.
            Some(host_suffix) => host_suffix.ends_with(suffix) || suffix.ends_with(host_suffix),
            None => {
                host.ends_with(suffix) && host.len() > suffix.len() && {
                    let label = &host[..host.len() - suffix.len()];
                    !label.contains('.')
                }
            }
        }
    }

    if a == b {
        return true;
    }
    match (a.starts_with("*."), b.starts_with("*.")) {
        (true, _) => wildcard_covers(a, b),
        (false, true) => wildcard_covers(b, a),
        (false, false) => false,
    }
}

/// A gateway as the store sees it: identity, configuration, and the state the
/// validator derived for the current generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gateway {
    pub id: GatewayId,
    /// Namespace of the originating Kubernetes object; listener `Same`
    /// namespace policies compare route namespaces against this.
    pub source_namespace: String,
    /// Provenance and free-form metadata (originating Kubernetes
    /// namespace/name, annotations the sync adapter should carry, ...).
    pub meta: BTreeMap<String, String>,
    /// Generation of the originating object; `Invalid` listener states are
    /// terminal for a single generation.
    pub generation: i64,
    pub listeners: Vec<Listener>,
    /// Addresses assigned to the gateway, deduplicated, in discovery order.
    pub addresses: Vec<String>,
    pub pod_ready: bool,
    pub service_ready: bool,
    pub conditions: GatewayConditions,
}

impl Gateway {
    pub fn new(id: GatewayId) -> Self {
        Self {
            id,
            source_namespace: String::new(),
            meta: BTreeMap::new(),
            generation: 0,
            listeners: Vec::new(),
            addresses: Vec::new(),
            pod_ready: false,
            service_ready: false,
            conditions: GatewayConditions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, convert_args};

    #[test]
    fn protocol_route_kind_table() {
        assert_eq!(Protocol::Http.supported_route_kinds(), &[RouteKind::Http]);
        assert_eq!(Protocol::Https.supported_route_kinds(), &[RouteKind::Http]);
        assert_eq!(Protocol::Tcp.supported_route_kinds(), &[RouteKind::Tcp]);
        assert_eq!(Protocol::Tls.supported_route_kinds(), &[RouteKind::Tcp]);
        assert!(Protocol::Udp.supported_route_kinds().is_empty());
    }

    #[test]
    fn tls_options_min_version() {
        let options = convert_args!(btreemap!("tls_min_version" => "TLSv1_2"));
        let params = TlsParams::from_options(vec!["k8s://default/cert".into()], &options).unwrap();
        assert_eq!(params.min_version, Some(TlsVersion::Tls1_2));
        assert_eq!(params.certificates, vec!["k8s://default/cert".to_string()]);
    }

    #[test]
    fn tls_options_reject_unknown_version() {
        let options = convert_args!(btreemap!("tls_min_version" => "TLSv1_9"));
        let error = TlsParams::from_options(Vec::new(), &options).unwrap_err();
        assert_eq!(error, "unsupported minimum TLS version: TLSv1_9");
    }

    #[test]
    fn tls_options_ciphers_require_tls12_or_earlier() {
        let options = convert_args!(btreemap!(
            "tls_min_version" => "TLSv1_3",
            "tls_cipher_suites" => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        ));
        let error = TlsParams::from_options(Vec::new(), &options).unwrap_err();
        assert_eq!(
            error,
            "configuring TLS cipher suites is only supported for TLS 1.2 and earlier"
        );
    }

    #[test]
    fn tls_options_validate_cipher_suites() {
        let options = convert_args!(btreemap!(
            "tls_cipher_suites" => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, TLS_BOGUS",
        ));
        let error = TlsParams::from_options(Vec::new(), &options).unwrap_err();
        assert_eq!(error, "unsupported TLS cipher suite: TLS_BOGUS");
    }

    #[test]
    fn hostname_overlap() {
        assert!(hostnames_overlap("example.com", "example.com"));
        assert!(hostnames_overlap("*.example.com", "a.example.com"));
        assert!(hostnames_overlap("a.example.com", "*.example.com"));
        assert!(hostnames_overlap("*.example.com", "*.example.com"));
        assert!(!hostnames_overlap("*.example.com", "example.com"));
        assert!(!hostnames_overlap("*.example.com", "a.b.example.com"));
        assert!(!hostnames_overlap("example.com", "other.com"));
    }

    #[test]
    fn wildcard_listener_matches_everything() {
        let mut listener = Listener::new("default", Protocol::Http, 80);
        assert!(listener.hostname_matches(&["anything.example.com".to_string()]));

        listener.hostname = Some("app.example.com".to_string());
        assert!(listener.hostname_matches(&[]));
        assert!(listener.hostname_matches(&["app.example.com".to_string()]));
        assert!(!listener.hostname_matches(&["other.example.com".to_string()]));
    }

    #[test]
    fn namespace_selector() {
        let selector = MetaSelector {
            match_labels: convert_args!(btreemap!("team" => "edge")),
            match_expressions: vec![MetaExpression {
                key: "env".to_string(),
                operator: SelectorOperator::In,
                values: vec!["prod".to_string(), "staging".to_string()],
            }],
        };
        let allowed = AllowedRoutes {
            kinds: Vec::new(),
            namespaces: NamespacePolicy::Selector(selector),
        };

        let labels = convert_args!(btreemap!("team" => "edge", "env" => "prod"));
        assert!(allowed.allows_namespace("gw-ns", "route-ns", &labels));

        let labels = convert_args!(btreemap!("team" => "edge"));
        assert!(!allowed.allows_namespace("gw-ns", "route-ns", &labels));
    }
}
