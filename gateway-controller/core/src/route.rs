use crate::{
    errors::ResolutionErrors,
    gateway::RouteKind,
    GatewayId, ResolvedService,
};
pub use http::Method;
use std::collections::BTreeMap;

/// A reference from a route to a gateway it wants to attach to, optionally
/// narrowed to a single listener by section name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParentRef {
    pub gateway: GatewayId,
    pub section_name: Option<String>,
}

impl ParentRef {
    pub fn new(gateway: GatewayId) -> Self {
        Self {
            gateway,
            section_name: None,
        }
    }

    pub fn with_section(mut self, section_name: impl ToString) -> Self {
        self.section_name = Some(section_name.to_string());
        self
    }
}

/// The header shared by every route variant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommonRoute {
    /// Stable identifier, unique across the store.
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub meta: BTreeMap<String, String>,
    /// Labels on the route's namespace, used by listener namespace selectors.
    pub namespace_labels: BTreeMap<String, String>,
    pub parent_refs: Vec<ParentRef>,
    pub generation: i64,
    /// User-data failures accumulated during backend resolution.
    pub resolution_errors: ResolutionErrors,
}

impl CommonRoute {
    pub fn new(id: impl ToString, name: impl ToString, namespace: impl ToString) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }
}

/// Routes are a closed union; the validators and the binding engine know
/// every variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Http(HttpRoute),
    Tcp(TcpRoute),
}

impl Route {
    pub fn common(&self) -> &CommonRoute {
        match self {
            Self::Http(route) => &route.common,
            Self::Tcp(route) => &route.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut CommonRoute {
        match self {
            Self::Http(route) => &mut route.common,
            Self::Tcp(route) => &mut route.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn kind(&self) -> RouteKind {
        match self {
            Self::Http(_) => RouteKind::Http,
            Self::Tcp(_) => RouteKind::Tcp,
        }
    }

    /// Hostnames the route wants to serve; TCP routes have none.
    pub fn hostnames(&self) -> &[String] {
        match self {
            Self::Http(route) => &route.hostnames,
            Self::Tcp(_) => &[],
        }
    }
}

/// A normalized HTTP route: matches canonicalized, defaults applied, and
/// backends resolved to mesh services.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRoute {
    pub common: CommonRoute,
    pub hostnames: Vec<String>,
    pub rules: Vec<HttpRouteRule>,
}

impl HttpRoute {
    pub fn new(id: impl ToString, name: impl ToString, namespace: impl ToString) -> Self {
        Self {
            common: CommonRoute::new(id, name, namespace),
            hostnames: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.common.parent_refs.push(parent);
        self
    }

    pub fn with_hostname(mut self, hostname: impl ToString) -> Self {
        self.hostnames.push(hostname.to_string());
        self
    }

    pub fn with_rule(mut self, rule: HttpRouteRule) -> Self {
        self.rules.push(rule);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRouteRule {
    pub matches: Vec<HttpMatch>,
    pub filters: Vec<HttpFilter>,
    pub backends: Vec<WeightedBackend>,
}

impl HttpRouteRule {
    pub fn forwarding_to(service: ResolvedService) -> Self {
        Self {
            matches: Vec::new(),
            filters: Vec::new(),
            backends: vec![WeightedBackend::new(service)],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpMatch {
    pub path: PathMatch,
    pub headers: Vec<HeaderMatch>,
    pub query_params: Vec<QueryParamMatch>,
    pub method: Option<Method>,
}

impl Default for HttpMatch {
    fn default() -> Self {
        Self {
            path: PathMatch::Prefix("/".to_string()),
            headers: Vec::new(),
            query_params: Vec::new(),
            method: None,
        }
    }
}

/// Path match. The regex variant carries the pattern verbatim; the data plane
/// compiles it, the validator only checks it parses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderMatch {
    Exact(String, String),
    Regex(String, String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryParamMatch {
    Exact(String, String),
    Regex(String, String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpFilter {
    HeaderModifier(HeaderModifier),
    Redirect(HttpRedirect),
    UrlRewrite(HttpUrlRewrite),
}

/// Header mutations applied before forwarding. `set` and `add` default to
/// empty maps rather than being optional.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderModifier {
    pub set: BTreeMap<String, String>,
    pub add: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRedirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub status: Option<u16>,
}

/// URL rewrite; defaults to the identity rewrite.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpUrlRewrite {
    pub hostname: Option<String>,
    pub path: Option<HttpPathModifier>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpPathModifier {
    Full(String),
    Prefix(String),
}

/// A resolved backend with its traffic weight (defaulting to 1) and optional
/// per-backend filters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedBackend {
    pub service: ResolvedService,
    pub weight: u16,
    pub filters: Vec<HttpFilter>,
}

impl WeightedBackend {
    pub fn new(service: ResolvedService) -> Self {
        Self {
            service,
            weight: 1,
            filters: Vec::new(),
        }
    }

    pub fn with_weight(mut self, weight: u16) -> Self {
        self.weight = weight;
        self
    }
}

/// A TCP route forwards every connection to exactly one backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpRoute {
    pub common: CommonRoute,
    /// `None` when the single-backend rule failed validation; the error is
    /// recorded in `common.resolution_errors`.
    pub backend: Option<ResolvedService>,
}

impl TcpRoute {
    pub fn new(id: impl ToString, name: impl ToString, namespace: impl ToString) -> Self {
        Self {
            common: CommonRoute::new(id, name, namespace),
            backend: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.common.parent_refs.push(parent);
        self
    }

    pub fn with_backend(mut self, service: ResolvedService) -> Self {
        self.backend = Some(service);
        self
    }
}
