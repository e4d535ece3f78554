//! Route validation and normalization.
//!
//! HTTP and TCP routes are converted into the core model: matches are
//! canonicalized (default path prefix `/`, parsed methods, validated
//! regexes), weights default to 1, and every backend reference passes the
//! cross-namespace ReferenceGrant check *before* resolution is attempted. A
//! reference denied by the grant check is never handed to the resolver.

use crate::{index::ResourceId, reference_grant::grant_allows, reference_grant::GrantSummary, ClusterConfig};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, Result};
use consul_gateway_controller_core::{
    self as core, BackendResolver, GatewayId, HeaderMatch, HeaderModifier, HttpFilter, HttpMatch,
    HttpPathModifier, HttpRedirect, HttpUrlRewrite, Method, ParentRef, PathMatch, QueryParamMatch,
    ResolutionError, ResolutionErrors, Route, WeightedBackend,
};
use consul_gateway_controller_k8s_api::{backend_ref_is_service, gateway};
use std::collections::BTreeMap;

const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";

/// Snapshot of the index state route validation needs, captured before any
/// await so the index lock is never held across I/O.
#[derive(Clone, Debug, Default)]
pub(crate) struct RouteContext {
    pub namespace_labels: BTreeMap<String, String>,
    pub grants: HashMap<String, Vec<GrantSummary>>,
}

impl RouteContext {
    fn grants_in<'a>(&'a self, namespace: &str) -> &'a [GrantSummary] {
        self.grants
            .get(namespace)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

pub(crate) fn http_route_id(id: &ResourceId) -> String {
    format!("http/{}/{}", id.namespace, id.name)
}

pub(crate) fn tcp_route_id(id: &ResourceId) -> String {
    format!("tcp/{}/{}", id.namespace, id.name)
}

pub(crate) async fn validate_http<R: BackendResolver>(
    config: &ClusterConfig,
    id: &ResourceId,
    route: gateway::HttpRoute,
    context: &RouteContext,
    resolver: &R,
) -> Result<Route> {
    let mut common = core::CommonRoute::new(http_route_id(id), &id.name, &id.namespace);
    common.generation = route.metadata.generation.unwrap_or_default();
    common.namespace_labels = context.namespace_labels.clone();
    common.parent_refs = parent_refs(config, route.spec.inner.parent_refs);

    let hostnames: Vec<String> = route.spec.hostnames.into_iter().flatten().collect();

    let mut errors = ResolutionErrors::default();
    let mut rules = Vec::new();
    for rule in route.spec.rules.into_iter().flatten() {
        let matches = rule
            .matches
            .into_iter()
            .flatten()
            .map(convert::http_match)
            .collect::<Result<Vec<_>>>()?;

        let filters = rule
            .filters
            .into_iter()
            .flatten()
            .filter_map(|filter| convert_filter(filter, &mut errors))
            .collect();

        let mut backends = Vec::new();
        for backend_ref in rule.backend_refs.into_iter().flatten() {
            let Some(backend) = backend_ref.backend_ref else {
                continue;
            };
            let backend_filters = backend_ref
                .filters
                .into_iter()
                .flatten()
                .filter_map(|filter| convert_filter(filter, &mut errors))
                .collect::<Vec<_>>();

            match resolve_backend(
                "HTTPRoute",
                &id.namespace,
                &backend.inner,
                context,
                resolver,
            )
            .await?
            {
                Ok(service) => {
                    let mut weighted = WeightedBackend::new(service);
                    weighted.weight = backend.weight.unwrap_or(1);
                    weighted.filters = backend_filters;
                    backends.push(weighted);
                }
                Err(error) => errors.push(error),
            }
        }

        rules.push(core::HttpRouteRule {
            matches,
            filters,
            backends,
        });
    }
    common.resolution_errors = errors;

    Ok(Route::Http(core::HttpRoute {
        common,
        hostnames,
        rules,
    }))
}

pub(crate) async fn validate_tcp<R: BackendResolver>(
    config: &ClusterConfig,
    id: &ResourceId,
    route: gateway::TcpRoute,
    context: &RouteContext,
    resolver: &R,
) -> Result<Route> {
    let mut common = core::CommonRoute::new(tcp_route_id(id), &id.name, &id.namespace);
    common.generation = route.metadata.generation.unwrap_or_default();
    common.namespace_labels = context.namespace_labels.clone();
    common.parent_refs = parent_refs(config, route.spec.inner.parent_refs);

    let mut errors = ResolutionErrors::default();
    let mut backend = None;

    let single_rule = match route.spec.rules.as_slice() {
        [rule] if rule.backend_refs.len() == 1 => Some(&rule.backend_refs[0]),
        _ => None,
    };
    match single_rule {
        Some(backend_ref) => {
            match resolve_backend(
                "TCPRoute",
                &id.namespace,
                &backend_ref.inner,
                context,
                resolver,
            )
            .await?
            {
                Ok(service) => backend = Some(service),
                Err(error) => errors.push(error),
            }
        }
        None => errors.push(ResolutionError::Generic(
            "TCPRoute must have exactly one rule with exactly one backend".to_string(),
        )),
    }
    common.resolution_errors = errors;

    Ok(Route::Tcp(core::TcpRoute { common, backend }))
}

/// Grant-gated backend resolution. Returns `Err` only for infrastructure
/// failures from the resolver; user-data failures come back as
/// `ResolutionError` values for the condition machinery.
async fn resolve_backend<R: BackendResolver>(
    route_kind: &str,
    route_namespace: &str,
    backend: &gateway::BackendObjectReference,
    context: &RouteContext,
    resolver: &R,
) -> Result<std::result::Result<core::ResolvedService, ResolutionError>> {
    if !backend_ref_is_service(backend) {
        return Ok(Err(ResolutionError::UnsupportedKind(format!(
            "backend {} is not a Service",
            backend.name
        ))));
    }

    let target_namespace = backend.namespace.as_deref();
    if let Some(target) = target_namespace {
        if target != route_namespace {
            let allowed = grant_allows(
                context.grants_in(target),
                GATEWAY_API_GROUP,
                route_kind,
                route_namespace,
                "",
                "Service",
                &backend.name,
            );
            if !allowed {
                return Ok(Err(ResolutionError::RefNotPermitted(format!(
                    "no ReferenceGrant in {target} permits backend {}",
                    backend.name
                ))));
            }
        }
    }

    resolver
        .resolve(route_namespace, "Service", &backend.name, target_namespace)
        .await
}

fn parent_refs(
    config: &ClusterConfig,
    refs: Option<Vec<gateway::ParentReference>>,
) -> Vec<ParentRef> {
    refs.into_iter()
        .flatten()
        .filter(|parent| {
            parent
                .kind
                .as_deref()
                .map(|kind| kind == "Gateway")
                .unwrap_or(true)
                && parent
                    .group
                    .as_deref()
                    .map(|group| group.is_empty() || group == GATEWAY_API_GROUP)
                    .unwrap_or(true)
                && !parent.name.is_empty()
        })
        .map(|parent| {
            let mut parent_ref =
                ParentRef::new(GatewayId::new(&config.consul_namespace, parent.name));
            if let Some(section) = parent.section_name {
                parent_ref = parent_ref.with_section(section);
            }
            parent_ref
        })
        .collect()
}

/// Converts a filter, accumulating a resolution error for filter types the
/// data plane cannot express.
fn convert_filter(
    filter: gateway::HttpRouteFilter,
    errors: &mut ResolutionErrors,
) -> Option<HttpFilter> {
    match convert::filter(filter) {
        Ok(filter) => Some(filter),
        Err(error) => {
            errors.push(ResolutionError::UnsupportedKind(error.to_string()));
            None
        }
    }
}

mod convert {
    use super::*;
    use anyhow::bail;

    pub(super) fn http_match(m: gateway::HttpRouteMatch) -> Result<HttpMatch> {
        let path = m.path.map(path_match).transpose()?;
        let headers = m
            .headers
            .into_iter()
            .flatten()
            .map(header_match)
            .collect::<Result<_>>()?;
        let query_params = m
            .query_params
            .into_iter()
            .flatten()
            .map(query_param_match)
            .collect::<Result<_>>()?;
        let method = m
            .method
            .as_deref()
            .map(Method::try_from)
            .transpose()
            .map_err(|error| anyhow!("invalid method: {error}"))?;

        Ok(HttpMatch {
            path: path.unwrap_or(PathMatch::Prefix("/".to_string())),
            headers,
            query_params,
            method,
        })
    }

    pub(super) fn path_match(path: gateway::HttpPathMatch) -> Result<PathMatch> {
        match path {
            gateway::HttpPathMatch::Exact { value } | gateway::HttpPathMatch::PathPrefix { value }
                if !value.starts_with('/') =>
            {
                bail!("paths must be absolute (begin with `/`); {value:?} is not")
            }
            gateway::HttpPathMatch::Exact { value } => Ok(PathMatch::Exact(value)),
            gateway::HttpPathMatch::PathPrefix { value } => Ok(PathMatch::Prefix(value)),
            gateway::HttpPathMatch::RegularExpression { value } => {
                regex::Regex::new(&value)
                    .map_err(|error| anyhow!("invalid path regex: {error}"))?;
                Ok(PathMatch::Regex(value))
            }
        }
    }

    pub(super) fn header_match(header: gateway::HttpHeaderMatch) -> Result<HeaderMatch> {
        match header {
            gateway::HttpHeaderMatch::Exact { name, value } => Ok(HeaderMatch::Exact(name, value)),
            gateway::HttpHeaderMatch::RegularExpression { name, value } => {
                regex::Regex::new(&value)
                    .map_err(|error| anyhow!("invalid header regex: {error}"))?;
                Ok(HeaderMatch::Regex(name, value))
            }
        }
    }

    pub(super) fn query_param_match(
        query_param: gateway::HttpQueryParamMatch,
    ) -> Result<QueryParamMatch> {
        match query_param {
            gateway::HttpQueryParamMatch::Exact { name, value } => {
                Ok(QueryParamMatch::Exact(name, value))
            }
            gateway::HttpQueryParamMatch::RegularExpression { name, value } => {
                regex::Regex::new(&value)
                    .map_err(|error| anyhow!("invalid query param regex: {error}"))?;
                Ok(QueryParamMatch::Regex(name, value))
            }
        }
    }

    pub(super) fn filter(filter: gateway::HttpRouteFilter) -> Result<HttpFilter> {
        match filter {
            gateway::HttpRouteFilter::RequestHeaderModifier {
                request_header_modifier,
            } => Ok(HttpFilter::HeaderModifier(header_modifier(
                request_header_modifier,
            ))),
            gateway::HttpRouteFilter::RequestRedirect { request_redirect } => {
                Ok(HttpFilter::Redirect(redirect(request_redirect)))
            }
            gateway::HttpRouteFilter::URLRewrite { url_rewrite } => {
                Ok(HttpFilter::UrlRewrite(rewrite(url_rewrite)?))
            }
            gateway::HttpRouteFilter::RequestMirror { .. } => {
                bail!("RequestMirror filters are not supported")
            }
            gateway::HttpRouteFilter::ExtensionRef { .. } => {
                bail!("ExtensionRef filters are not supported")
            }
            gateway::HttpRouteFilter::ResponseHeaderModifier { .. } => {
                bail!("ResponseHeaderModifier filters are not supported")
            }
        }
    }

    fn header_modifier(filter: gateway::HttpRequestHeaderFilter) -> HeaderModifier {
        HeaderModifier {
            set: filter
                .set
                .into_iter()
                .flatten()
                .map(|header| (header.name, header.value))
                .collect(),
            add: filter
                .add
                .into_iter()
                .flatten()
                .map(|header| (header.name, header.value))
                .collect(),
            remove: filter.remove.into_iter().flatten().collect(),
        }
    }

    fn redirect(filter: gateway::HttpRequestRedirectFilter) -> HttpRedirect {
        HttpRedirect {
            scheme: filter.scheme,
            hostname: filter.hostname,
            port: filter.port,
            status: filter.status_code,
        }
    }

    fn rewrite(filter: gateway::HttpUrlRewriteFilter) -> Result<HttpUrlRewrite> {
        Ok(HttpUrlRewrite {
            hostname: filter.hostname,
            path: filter.path.map(path_modifier).transpose()?,
        })
    }

    fn path_modifier(modifier: gateway::HttpPathModifier) -> Result<HttpPathModifier> {
        use gateway::HttpPathModifier::*;
        match modifier {
            ReplaceFullPath { replace_full_path: ref path }
            | ReplacePrefixMatch { replace_prefix_match: ref path }
                if !path.starts_with('/') =>
            {
                bail!("rewrite paths must be absolute (begin with `/`); {path:?} is not")
            }
            ReplaceFullPath { replace_full_path: path } => Ok(HttpPathModifier::Full(path)),
            ReplacePrefixMatch { replace_prefix_match: path } => {
                Ok(HttpPathModifier::Prefix(path))
            }
        }
    }
}
