//! ReferenceGrant summaries and cross-namespace checks.
//!
//! A grant lives in the *target* namespace and enumerates which
//! `(group, kind, namespace)` origins may reference which `(group, kind,
//! name?)` targets. Both the TLS certificate path (Gateway → Secret) and the
//! backend path (route → Service) funnel through [`grant_allows`].

use consul_gateway_controller_k8s_api::{gateway, group_matches};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrantSummary {
    pub from: Vec<GrantFrom>,
    pub to: Vec<GrantTo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantFrom {
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrantTo {
    pub group: String,
    pub kind: String,
    pub name: Option<String>,
}

impl From<gateway::ReferenceGrantSpec> for GrantSummary {
    fn from(spec: gateway::ReferenceGrantSpec) -> Self {
        Self {
            from: spec
                .from
                .into_iter()
                .map(|from| GrantFrom {
                    group: from.group,
                    kind: from.kind,
                    namespace: from.namespace,
                })
                .collect(),
            to: spec
                .to
                .into_iter()
                .map(|to| GrantTo {
                    group: to.group,
                    kind: to.kind,
                    name: to.name,
                })
                .collect(),
        }
    }
}

/// Whether any grant in the target namespace permits `from_kind` objects in
/// `from_namespace` to reference the named target object.
pub fn grant_allows(
    grants: &[GrantSummary],
    from_group: &str,
    from_kind: &str,
    from_namespace: &str,
    to_group: &str,
    to_kind: &str,
    to_name: &str,
) -> bool {
    grants.iter().any(|grant| {
        let from_ok = grant.from.iter().any(|from| {
            group_matches(&from.group, Some(from_group))
                && from.kind == from_kind
                && from.namespace == from_namespace
        });
        let to_ok = grant.to.iter().any(|to| {
            group_matches(&to.group, Some(to_group))
                && to.kind == to_kind
                && to.name.as_deref().map(|name| name == to_name).unwrap_or(true)
        });
        from_ok && to_ok
    })
}
