use consul_gateway_controller_core::{
    BindError, Condition, GatewayId, Route, RouteAccepted, RouteResolvedRefs,
};
use std::collections::BTreeMap;

/// A route as held by the store: the validated snapshot plus the binding
/// outcome against every gateway its parent references name.
#[derive(Debug)]
pub struct RouteEntry {
    pub route: Route,
    pub bound: BTreeMap<GatewayId, BindOutcome>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    /// Bound to the named listener.
    Bound(String),
    Failed(BindError),
    GatewayNotFound,
}

/// Per-parent status of a route, consumed by the status controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteStatus {
    pub id: String,
    pub generation: i64,
    pub parents: Vec<(GatewayId, Condition<RouteAccepted>)>,
    pub resolved_refs: Condition<RouteResolvedRefs>,
}

impl RouteEntry {
    pub fn new(route: Route) -> Self {
        Self {
            route,
            bound: BTreeMap::new(),
        }
    }

    /// Forgets a gateway entirely, e.g. when it is deleted, so the route's
    /// status no longer reports a parent that does not exist.
    pub fn on_gateway_removed(&mut self, id: &GatewayId) {
        self.bound.remove(id);
    }

    pub fn status(&self) -> RouteStatus {
        let parents = self
            .route
            .common()
            .parent_refs
            .iter()
            .map(|parent| {
                let accepted = match self.bound.get(&parent.gateway) {
                    Some(BindOutcome::Bound(_)) => Condition::active(RouteAccepted::Accepted),
                    Some(BindOutcome::Failed(error)) => bind_error_condition(error),
                    Some(BindOutcome::GatewayNotFound) | None => {
                        Condition::inactive(RouteAccepted::GatewayNotFound)
                    }
                };
                (parent.gateway.clone(), accepted)
            })
            .collect();

        RouteStatus {
            id: self.route.id().to_string(),
            generation: self.route.common().generation,
            parents,
            resolved_refs: RouteResolvedRefs::from_errors(
                &self.route.common().resolution_errors,
            ),
        }
    }
}

fn bind_error_condition(error: &BindError) -> Condition<RouteAccepted> {
    match error {
        BindError::NoMatchingHostname => Condition::new(
            false,
            RouteAccepted::NoMatchingListenerHostname,
            error.to_string(),
        ),
        BindError::RouteKindNotAllowed | BindError::NamespaceNotAllowed => {
            Condition::new(false, RouteAccepted::NotAllowedByListeners, error.to_string())
        }
        BindError::NoMatchingListener(_) | BindError::NoUsableListeners => {
            Condition::new(false, RouteAccepted::BindError, error.to_string())
        }
    }
}
