//! Listener binding predicates.
//!
//! A route binds to at most one listener per gateway: listeners are walked in
//! declaration order and the first one that accepts wins. The predicates are
//! pure so they can be exercised without a store.

use consul_gateway_controller_core::{BindError, Gateway, Listener, Route};

/// The outcome of evaluating a single listener against a route.
enum ListenerVerdict {
    Accept,
    Reject(BindError),
}

/// Attempts to bind `route` to one of `gateway`'s listeners, honoring the
/// parent reference's optional section name. Returns the index and name of
/// the accepting listener.
pub(crate) fn try_bind(
    gateway: &Gateway,
    section_name: Option<&str>,
    route: &Route,
) -> Result<(usize, String), BindError> {
    let mut best: Option<BindError> = None;
    let mut section_seen = false;

    for (index, listener) in gateway.listeners.iter().enumerate() {
        if let Some(section) = section_name {
            if listener.name != section {
                continue;
            }
            section_seen = true;
        }

        match evaluate(gateway, listener, route) {
            ListenerVerdict::Accept => return Ok((index, listener.name.clone())),
            ListenerVerdict::Reject(error) => {
                best = Some(match best.take() {
                    Some(previous) if precedence(&previous) >= precedence(&error) => previous,
                    _ => error,
                });
            }
        }
    }

    if let Some(section) = section_name {
        if !section_seen {
            return Err(BindError::NoMatchingListener(section.to_string()));
        }
    }

    Err(best.unwrap_or(BindError::NoUsableListeners))
}

fn evaluate(gateway: &Gateway, listener: &Listener, route: &Route) -> ListenerVerdict {
    if !listener.conditions.usable() {
        return ListenerVerdict::Reject(BindError::NoUsableListeners);
    }
    if !listener.allowed.allows_kind(listener.protocol, route.kind()) {
        return ListenerVerdict::Reject(BindError::RouteKindNotAllowed);
    }
    let common = route.common();
    if !listener.allowed.allows_namespace(
        &gateway.source_namespace,
        &common.namespace,
        &common.namespace_labels,
    ) {
        return ListenerVerdict::Reject(BindError::NamespaceNotAllowed);
    }
    if !listener.hostname_matches(route.hostnames()) {
        return ListenerVerdict::Reject(BindError::NoMatchingHostname);
    }
    ListenerVerdict::Accept
}

/// More specific failures win when no listener accepts: a hostname mismatch
/// tells the user more than "no listener was usable".
fn precedence(error: &BindError) -> u8 {
    match error {
        BindError::NoMatchingHostname => 4,
        BindError::NamespaceNotAllowed => 3,
        BindError::RouteKindNotAllowed => 2,
        BindError::NoMatchingListener(_) => 1,
        BindError::NoUsableListeners => 0,
    }
}
