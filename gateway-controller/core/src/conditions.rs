//! Condition sets for gateways, listeners, and routes.
//!
//! Conditions are the only channel through which user-data problems surface:
//! validators record them and keep going, and the status controller renders
//! them onto the originating Kubernetes objects. Reasons are closed enums so
//! that every reason string written to a status is known at compile time.

use crate::errors::{ResolutionError, ResolutionErrors};
use std::fmt;

/// A single condition: a boolean status, a typed reason, and an optional
/// human-readable message carrying detail the reason alone cannot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition<R> {
    pub status: bool,
    pub reason: R,
    pub message: String,
}

impl<R> Condition<R> {
    pub fn new(status: bool, reason: R, message: impl ToString) -> Self {
        Self {
            status,
            reason,
            message: message.to_string(),
        }
    }

    pub fn active(reason: R) -> Self
    where
        R: fmt::Display,
    {
        let message = reason.to_string();
        Self {
            status: true,
            reason,
            message,
        }
    }

    pub fn inactive(reason: R) -> Self
    where
        R: fmt::Display,
    {
        let message = reason.to_string();
        Self {
            status: false,
            reason,
            message,
        }
    }
}

macro_rules! reasons {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

reasons! {
    /// Why a gateway is (or is not) scheduled onto a pod.
    GatewayScheduled {
        Scheduled => "Scheduled",
        NotReconciled => "NotReconciled",
        PodFailed => "PodFailed",
        NoResources => "NoResources",
        Unknown => "Unknown",
    }
}

reasons! {
    GatewayReady {
        Ready => "Ready",
        ListenersNotValid => "ListenersNotValid",
        ListenersNotReady => "ListenersNotReady",
        AddressNotAssigned => "AddressNotAssigned",
    }
}

reasons! {
    GatewayInSync {
        InSync => "InSync",
        SyncError => "SyncError",
    }
}

reasons! {
    ListenerConflicted {
        NoConflicts => "NoConflicts",
        ProtocolConflict => "ProtocolConflict",
        HostnameConflict => "HostnameConflict",
    }
}

reasons! {
    ListenerDetached {
        Attached => "Attached",
        UnsupportedProtocol => "UnsupportedProtocol",
        InvalidRouteKinds => "InvalidRouteKinds",
    }
}

reasons! {
    ListenerReady {
        Ready => "Ready",
        Invalid => "Invalid",
        Pending => "Pending",
    }
}

reasons! {
    ListenerResolvedRefs {
        ResolvedRefs => "ResolvedRefs",
        InvalidCertificateRef => "InvalidCertificateRef",
        RefNotPermitted => "RefNotPermitted",
    }
}

reasons! {
    RouteAccepted {
        Accepted => "Accepted",
        NotAllowedByListeners => "NotAllowedByListeners",
        NoMatchingListenerHostname => "NoMatchingListenerHostname",
        GatewayNotFound => "GatewayNotFound",
        BindError => "BindError",
    }
}

reasons! {
    RouteResolvedRefs {
        ResolvedRefs => "ResolvedRefs",
        RefNotPermitted => "RefNotPermitted",
        BackendNotFound => "BackendNotFound",
        InvalidKind => "InvalidKind",
    }
}

/// Gateway-level condition set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConditions {
    pub scheduled: Condition<GatewayScheduled>,
    pub ready: Condition<GatewayReady>,
    pub in_sync: Condition<GatewayInSync>,
}

impl Default for GatewayConditions {
    fn default() -> Self {
        Self {
            scheduled: Condition::inactive(GatewayScheduled::NotReconciled),
            ready: Condition::inactive(GatewayReady::ListenersNotReady),
            in_sync: Condition::inactive(GatewayInSync::InSync),
        }
    }
}

/// Per-listener condition set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerConditions {
    pub conflicted: Condition<ListenerConflicted>,
    pub detached: Condition<ListenerDetached>,
    pub ready: Condition<ListenerReady>,
    pub resolved_refs: Condition<ListenerResolvedRefs>,
}

impl Default for ListenerConditions {
    fn default() -> Self {
        Self {
            conflicted: Condition::inactive(ListenerConflicted::NoConflicts),
            detached: Condition::inactive(ListenerDetached::Attached),
            ready: Condition::active(ListenerReady::Pending),
            resolved_refs: Condition::active(ListenerResolvedRefs::ResolvedRefs),
        }
    }
}

impl ListenerConditions {
    /// A listener is eligible for binding and syncing only once it is ready
    /// and unconflicted.
    pub fn usable(&self) -> bool {
        !self.conflicted.status
            && !self.detached.status
            && self.ready.status
            && self.ready.reason == ListenerReady::Ready
    }

    pub fn invalid(&self) -> bool {
        self.ready.reason == ListenerReady::Invalid
            || self.conflicted.status
            || self.detached.status
            || !self.resolved_refs.status
    }

    pub fn pending(&self) -> bool {
        self.ready.reason == ListenerReady::Pending
    }
}

impl RouteResolvedRefs {
    /// Derives the condition reason for a route from its accumulated
    /// resolution errors. The first error wins; `RefNotPermitted` is kept
    /// distinct so that cross-namespace denials are identifiable.
    pub fn from_errors(errors: &ResolutionErrors) -> Condition<Self> {
        match errors.first() {
            None => Condition::active(Self::ResolvedRefs),
            Some(ResolutionError::RefNotPermitted(message)) => {
                Condition::new(false, Self::RefNotPermitted, message)
            }
            Some(ResolutionError::NotFound(message)) => {
                Condition::new(false, Self::BackendNotFound, message)
            }
            Some(ResolutionError::UnsupportedKind(message)) => {
                Condition::new(false, Self::InvalidKind, message)
            }
            Some(ResolutionError::Generic(message)) => {
                Condition::new(false, Self::BackendNotFound, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listener_is_pending() {
        let conditions = ListenerConditions::default();
        assert!(conditions.pending());
        assert!(!conditions.usable());
        assert!(!conditions.invalid());
    }

    #[test]
    fn resolution_errors_map_to_reasons() {
        let mut errors = ResolutionErrors::default();
        assert_eq!(
            RouteResolvedRefs::from_errors(&errors).reason,
            RouteResolvedRefs::ResolvedRefs
        );

        errors.push(ResolutionError::RefNotPermitted(
            "route cannot reference backend in another namespace".into(),
        ));
        let condition = RouteResolvedRefs::from_errors(&errors);
        assert!(!condition.status);
        assert_eq!(condition.reason, RouteResolvedRefs::RefNotPermitted);
    }
}
