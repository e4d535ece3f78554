use std::fmt;

/// A user-data failure while resolving a reference (backend service or TLS
/// certificate). These never abort reconciliation; they accumulate and are
/// rendered as conditions.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    UnsupportedKind(String),

    /// Cross-namespace reference without a matching ReferenceGrant in the
    /// target namespace.
    #[error("{0}")]
    RefNotPermitted(String),

    #[error("{0}")]
    Generic(String),
}

/// Accumulates resolution errors across all of a route's backend references.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolutionErrors(Vec<ResolutionError>);

impl ResolutionErrors {
    pub fn push(&mut self, error: ResolutionError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&ResolutionError> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolutionError> {
        self.0.iter()
    }
}

impl fmt::Display for ResolutionErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", error)?;
            first = false;
        }
        Ok(())
    }
}

/// Why a route failed to bind to any listener of a gateway it referenced.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("route kind not allowed by any listener")]
    RouteKindNotAllowed,

    #[error("route namespace not allowed by any listener")]
    NamespaceNotAllowed,

    #[error("no listener hostname matches the route hostnames")]
    NoMatchingHostname,

    #[error("no listener named {0:?}")]
    NoMatchingListener(String),

    #[error("gateway has no listeners ready to bind")]
    NoUsableListeners,
}
