#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The SDS server: streams named TLS secrets to Envoy proxies.
//!
//! Secrets are identified by opaque URIs (`k8s://`, `vault-pki://`,
//! `vault-kv://`); a [`MultiSecretClient`] dispatches fetches by scheme, a
//! linear [`SecretCache`] holds versioned entries, and the gRPC server
//! pushes new versions to every stream subscribed to an updated name.

mod cache;
mod client;
mod k8s;
mod server;
mod vault;

pub use self::{
    cache::{CachedSecret, SecretCache},
    client::{Certificate, MultiSecretClient, SecretClient},
    k8s::K8sSecretClient,
    server::SdsServer,
    vault::{VaultKvClient, VaultPkiClient},
};

/// Type URL under which secrets are streamed.
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";
