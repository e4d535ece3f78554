//! Secret fetching, dispatched by URI scheme.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use envoy_types::pb::envoy::config::core::v3::{data_source::Specifier, DataSource};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    secret, Secret, TlsCertificate,
};
use std::collections::HashMap;
use std::sync::Arc;

/// TLS material as returned by a secret backend: PEM chain and key plus the
/// leaf's expiry when the backend knows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub name: String,
    pub chain: String,
    pub private_key: String,
    pub expiry: Option<DateTime<Utc>>,
}

impl Certificate {
    /// Renders the certificate as the Envoy secret streamed over SDS.
    pub fn to_secret(&self) -> Secret {
        Secret {
            name: self.name.clone(),
            r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
                certificate_chain: Some(DataSource {
                    specifier: Some(Specifier::InlineString(self.chain.clone())),
                    ..Default::default()
                }),
                private_key: Some(DataSource {
                    specifier: Some(Specifier::InlineString(self.private_key.clone())),
                    ..Default::default()
                }),
                ..Default::default()
            })),
        }
    }
}

#[async_trait::async_trait]
pub trait SecretClient: Send + Sync + 'static {
    /// Fetches the secret identified by the full resource name.
    async fn fetch(&self, name: &str) -> Result<Certificate>;
}

/// Splits `scheme://opaque` and returns the scheme.
pub(crate) fn scheme_of(name: &str) -> Result<&str> {
    name.split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| anyhow!("secret name {name:?} is not a scheme-prefixed URI"))
}

/// Dispatches fetches to the client registered for the name's scheme.
#[derive(Default)]
pub struct MultiSecretClient {
    clients: HashMap<String, Arc<dyn SecretClient>>,
}

impl MultiSecretClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, scheme: impl ToString, client: Arc<dyn SecretClient>) -> Self {
        self.clients.insert(scheme.to_string(), client);
        self
    }
}

#[async_trait::async_trait]
impl SecretClient for MultiSecretClient {
    async fn fetch(&self, name: &str) -> Result<Certificate> {
        let scheme = scheme_of(name)?;
        match self.clients.get(scheme) {
            Some(client) => client.fetch(name).await,
            None => bail!("no secret client registered for scheme {scheme:?}"),
        }
    }
}

/// Extracts `NotAfter` from the first certificate of a PEM chain.
pub(crate) fn chain_expiry(chain: &str) -> Option<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(chain.as_bytes()).ok()?;
    let cert = pem.parse_x509().ok()?;
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticClient(&'static str);

    #[async_trait::async_trait]
    impl SecretClient for StaticClient {
        async fn fetch(&self, name: &str) -> Result<Certificate> {
            Ok(Certificate {
                name: name.to_string(),
                chain: self.0.to_string(),
                private_key: "key".to_string(),
                expiry: None,
            })
        }
    }

    #[tokio::test]
    async fn dispatches_by_scheme() {
        let multi = MultiSecretClient::new()
            .register("k8s", Arc::new(StaticClient("from-k8s")))
            .register("vault-kv", Arc::new(StaticClient("from-vault")));

        let cert = multi.fetch("k8s://default/cert").await.unwrap();
        assert_eq!(cert.chain, "from-k8s");

        let cert = multi.fetch("vault-kv://secret/tls#crt,key").await.unwrap();
        assert_eq!(cert.chain, "from-vault");

        let error = multi.fetch("vault-pki://pki/role/cn").await.unwrap_err();
        assert!(error.to_string().contains("no secret client registered"));

        let error = multi.fetch("not-a-uri").await.unwrap_err();
        assert!(error.to_string().contains("scheme-prefixed"));
    }

    #[test]
    fn certificates_render_as_tls_secrets() {
        let cert = Certificate {
            name: "k8s://default/cert".to_string(),
            chain: "CHAIN".to_string(),
            private_key: "KEY".to_string(),
            expiry: None,
        };
        let rendered = cert.to_secret();
        assert_eq!(rendered.name, "k8s://default/cert");
        let Some(secret::Type::TlsCertificate(tls)) = rendered.r#type else {
            panic!("expected a TLS certificate secret");
        };
        assert_eq!(
            tls.certificate_chain.unwrap().specifier,
            Some(Specifier::InlineString("CHAIN".to_string()))
        );
    }
}
