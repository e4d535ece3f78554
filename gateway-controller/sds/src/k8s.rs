//! `k8s://<namespace>/<name>` secrets: standard `kubernetes.io/tls` secrets
//! read through the Kubernetes API.

use crate::client::{chain_expiry, Certificate, SecretClient};
use anyhow::{anyhow, bail, Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::Api;

pub struct K8sSecretClient {
    client: kube::Client,
}

impl K8sSecretClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

fn parse_name(name: &str) -> Result<(&str, &str)> {
    let rest = name
        .strip_prefix("k8s://")
        .ok_or_else(|| anyhow!("not a k8s secret URI: {name:?}"))?;
    rest.split_once('/')
        .filter(|(namespace, secret)| !namespace.is_empty() && !secret.is_empty())
        .ok_or_else(|| anyhow!("k8s secret URIs are k8s://<namespace>/<name>: {name:?}"))
}

#[async_trait::async_trait]
impl SecretClient for K8sSecretClient {
    async fn fetch(&self, name: &str) -> Result<Certificate> {
        let (namespace, secret_name) = parse_name(name)?;
        let api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        let secret = api
            .get(secret_name)
            .await
            .with_context(|| format!("fetching secret {namespace}/{secret_name}"))?;

        if secret.type_.as_deref() != Some("kubernetes.io/tls") {
            bail!("secret {namespace}/{secret_name} is not of type kubernetes.io/tls");
        }

        let data = secret.data.unwrap_or_default();
        let chain = data
            .get("tls.crt")
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
            .ok_or_else(|| anyhow!("secret {namespace}/{secret_name} has no tls.crt"))?;
        let private_key = data
            .get("tls.key")
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
            .ok_or_else(|| anyhow!("secret {namespace}/{secret_name} has no tls.key"))?;

        let expiry = chain_expiry(&chain);
        Ok(Certificate {
            name: name.to_string(),
            chain,
            private_key,
            expiry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_uris_parse() {
        assert_eq!(
            parse_name("k8s://default/cert").unwrap(),
            ("default", "cert")
        );
        assert!(parse_name("k8s://missing-name").is_err());
        assert!(parse_name("vault-kv://x").is_err());
    }
}
