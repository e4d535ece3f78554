//! Thin reqwest-backed implementation of the Consul client traits. Only the
//! endpoints the controller uses are wrapped; anything richer belongs to a
//! dedicated client crate.

use crate::{
    client::{Acl, AclToken, AgentService, CatalogAgent, CertPair, ConfigEntries, LeafCerts},
    entries::ConfigEntry,
};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;

const TOKEN_HEADER: &str = "X-Consul-Token";

#[derive(Clone)]
pub struct HttpConsul {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl HttpConsul {
    /// `address` is `host:port`; `tls` selects https, mirroring
    /// `CONSUL_HTTP_ADDR` / `CONSUL_HTTP_SSL`.
    pub fn new(address: &str, tls: bool, token: Option<String>) -> Self {
        let scheme = if tls { "https" } else { "http" };
        let base = if address.contains("://") {
            address.to_string()
        } else {
            format!("{scheme}://{address}")
        };
        Self {
            client: reqwest::Client::new(),
            base,
            token,
        }
    }

    /// A copy of this client authenticated with a different token; the exec
    /// supervisor switches to the token obtained from ACL login.
    pub fn with_token(&self, token: impl ToString) -> Self {
        Self {
            client: self.client.clone(),
            base: self.base.clone(),
            token: Some(token.to_string()),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{}", self.base, path));
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        builder
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(anyhow!("consul returned {status}: {body}"))
    }
}

#[async_trait::async_trait]
impl ConfigEntries for HttpConsul {
    async fn set(&self, entry: &ConfigEntry) -> Result<()> {
        let mut builder = self.request(reqwest::Method::PUT, "/v1/config");
        if let Some(namespace) = entry.namespace() {
            builder = builder.query(&[("ns", namespace)]);
        }
        let response = builder
            .json(entry)
            .send()
            .await
            .context("writing config entry")?;
        Self::check(response).await.map(|_| ())
    }

    async fn delete(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<()> {
        let mut builder =
            self.request(reqwest::Method::DELETE, &format!("/v1/config/{kind}/{name}"));
        if let Some(namespace) = namespace {
            builder = builder.query(&[("ns", namespace)]);
        }
        let response = builder.send().await.context("deleting config entry")?;
        Self::check(response).await.map(|_| ())
    }

    async fn list(&self, kind: &str) -> Result<Vec<ConfigEntry>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/config/{kind}"))
            .send()
            .await
            .context("listing config entries")?;
        let response = Self::check(response).await?;
        response.json().await.context("decoding config entries")
    }
}

#[async_trait::async_trait]
impl CatalogAgent for HttpConsul {
    async fn register(&self, service: &AgentService) -> Result<()> {
        let body = serde_json::json!({
            "ID": service.id,
            "Name": service.name,
            "Namespace": service.namespace,
            "Address": service.address,
            "Port": service.port,
            "Check": {
                "Name": format!("{} listener", service.name),
                "TCP": format!("{}:{}", service.address, service.port),
                "Interval": "10s",
                "DeregisterCriticalServiceAfter": "1m",
            },
        });
        let response = self
            .request(reqwest::Method::PUT, "/v1/agent/service/register")
            .json(&body)
            .send()
            .await
            .context("registering service")?;
        Self::check(response).await.map(|_| ())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/v1/agent/service/deregister/{service_id}"),
            )
            .send()
            .await
            .context("deregistering service")?;
        Self::check(response).await.map(|_| ())
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "AccessorID")]
    accessor_id: String,
    #[serde(rename = "SecretID")]
    secret_id: String,
    #[serde(rename = "Policies", default)]
    policies: Vec<PolicyRef>,
}

#[derive(Deserialize)]
struct PolicyRef {
    #[serde(rename = "ID")]
    id: String,
}

#[async_trait::async_trait]
impl Acl for HttpConsul {
    async fn login(
        &self,
        auth_method: &str,
        bearer_token: &str,
        meta: &BTreeMap<String, String>,
    ) -> Result<AclToken> {
        let body = serde_json::json!({
            "AuthMethod": auth_method,
            "BearerToken": bearer_token,
            "Meta": meta,
        });
        let response = self
            .request(reqwest::Method::POST, "/v1/acl/login")
            .json(&body)
            .send()
            .await
            .context("logging into consul")?;
        let response = Self::check(response).await?;
        let login: LoginResponse = response.json().await.context("decoding login response")?;
        Ok(AclToken {
            accessor_id: login.accessor_id,
            secret_id: login.secret_id,
            policies: login.policies.into_iter().map(|policy| policy.id).collect(),
        })
    }

    async fn logout(&self, token: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/v1/acl/logout", self.base))
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .context("logging out of consul")?;
        Self::check(response).await.map(|_| ())
    }
}

#[derive(Deserialize)]
struct LeafResponse {
    #[serde(rename = "CertPEM")]
    cert_pem: String,
    #[serde(rename = "PrivateKeyPEM")]
    private_key_pem: String,
}

#[derive(Deserialize)]
struct RootsResponse {
    #[serde(rename = "Roots")]
    roots: Vec<RootCert>,
}

#[derive(Deserialize)]
struct RootCert {
    #[serde(rename = "RootCert")]
    root_cert: String,
}

#[async_trait::async_trait]
impl LeafCerts for HttpConsul {
    async fn leaf(&self, service: &str) -> Result<CertPair> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v1/agent/connect/ca/leaf/{service}"),
            )
            .send()
            .await
            .context("fetching leaf certificate")?;
        let response = Self::check(response).await?;
        let leaf: LeafResponse = response.json().await.context("decoding leaf certificate")?;
        Ok(CertPair {
            cert_pem: leaf.cert_pem,
            key_pem: leaf.private_key_pem,
        })
    }

    async fn roots(&self) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, "/v1/agent/connect/ca/roots")
            .send()
            .await
            .context("fetching root certificates")?;
        let response = Self::check(response).await?;
        let roots: RootsResponse = response.json().await.context("decoding root certificates")?;
        Ok(roots
            .roots
            .iter()
            .map(|root| root.root_cert.as_str())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_respects_tls_flag() {
        let plain = HttpConsul::new("127.0.0.1:8500", false, None);
        assert_eq!(plain.base, "http://127.0.0.1:8500");

        let tls = HttpConsul::new("consul.example.com:8501", true, None);
        assert_eq!(tls.base, "https://consul.example.com:8501");

        let explicit = HttpConsul::new("https://consul.example.com", false, None);
        assert_eq!(explicit.base, "https://consul.example.com");
    }
}
