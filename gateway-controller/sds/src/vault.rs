//! Vault-backed secrets.
//!
//! Two schemes: `vault-pki://<mount>/<role>/<common-name>` issues a fresh
//! leaf from a PKI secrets engine, and
//! `vault-kv://<path>#<chainField>,<keyField>` reads static PEM material
//! from a KV store.

use crate::client::{chain_expiry, Certificate, SecretClient};
use anyhow::{anyhow, Context, Result};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Clone)]
struct VaultHttp {
    client: reqwest::Client,
    base: String,
    token: String,
}

impl VaultHttp {
    fn new(address: &str, token: impl ToString) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: address.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn read(&self, path: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/v1/{path}", self.base))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .with_context(|| format!("reading vault path {path}"))?
            .error_for_status()
            .with_context(|| format!("vault rejected read of {path}"))?;
        response.json().await.context("decoding vault response")
    }

    async fn write(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/v1/{path}", self.base))
            .header(TOKEN_HEADER, &self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("writing vault path {path}"))?
            .error_for_status()
            .with_context(|| format!("vault rejected write of {path}"))?;
        response.json().await.context("decoding vault response")
    }
}

/// Issues leaf certificates from a Vault PKI secrets engine.
pub struct VaultPkiClient {
    http: VaultHttp,
}

#[derive(Deserialize)]
struct PkiIssueData {
    certificate: String,
    private_key: String,
    #[serde(default)]
    ca_chain: Vec<String>,
    #[serde(default)]
    expiration: Option<i64>,
}

impl VaultPkiClient {
    pub fn new(address: &str, token: impl ToString) -> Self {
        Self {
            http: VaultHttp::new(address, token),
        }
    }
}

fn parse_pki_name(name: &str) -> Result<(&str, &str, &str)> {
    let rest = name
        .strip_prefix("vault-pki://")
        .ok_or_else(|| anyhow!("not a vault-pki URI: {name:?}"))?;
    let mut parts = rest.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(mount), Some(role), Some(common_name))
            if !mount.is_empty() && !role.is_empty() && !common_name.is_empty() =>
        {
            Ok((mount, role, common_name))
        }
        _ => Err(anyhow!(
            "vault-pki URIs are vault-pki://<mount>/<role>/<common-name>: {name:?}"
        )),
    }
}

#[async_trait::async_trait]
impl SecretClient for VaultPkiClient {
    async fn fetch(&self, name: &str) -> Result<Certificate> {
        let (mount, role, common_name) = parse_pki_name(name)?;
        let body = serde_json::json!({ "common_name": common_name });
        let response = self.http.write(&format!("{mount}/issue/{role}"), &body).await?;
        let data: PkiIssueData = serde_json::from_value(
            response
                .get("data")
                .cloned()
                .ok_or_else(|| anyhow!("vault issue response has no data"))?,
        )
        .context("decoding vault PKI issue data")?;

        let mut chain = data.certificate;
        for ca in &data.ca_chain {
            chain.push('\n');
            chain.push_str(ca);
        }
        let expiry = data
            .expiration
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .or_else(|| chain_expiry(&chain));

        Ok(Certificate {
            name: name.to_string(),
            chain,
            private_key: data.private_key,
            expiry,
        })
    }
}

/// Reads static certificate material from a Vault KV store.
pub struct VaultKvClient {
    http: VaultHttp,
}

impl VaultKvClient {
    pub fn new(address: &str, token: impl ToString) -> Self {
        Self {
            http: VaultHttp::new(address, token),
        }
    }
}

fn parse_kv_name(name: &str) -> Result<(&str, &str, &str)> {
    let rest = name
        .strip_prefix("vault-kv://")
        .ok_or_else(|| anyhow!("not a vault-kv URI: {name:?}"))?;
    let (path, fields) = rest
        .split_once('#')
        .ok_or_else(|| anyhow!("vault-kv URIs are vault-kv://<path>#<chainField>,<keyField>"))?;
    let (chain_field, key_field) = fields
        .split_once(',')
        .ok_or_else(|| anyhow!("vault-kv URIs are vault-kv://<path>#<chainField>,<keyField>"))?;
    if path.is_empty() || chain_field.is_empty() || key_field.is_empty() {
        return Err(anyhow!(
            "vault-kv URIs are vault-kv://<path>#<chainField>,<keyField>: {name:?}"
        ));
    }
    Ok((path, chain_field, key_field))
}

#[async_trait::async_trait]
impl SecretClient for VaultKvClient {
    async fn fetch(&self, name: &str) -> Result<Certificate> {
        let (path, chain_field, key_field) = parse_kv_name(name)?;
        let response = self.http.read(path).await?;
        let data = response
            .get("data")
            .ok_or_else(|| anyhow!("vault KV response has no data"))?;
        // KV v2 nests the fields one level deeper.
        let data = data.get("data").unwrap_or(data);

        let field = |key: &str| -> Result<String> {
            data.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("vault KV entry {path} has no field {key:?}"))
        };
        let chain = field(chain_field)?;
        let private_key = field(key_field)?;
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
    fn pki_uris_parse() {
        assert_eq!(
            parse_pki_name("vault-pki://pki/gateway/gw.example.com").unwrap(),
            ("pki", "gateway", "gw.example.com")
        );
        assert!(parse_pki_name("vault-pki://pki/missing-cn").is_err());
    }

    #[test]
    fn kv_uris_parse() {
        assert_eq!(
            parse_kv_name("vault-kv://secret/data/tls#crt,key").unwrap(),
            ("secret/data/tls", "crt", "key")
        );
        assert!(parse_kv_name("vault-kv://secret/tls").is_err());
        assert!(parse_kv_name("vault-kv://secret/tls#only-chain").is_err());
    }
}
