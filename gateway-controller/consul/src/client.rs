//! Seams over the Consul HTTP API. The store's sync adapter, the exec
//! supervisor, and the SDS cert sources all talk to Consul through these
//! traits so tests can substitute fakes.

use crate::entries::ConfigEntry;
use anyhow::Result;
use std::collections::BTreeMap;

/// Policy id Consul reserves for global management; tokens carrying it are
/// treated as administrative.
pub const GLOBAL_MANAGEMENT_POLICY_ID: &str = "00000000-0000-0000-0000-000000000001";

#[async_trait::async_trait]
pub trait ConfigEntries: Send + Sync + 'static {
    async fn set(&self, entry: &ConfigEntry) -> Result<()>;

    async fn delete(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<()>;

    async fn list(&self, kind: &str) -> Result<Vec<ConfigEntry>>;
}

/// A service registration for the local agent, checked over TCP against the
/// gateway's own listening port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentService {
    pub id: String,
    pub name: String,
    pub namespace: Option<String>,
    pub address: String,
    pub port: u16,
}

#[async_trait::async_trait]
pub trait CatalogAgent: Send + Sync + 'static {
    async fn register(&self, service: &AgentService) -> Result<()>;

    async fn deregister(&self, service_id: &str) -> Result<()>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AclToken {
    pub accessor_id: String,
    pub secret_id: String,
    /// Ids of the policies attached to the token.
    pub policies: Vec<String>,
}

impl AclToken {
    /// Whether the token carries the global-management policy and is
    /// therefore administrative.
    pub fn is_global_management(&self) -> bool {
        self.policies
            .iter()
            .any(|id| id == GLOBAL_MANAGEMENT_POLICY_ID)
    }
}

#[async_trait::async_trait]
pub trait Acl: Send + Sync + 'static {
    /// Exchanges a bearer token (e.g. a service account JWT) for a Consul
    /// token via the named auth method.
    async fn login(
        &self,
        auth_method: &str,
        bearer_token: &str,
        meta: &BTreeMap<String, String>,
    ) -> Result<AclToken>;

    /// Revokes a token obtained through `login`.
    async fn logout(&self, token: &str) -> Result<()>;
}

/// Leaf and root certificate material for a service, as issued by the Consul
/// connect CA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertPair {
    pub cert_pem: String,
    pub key_pem: String,
}

#[async_trait::async_trait]
pub trait LeafCerts: Send + Sync + 'static {
    async fn leaf(&self, service: &str) -> Result<CertPair>;

    async fn roots(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_management_tokens_are_recognized() {
        let token = AclToken {
            accessor_id: "accessor".to_string(),
            secret_id: "secret".to_string(),
            policies: vec![GLOBAL_MANAGEMENT_POLICY_ID.to_string()],
        };
        assert!(token.is_global_management());

        let scoped = AclToken {
            policies: vec!["9f3a1f1d-3d52-41a5-bf97-42d05e5c6b6b".to_string()],
            ..AclToken::default()
        };
        assert!(!scoped.is_global_management());
    }
}
