//! The sync adapter: pushes translated gateways into Consul with the write
//! ordering that minimizes downtime.
//!
//! Consul has no multi-entry transactions, so writes are ordered: supporting
//! routers/splitters/defaults first (additive, no traffic impact), then the
//! ingress-gateway entry (switches traffic), then deletes of entries no
//! longer referenced. A failed delete leaves an orphan that the next sync or
//! the managed-by garbage collection reaps.

use crate::{
    client::ConfigEntries,
    entries::{ConfigEntry, GATEWAY_META_KEY},
    translate::translate,
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use consul_gateway_controller_core::{GatewayId, ResolvedGateway, SyncAdapter};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Identity of a config entry within Consul.
type EntryKey = (String, String, Option<String>);

pub struct ConsulSyncAdapter<C> {
    client: Arc<C>,
    /// Entries written for each gateway on its last successful sync, used
    /// both to diff away unchanged writes and to compute orphan deletes.
    previous: Mutex<HashMap<GatewayId, BTreeMap<EntryKey, ConfigEntry>>>,
}

impl<C: ConfigEntries> ConsulSyncAdapter<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            previous: Mutex::new(HashMap::default()),
        }
    }

    async fn delete_entry(&self, key: &EntryKey) -> Result<()> {
        let (kind, name, namespace) = key;
        self.client.delete(kind, name, namespace.as_deref()).await
    }
}

fn key_of(entry: &ConfigEntry) -> EntryKey {
    (
        entry.kind().to_string(),
        entry.name().to_string(),
        entry.namespace().map(str::to_string),
    )
}

#[async_trait::async_trait]
impl<C: ConfigEntries> SyncAdapter for ConsulSyncAdapter<C> {
    async fn sync(&self, gateway: &ResolvedGateway) -> Result<()> {
        let translated = translate(gateway);
        let ingress = ConfigEntry::IngressGateway(translated.ingress);

        let mut intended = BTreeMap::new();
        for entry in translated.supporting {
            intended.insert(key_of(&entry), entry);
        }

        let mut previous = self.previous.lock().await;
        let old = previous.entry(gateway.id.clone()).or_default();

        // Supporting entries first: these are additive and affect no traffic
        // until the ingress entry references them.
        for (key, entry) in &intended {
            if old.get(key) == Some(entry) {
                continue;
            }
            self.client.set(entry).await?;
        }

        // The ingress entry switches traffic over to the new entry set.
        let ingress_key = key_of(&ingress);
        if old.get(&ingress_key) != Some(&ingress) {
            self.client.set(&ingress).await?;
        }
        intended.insert(ingress_key, ingress);

        // Finally, delete entries the previous generation wrote that nothing
        // references anymore. Failures here are deliberately non-fatal: the
        // stale key stays recorded so the next sync retries the delete.
        let stale: Vec<EntryKey> = old
            .keys()
            .filter(|key| !intended.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            match self.delete_entry(&key).await {
                Ok(()) => {}
                Err(error) => {
                    tracing::warn!(kind = %key.0, name = %key.1, %error, "failed to delete stale config entry");
                    if let Some(entry) = old.remove(&key) {
                        intended.insert(key, entry);
                    }
                }
            }
        }

        *old = intended;
        Ok(())
    }

    async fn clear(&self, id: &GatewayId) -> Result<()> {
        let mut previous = self.previous.lock().await;
        let recorded = previous.remove(id).unwrap_or_default();

        let ingress_key = (
            "ingress-gateway".to_string(),
            id.service.clone(),
            if id.namespace.is_empty() {
                None
            } else {
                Some(id.namespace.clone())
            },
        );
        self.delete_entry(&ingress_key).await?;

        for key in recorded.keys() {
            if key == &ingress_key {
                continue;
            }
            if let Err(error) = self.delete_entry(key).await {
                tracing::warn!(kind = %key.0, name = %key.1, %error, "failed to delete config entry during clear");
            }
        }

        // Sweep for orphans from earlier generations of this process (or a
        // predecessor) by ownership tag.
        for kind in ["service-router", "service-splitter", "service-defaults"] {
            let listed = match self.client.list(kind).await {
                Ok(listed) => listed,
                Err(error) => {
                    tracing::warn!(%kind, %error, "failed to list config entries for garbage collection");
                    continue;
                }
            };
            for entry in listed {
                let owned = entry.is_managed()
                    && entry.meta().get(GATEWAY_META_KEY).map(String::as_str)
                        == Some(id.to_string().as_str());
                if !owned {
                    continue;
                }
                if let Err(error) = self.delete_entry(&key_of(&entry)).await {
                    tracing::warn!(%kind, name = %entry.name(), %error, "failed to garbage collect config entry");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use consul_gateway_controller_core::{
        HttpRoute, HttpRouteRule, Protocol, ResolvedListener, ResolvedService,
    };
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, PartialEq)]
    enum Op {
        Set(String, String),
        Delete(String, String),
    }

    #[derive(Default)]
    struct FakeConsul {
        ops: StdMutex<Vec<Op>>,
        entries: StdMutex<Vec<ConfigEntry>>,
        fail_deletes: StdMutex<bool>,
    }

    impl FakeConsul {
        fn ops(&self) -> Vec<(String, String)> {
            self.ops
                .lock()
                .unwrap()
                .iter()
                .map(|op| match op {
                    Op::Set(kind, name) => (format!("set:{kind}"), name.clone()),
                    Op::Delete(kind, name) => (format!("delete:{kind}"), name.clone()),
                })
                .collect()
        }

        fn clear_ops(&self) {
            self.ops.lock().unwrap().clear();
        }
    }

    #[async_trait::async_trait]
    impl ConfigEntries for FakeConsul {
        async fn set(&self, entry: &ConfigEntry) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::Set(entry.kind().to_string(), entry.name().to_string()));
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn delete(&self, kind: &str, name: &str, _namespace: Option<&str>) -> Result<()> {
            if *self.fail_deletes.lock().unwrap() {
                return Err(anyhow!("delete refused"));
            }
            self.ops
                .lock()
                .unwrap()
                .push(Op::Delete(kind.to_string(), name.to_string()));
            Ok(())
        }

        async fn list(&self, kind: &str) -> Result<Vec<ConfigEntry>> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|entry| entry.kind() == kind)
                .cloned()
                .collect())
        }
    }

    fn gateway_with_route(route_id: &str) -> ResolvedGateway {
        ResolvedGateway::new(GatewayId::new("", "gw")).with_listener(
            ResolvedListener::new("default", Protocol::Http, 80).with_http_route(
                HttpRoute::new(route_id, "web", "default")
                    .with_rule(HttpRouteRule::forwarding_to(ResolvedService::new("web"))),
            ),
        )
    }

    #[tokio::test]
    async fn writes_supporting_entries_before_ingress() {
        let consul = Arc::new(FakeConsul::default());
        let adapter = ConsulSyncAdapter::new(consul.clone());

        adapter.sync(&gateway_with_route("default/web")).await.unwrap();

        let ops = consul.ops();
        let ingress_position = ops
            .iter()
            .position(|(op, _)| op == "set:ingress-gateway")
            .unwrap();
        for (index, (op, _)) in ops.iter().enumerate() {
            if op.starts_with("set:") && op != "set:ingress-gateway" {
                assert!(index < ingress_position, "supporting write after ingress");
            }
        }
    }

    #[tokio::test]
    async fn resync_of_unchanged_state_writes_nothing() {
        let consul = Arc::new(FakeConsul::default());
        let adapter = ConsulSyncAdapter::new(consul.clone());
        let gateway = gateway_with_route("default/web");

        adapter.sync(&gateway).await.unwrap();
        consul.clear_ops();
        adapter.sync(&gateway).await.unwrap();
        assert!(consul.ops().is_empty());
    }

    #[tokio::test]
    async fn dropped_routes_delete_their_entries() {
        let consul = Arc::new(FakeConsul::default());
        let adapter = ConsulSyncAdapter::new(consul.clone());

        adapter.sync(&gateway_with_route("default/web")).await.unwrap();
        consul.clear_ops();

        // The route is gone; its router and defaults become stale.
        let empty = ResolvedGateway::new(GatewayId::new("", "gw"))
            .with_listener(ResolvedListener::new("default", Protocol::Http, 80));
        adapter.sync(&empty).await.unwrap();

        let ops = consul.ops();
        assert!(ops.contains(&("delete:service-router".to_string(), "gw-default-web".to_string())));
        assert!(ops.contains(&(
            "delete:service-defaults".to_string(),
            "gw-default-web".to_string()
        )));
    }

    #[tokio::test]
    async fn failed_deletes_are_retried_on_the_next_sync() {
        let consul = Arc::new(FakeConsul::default());
        let adapter = ConsulSyncAdapter::new(consul.clone());

        adapter.sync(&gateway_with_route("default/web")).await.unwrap();

        *consul.fail_deletes.lock().unwrap() = true;
        let empty = ResolvedGateway::new(GatewayId::new("", "gw"))
            .with_listener(ResolvedListener::new("default", Protocol::Http, 80));
        adapter.sync(&empty).await.unwrap();

        *consul.fail_deletes.lock().unwrap() = false;
        consul.clear_ops();
        adapter.sync(&empty).await.unwrap();
        assert!(consul
            .ops()
            .contains(&("delete:service-router".to_string(), "gw-default-web".to_string())));
    }

    #[tokio::test]
    async fn clear_removes_the_ingress_and_owned_entries() {
        let consul = Arc::new(FakeConsul::default());
        let adapter = ConsulSyncAdapter::new(consul.clone());
        let id = GatewayId::new("", "gw");

        adapter.sync(&gateway_with_route("default/web")).await.unwrap();
        consul.clear_ops();
        adapter.clear(&id).await.unwrap();

        let ops = consul.ops();
        assert_eq!(ops[0], ("delete:ingress-gateway".to_string(), "gw".to_string()));
        assert!(ops.contains(&("delete:service-router".to_string(), "gw-default-web".to_string())));
    }
}
