use crate::conditions::{gateway_status, route_status};
use ahash::AHashMap as HashMap;
use chrono::offset::Utc;
use consul_gateway_controller_core::{Condition, RouteAccepted, RouteResolvedRefs};
use consul_gateway_controller_k8s_api::{self as k8s, gateway};
use consul_gateway_controller_state::GatewaySnapshot;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

const BETA_API_VERSION: &str = "gateway.networking.k8s.io/v1beta1";
const ALPHA_API_VERSION: &str = "gateway.networking.k8s.io/v1alpha2";
const FIELD_MANAGER: &str = "consul-api-gateway";

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// A route parent rendered for status: the gateway's Kubernetes coordinates
/// plus the acceptance condition the store derived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteParent {
    pub namespace: String,
    pub name: String,
    pub accepted: Condition<RouteAccepted>,
}

#[derive(Clone, Debug)]
pub enum Update {
    Gateway {
        id: ResourceId,
        generation: i64,
        snapshot: GatewaySnapshot,
    },
    HttpRoute {
        id: ResourceId,
        generation: i64,
        parents: Vec<RouteParent>,
        resolved_refs: Condition<RouteResolvedRefs>,
    },
    TcpRoute {
        id: ResourceId,
        generation: i64,
        parents: Vec<RouteParent>,
        resolved_refs: Condition<RouteResolvedRefs>,
    },
    GatewayClass {
        name: String,
        generation: i64,
        accepted: bool,
    },
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
enum Kind {
    Gateway,
    HttpRoute,
    TcpRoute,
    GatewayClass,
}

/// Drains the status queue and patches `.status` subresources, skipping
/// writes whose rendered status (timestamps aside) matches the last write.
pub struct Controller {
    client: k8s::Client,
    updates: UnboundedReceiver<Update>,
    written: HashMap<(Kind, ResourceId), Value>,
}

impl Controller {
    pub fn new(client: k8s::Client, updates: UnboundedReceiver<Update>) -> Self {
        Self {
            client,
            updates,
            written: HashMap::default(),
        }
    }

    pub async fn run(mut self) {
        while let Some(update) = self.updates.recv().await {
            self.process(update).await;
        }
    }

    async fn process(&mut self, update: Update) {
        match update {
            Update::Gateway {
                id,
                generation,
                snapshot,
            } => {
                let status = gateway_status(&snapshot, generation);
                let status = match serde_json::to_value(&status) {
                    Ok(status) => status,
                    Err(error) => {
                        tracing::error!(%error, "failed to render gateway status");
                        return;
                    }
                };
                if !self.should_write(Kind::Gateway, &id, &status) {
                    return;
                }
                let api =
                    k8s::Api::<gateway::Gateway>::namespaced(self.client.clone(), &id.namespace);
                let patch = serde_json::json!({
                    "apiVersion": BETA_API_VERSION,
                    "kind": "Gateway",
                    "name": id.name,
                    "status": status,
                });
                self.patch(Kind::Gateway, id, api, patch, status).await;
            }
            Update::HttpRoute {
                id,
                generation,
                parents,
                resolved_refs,
            } => {
                let status = gateway::HttpRouteStatus {
                    inner: route_status(&parents, &resolved_refs, generation),
                };
                let status = match serde_json::to_value(&status) {
                    Ok(status) => status,
                    Err(error) => {
                        tracing::error!(%error, "failed to render HTTPRoute status");
                        return;
                    }
                };
                if !self.should_write(Kind::HttpRoute, &id, &status) {
                    return;
                }
                let api =
                    k8s::Api::<gateway::HttpRoute>::namespaced(self.client.clone(), &id.namespace);
                let patch = serde_json::json!({
                    "apiVersion": BETA_API_VERSION,
                    "kind": "HTTPRoute",
                    "name": id.name,
                    "status": status,
                });
                self.patch(Kind::HttpRoute, id, api, patch, status).await;
            }
            Update::TcpRoute {
                id,
                generation,
                parents,
                resolved_refs,
            } => {
                let status = gateway::TcpRouteStatus {
                    inner: route_status(&parents, &resolved_refs, generation),
                };
                let status = match serde_json::to_value(&status) {
                    Ok(status) => status,
                    Err(error) => {
                        tracing::error!(%error, "failed to render TCPRoute status");
                        return;
                    }
                };
                if !self.should_write(Kind::TcpRoute, &id, &status) {
                    return;
                }
                let api =
                    k8s::Api::<gateway::TcpRoute>::namespaced(self.client.clone(), &id.namespace);
                let patch = serde_json::json!({
                    "apiVersion": ALPHA_API_VERSION,
                    "kind": "TCPRoute",
                    "name": id.name,
                    "status": status,
                });
                self.patch(Kind::TcpRoute, id, api, patch, status).await;
            }
            Update::GatewayClass {
                name,
                generation,
                accepted,
            } => {
                let id = ResourceId::new("", &name);
                let status = serde_json::json!({
                    "conditions": [{
                        "type": "Accepted",
                        "status": if accepted { "True" } else { "False" },
                        "reason": if accepted { "Accepted" } else { "InvalidParameters" },
                        "message": "",
                        "observedGeneration": generation,
                        "lastTransitionTime": k8s::Time(Utc::now()),
                    }],
                });
                if !self.should_write(Kind::GatewayClass, &id, &status) {
                    return;
                }
                let api = k8s::Api::<gateway::GatewayClass>::all(self.client.clone());
                let patch = serde_json::json!({
                    "apiVersion": BETA_API_VERSION,
                    "kind": "GatewayClass",
                    "name": name,
                    "status": status,
                });
                self.patch(Kind::GatewayClass, id, api, patch, status).await;
            }
        }
    }

    async fn patch<T>(
        &mut self,
        kind: Kind,
        id: ResourceId,
        api: k8s::Api<T>,
        patch: Value,
        status: Value,
    ) where
        T: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        let params = k8s::PatchParams::apply(FIELD_MANAGER);
        match api
            .patch_status(&id.name, &params, &k8s::Patch::Merge(patch))
            .await
        {
            Ok(_) => {
                self.written.insert((kind, id), fingerprint(&status));
            }
            Err(error) => {
                tracing::error!(namespace = %id.namespace, name = %id.name, %error, "failed to patch status");
            }
        }
    }

    /// Whether the rendered status differs from the last successful write,
    /// ignoring transition timestamps.
    fn should_write(&self, kind: Kind, id: &ResourceId, status: &Value) -> bool {
        self.written.get(&(kind, id.clone())) != Some(&fingerprint(status))
    }
}

/// Strips `lastTransitionTime` fields so two renderings of the same state
/// compare equal.
fn fingerprint(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| key.as_str() != "lastTransitionTime")
                .map(|(key, value)| (key.clone(), fingerprint(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(fingerprint).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_transition_times() {
        let a = serde_json::json!({
            "conditions": [{"type": "Ready", "status": "True", "lastTransitionTime": "2023-01-01T00:00:00Z"}],
        });
        let b = serde_json::json!({
            "conditions": [{"type": "Ready", "status": "True", "lastTransitionTime": "2024-06-01T12:00:00Z"}],
        });
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let c = serde_json::json!({
            "conditions": [{"type": "Ready", "status": "False", "lastTransitionTime": "2024-06-01T12:00:00Z"}],
        });
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }
}
