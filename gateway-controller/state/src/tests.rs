use crate::{BindOutcome, Store, StoreMetrics};
use anyhow::{anyhow, Result};
use consul_gateway_controller_core::{
    Condition, Gateway, GatewayId, GatewayInSync, Listener, ListenerReady, NamespacePolicy,
    ParentRef, Protocol, ResolvedGateway, ResolvedService, Route, RouteAccepted, SyncAdapter,
    TcpRoute,
};
use consul_gateway_controller_core::{HttpRoute, HttpRouteRule};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

#[derive(Default)]
struct RecordingAdapter {
    syncs: Mutex<Vec<ResolvedGateway>>,
    clears: Mutex<Vec<GatewayId>>,
    fail: AtomicBool,
}

impl RecordingAdapter {
    fn sync_count(&self) -> usize {
        self.syncs.lock().unwrap().len()
    }

    fn last_sync(&self) -> ResolvedGateway {
        self.syncs.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait::async_trait]
impl SyncAdapter for RecordingAdapter {
    async fn sync(&self, gateway: &ResolvedGateway) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("consul unavailable"));
        }
        self.syncs.lock().unwrap().push(gateway.clone());
        Ok(())
    }

    async fn clear(&self, id: &GatewayId) -> Result<()> {
        self.clears.lock().unwrap().push(id.clone());
        Ok(())
    }
}

fn store() -> (Store, Arc<RecordingAdapter>) {
    let adapter = Arc::new(RecordingAdapter::default());
    (
        Store::new(adapter.clone(), StoreMetrics::default()),
        adapter,
    )
}

fn ready_listener(name: &str, protocol: Protocol, port: u16) -> Listener {
    let mut listener = Listener::new(name, protocol, port);
    listener.conditions.ready = Condition::active(ListenerReady::Ready);
    listener.allowed.namespaces = NamespacePolicy::All;
    listener
}

fn gateway(service: &str) -> Gateway {
    let mut gateway = Gateway::new(GatewayId::new("", service));
    gateway.source_namespace = "default".to_string();
    gateway
        .listeners
        .push(ready_listener("default", Protocol::Http, 80));
    gateway
}

fn http_route(id: &str, service: &str) -> Route {
    Route::Http(
        HttpRoute::new(id, id.rsplit('/').next().unwrap(), "default")
            .with_parent(ParentRef::new(GatewayId::new("", service)))
            .with_rule(HttpRouteRule::forwarding_to(ResolvedService::new("web"))),
    )
}

#[tokio::test]
async fn upsert_then_get_round_trips() {
    let (store, _) = store();
    let gw = gateway("gw-1");
    store.upsert_gateway(gw.clone()).await.unwrap();

    let mut expected = gw;
    expected.conditions.in_sync = Condition::active(GatewayInSync::InSync);
    assert_eq!(
        store.get_gateway(&GatewayId::new("", "gw-1")).await,
        Some(expected)
    );
}

#[tokio::test]
async fn update_predicate_skips_stale_writes() {
    let (store, adapter) = store();
    let mut gw = gateway("gw-1");
    gw.generation = 2;
    store.upsert_gateway(gw).await.unwrap();
    let syncs = adapter.sync_count();

    let mut stale = gateway("gw-1");
    stale.generation = 1;
    let applied = store
        .upsert_gateway_if(stale, |current| current.generation < 1)
        .await
        .unwrap();
    assert!(!applied);
    assert_eq!(adapter.sync_count(), syncs);
    assert_eq!(
        store
            .get_gateway(&GatewayId::new("", "gw-1"))
            .await
            .unwrap()
            .generation,
        2
    );
}

#[tokio::test]
async fn delete_gateway_fans_out() {
    let (store, adapter) = store();
    let id = GatewayId::new("", "gw-1");
    store.upsert_gateway(gateway("gw-1")).await.unwrap();
    store.upsert_route(http_route("default/web", "gw-1")).await.unwrap();

    assert!(store.delete_gateway(&id).await.unwrap());
    assert_eq!(store.get_gateway(&id).await, None);
    assert_eq!(adapter.clears.lock().unwrap().as_slice(), &[id.clone()]);

    // The route no longer reports the deleted gateway as a bound parent, but
    // keeps the parent ref itself so the status shows GatewayNotFound.
    let status = store.route_status("default/web").await.unwrap();
    assert_eq!(status.parents.len(), 1);
    assert_eq!(status.parents[0].1.reason, RouteAccepted::GatewayNotFound);

    assert!(!store.delete_gateway(&id).await.unwrap());
}

#[tokio::test]
async fn basic_http_binding() {
    let (store, adapter) = store();
    store.upsert_gateway(gateway("gw-1")).await.unwrap();
    store.upsert_route(http_route("default/web", "gw-1")).await.unwrap();

    let resolved = adapter.last_sync();
    assert_eq!(resolved.listeners.len(), 1);
    assert_eq!(resolved.listeners[0].http_routes.len(), 1);
    assert_eq!(resolved.listeners[0].http_routes[0].common.id, "default/web");

    let status = store.route_status("default/web").await.unwrap();
    assert_eq!(status.parents[0].1.reason, RouteAccepted::Accepted);
    assert!(status.parents[0].1.status);
    assert!(status.resolved_refs.status);

    let snapshot = store
        .gateway_snapshot(&GatewayId::new("", "gw-1"))
        .await
        .unwrap();
    assert_eq!(snapshot.listeners[0].attached_routes, 1);
}

#[tokio::test]
async fn routes_bind_only_to_listeners_that_accept_them() {
    let (store, adapter) = store();

    // A TCP route cannot bind to an HTTP listener.
    store.upsert_gateway(gateway("gw-1")).await.unwrap();
    let route = Route::Tcp(
        TcpRoute::new("default/db", "db", "default")
            .with_parent(ParentRef::new(GatewayId::new("", "gw-1")))
            .with_backend(ResolvedService::new("db")),
    );
    store.upsert_route(route).await.unwrap();

    let status = store.route_status("default/db").await.unwrap();
    assert_eq!(
        status.parents[0].1.reason,
        RouteAccepted::NotAllowedByListeners
    );

    // No listener was dirtied, so no extra sync happened for the failed bind.
    let resolved = adapter.last_sync();
    assert!(resolved.listeners[0].http_routes.is_empty());
    assert!(resolved.listeners[0].tcp_routes.is_empty());
}

#[tokio::test]
async fn hostname_mismatch_reports_no_matching_listener_hostname() {
    let (store, _) = store();
    let mut gw = gateway("gw-1");
    gw.listeners[0].hostname = Some("app.example.com".to_string());
    store.upsert_gateway(gw).await.unwrap();

    let route = Route::Http(
        HttpRoute::new("default/web", "web", "default")
            .with_parent(ParentRef::new(GatewayId::new("", "gw-1")))
            .with_hostname("other.example.com"),
    );
    store.upsert_route(route).await.unwrap();

    let status = store.route_status("default/web").await.unwrap();
    assert_eq!(
        status.parents[0].1.reason,
        RouteAccepted::NoMatchingListenerHostname
    );
}

#[tokio::test]
async fn section_name_selects_a_single_listener() {
    let (store, adapter) = store();
    let mut gw = gateway("gw-1");
    gw.listeners.push(ready_listener("alt", Protocol::Http, 8080));
    store.upsert_gateway(gw).await.unwrap();

    let route = Route::Http(
        HttpRoute::new("default/web", "web", "default").with_parent(
            ParentRef::new(GatewayId::new("", "gw-1")).with_section("alt"),
        ),
    );
    store.upsert_route(route).await.unwrap();

    let resolved = adapter.last_sync();
    assert!(resolved.listeners[0].http_routes.is_empty());
    assert_eq!(resolved.listeners[1].http_routes.len(), 1);

    let missing = Route::Http(
        HttpRoute::new("default/web2", "web2", "default").with_parent(
            ParentRef::new(GatewayId::new("", "gw-1")).with_section("nope"),
        ),
    );
    store.upsert_route(missing).await.unwrap();
    let status = store.route_status("default/web2").await.unwrap();
    assert_eq!(status.parents[0].1.reason, RouteAccepted::BindError);
}

#[tokio::test]
async fn route_binds_to_at_most_one_listener_per_gateway() {
    let (store, adapter) = store();
    let mut gw = gateway("gw-1");
    gw.listeners.push(ready_listener("second", Protocol::Http, 8080));
    store.upsert_gateway(gw).await.unwrap();
    store.upsert_route(http_route("default/web", "gw-1")).await.unwrap();

    let resolved = adapter.last_sync();
    let bound: usize = resolved
        .listeners
        .iter()
        .map(|listener| listener.http_routes.len())
        .sum();
    assert_eq!(bound, 1);
    assert_eq!(resolved.listeners[0].http_routes.len(), 1);
}

#[tokio::test]
async fn clean_gateways_are_not_resynced() {
    let (store, adapter) = store();
    store.upsert_gateway(gateway("gw-1")).await.unwrap();
    let syncs = adapter.sync_count();

    // A route that names a different gateway leaves gw-1 untouched.
    store
        .upsert_route(http_route("default/other", "gw-other"))
        .await
        .unwrap();
    assert_eq!(adapter.sync_count(), syncs);

    let status = store.route_status("default/other").await.unwrap();
    assert_eq!(status.parents[0].1.reason, RouteAccepted::GatewayNotFound);
}

#[tokio::test]
async fn route_delete_resyncs_bound_gateways() {
    let (store, adapter) = store();
    store.upsert_gateway(gateway("gw-1")).await.unwrap();
    store.upsert_route(http_route("default/web", "gw-1")).await.unwrap();
    let syncs = adapter.sync_count();

    assert!(store.delete_route("default/web").await.unwrap());
    assert_eq!(adapter.sync_count(), syncs + 1);
    let resolved = adapter.last_sync();
    assert!(resolved.listeners[0].http_routes.is_empty());

    assert!(!store.delete_route("default/web").await.unwrap());
}

#[tokio::test]
async fn sync_failure_lands_in_the_in_sync_condition() {
    let (store, adapter) = store();
    store.upsert_gateway(gateway("gw-1")).await.unwrap();

    adapter.fail.store(true, Ordering::SeqCst);
    let error = store
        .upsert_route(http_route("default/web", "gw-1"))
        .await
        .unwrap_err();
    assert!(error.to_string().contains("consul unavailable"));

    let gw = store.get_gateway(&GatewayId::new("", "gw-1")).await.unwrap();
    assert!(!gw.conditions.in_sync.status);
    assert_eq!(gw.conditions.in_sync.reason, GatewayInSync::SyncError);

    // The dirty bits stay set, so the next full pass heals the gateway.
    adapter.fail.store(false, Ordering::SeqCst);
    store.sync_all().await.unwrap();
    let gw = store.get_gateway(&GatewayId::new("", "gw-1")).await.unwrap();
    assert!(gw.conditions.in_sync.status);
}

#[tokio::test]
async fn unusable_listeners_never_accept_routes() {
    let (store, adapter) = store();
    let mut gw = gateway("gw-1");
    gw.listeners[0].conditions.ready =
        Condition::new(false, ListenerReady::Invalid, "certificate missing");
    store.upsert_gateway(gw).await.unwrap();
    store.upsert_route(http_route("default/web", "gw-1")).await.unwrap();

    let status = store.route_status("default/web").await.unwrap();
    assert!(matches!(
        status.parents[0].1.reason,
        RouteAccepted::BindError
    ));
    // The invalid listener is omitted from the resolved form entirely.
    assert!(adapter.last_sync().listeners.is_empty());
}

#[tokio::test]
async fn routes_referencing_lists_every_parent() {
    let (store, _) = store();
    store.upsert_gateway(gateway("gw-1")).await.unwrap();
    store.upsert_route(http_route("default/a", "gw-1")).await.unwrap();
    store.upsert_route(http_route("default/b", "gw-1")).await.unwrap();
    store
        .upsert_route(http_route("default/c", "gw-other"))
        .await
        .unwrap();

    let statuses = store.routes_referencing(&GatewayId::new("", "gw-1")).await;
    let mut ids: Vec<_> = statuses.into_iter().map(|s| s.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["default/a".to_string(), "default/b".to_string()]);
}

#[test]
fn bind_outcome_equality() {
    assert_eq!(
        BindOutcome::Bound("default".to_string()),
        BindOutcome::Bound("default".to_string())
    );
    assert_ne!(
        BindOutcome::Bound("default".to_string()),
        BindOutcome::GatewayNotFound
    );
}
