use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Store-level metrics, registered into the admin server's registry. The
/// active-gateways gauge is owned here rather than living as a module global;
/// its lifecycle is the store's.
#[derive(Clone, Debug, Default)]
pub struct StoreMetrics {
    pub active_gateways: Gauge,
    pub sync_operations: Counter,
    pub sync_errors: Counter,
}

impl StoreMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let metrics = Self::default();

        prom.register(
            "active_gateways",
            "Gauge of gateways currently held by the store",
            metrics.active_gateways.clone(),
        );
        prom.register(
            "sync_operations",
            "Count of sync attempts pushed to the adapter",
            metrics.sync_operations.clone(),
        );
        prom.register(
            "sync_errors",
            "Count of sync attempts the adapter rejected",
            metrics.sync_errors.clone(),
        );

        metrics
    }
}
