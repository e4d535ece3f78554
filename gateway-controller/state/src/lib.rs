#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The authoritative in-memory set of gateways and routes.
//!
//! All mutations run under a single write lock, and the downstream sync to
//! Consul is issued while that lock is still held so that the sequence of
//! versions visible in Consul matches the sequence of successful upserts.
//! Readers proceed in parallel.

mod binding;
mod gateway;
mod metrics;
mod route;
mod store;

#[cfg(test)]
mod tests;

pub use self::{
    gateway::{GatewayEntry, GatewaySnapshot, ListenerSnapshot, ListenerState},
    metrics::StoreMetrics,
    route::{BindOutcome, RouteEntry, RouteStatus},
    store::Store,
};
