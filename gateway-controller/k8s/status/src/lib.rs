#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Status writeback.
//!
//! Reconciliation publishes status updates onto a queue; this controller
//! drains it and merge-patches the `.status` subresource of the originating
//! objects. Identical updates are debounced by equality on the rendered
//! status block, which breaks the reconcile → write status → observe write →
//! reconcile feedback loop.

mod conditions;
mod controller;

pub use self::controller::{Controller, ResourceId, RouteParent, Update};
pub use self::conditions::CONTROLLER_NAME;
