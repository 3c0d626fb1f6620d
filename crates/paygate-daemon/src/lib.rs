//! paygate daemon: runs the payment ledger and the reconciliation monitor
//! behind a small JSON API.
//!
//! # Modules
//!
//! - [`bootstrap`]: builds the store, address sources, clients and monitor
//!   from a [`PaywallConfig`](paygate::PaywallConfig)
//! - [`routes`]: HTTP endpoints (health, metrics, payment creation and lookup)
//! - [`state`]: shared [`AppState`](state::AppState)
//! - [`metrics`]: Prometheus metrics for the API surface

pub mod bootstrap;
pub mod metrics;
pub mod routes;
pub mod state;
