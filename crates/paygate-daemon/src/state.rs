use std::sync::Arc;

use paygate::{Paywall, ReconciliationMonitor};

/// Shared application state for the daemon.
pub struct AppState {
    pub paywall: Arc<Paywall>,
    pub monitor: Arc<ReconciliationMonitor>,
    /// Bearer token guarding /metrics. `None` leaves it public.
    pub metrics_token: Option<Vec<u8>>,
}
