//! Shared handler state.

use std::sync::Arc;

use crate::hub::Hub;
use crate::metrics::HubMetrics;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub metrics: Arc<HubMetrics>,
}
