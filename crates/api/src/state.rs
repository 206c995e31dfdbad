//! Shared application state

use dealflow_billing::BillingService;

/// State handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
}

impl AppState {
    pub fn new(billing: BillingService) -> Self {
        Self { billing }
    }
}
