use std::sync::Arc;
use timekeeper_runtime::TimerService;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TimerService>,
}

impl AppState {
    pub fn new(service: Arc<TimerService>) -> Self {
        Self { service }
    }
}
