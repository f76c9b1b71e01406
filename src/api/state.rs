use std::sync::Arc;

use crate::config::Config;
use crate::observability::Metrics;
use crate::queue::QueueManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: QueueManager,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: Config, manager: QueueManager) -> Self {
        let metrics = manager.metrics().clone();
        Self {
            config: Arc::new(config),
            manager,
            metrics,
        }
    }
}
