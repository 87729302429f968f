use std::sync::Arc;

use crate::{backend::ChatBackend, metrics::AppMetrics, router::FallbackRouter};

pub const DEFAULT_RELAY_BUFFER: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub router: FallbackRouter,
    pub metrics: Arc<AppMetrics>,
    pub relay_buffer: usize,
}

impl AppState {
    pub fn new(backends: Vec<Arc<dyn ChatBackend>>, relay_buffer: usize) -> Self {
        let metrics = Arc::new(AppMetrics::new());
        Self {
            router: FallbackRouter::new(backends).with_metrics(metrics.clone()),
            metrics,
            relay_buffer: relay_buffer.max(1),
        }
    }

    pub fn new_for_tests<B>(backends: Vec<Arc<B>>) -> Self
    where
        B: ChatBackend + 'static,
    {
        let backends = backends
            .into_iter()
            .map(|backend| backend as Arc<dyn ChatBackend>)
            .collect();
        Self::new(backends, DEFAULT_RELAY_BUFFER)
    }
}
