use std::sync::Arc;
use std::time::Duration;

use crate::broker::Publisher;
use crate::status_cache::StatusCache;
use crate::store::RecruitingStore;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecruitingStore>,
    pub cache: StatusCache,
    pub publisher: Arc<dyn Publisher>,
    /// How long cached ranking results are served instead of re-ranking.
    pub results_freshness: Duration,
}
