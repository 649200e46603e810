use crate::broadcast::Broadcaster;
use crate::cache::SeriesCache;
use crate::config::Config;
use crate::pipeline::IngestStats;
use crate::store::Store;
use axum::extract::FromRef;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub broadcaster: Arc<Broadcaster>,
    pub ingest_stats: Arc<IngestStats>,
}

impl AppState {
    pub fn cache(&self) -> &Arc<SeriesCache> {
        self.store.cache()
    }
}

impl FromRef<AppState> for Store {
    fn from_ref(state: &AppState) -> Store {
        state.store.clone()
    }
}

impl FromRef<AppState> for Arc<Broadcaster> {
    fn from_ref(state: &AppState) -> Arc<Broadcaster> {
        state.broadcaster.clone()
    }
}

#[cfg(test)]
pub(crate) async fn test_state(sources: Vec<crate::config::SourceConfig>) -> AppState {
    use crate::legend::Legend;
    use crate::series::SeriesBuilder;

    let config = crate::config::test_config(sources);
    let store = crate::store::memory_store().await;
    let legend = Arc::new(Legend::new(config.sources.clone()));
    let series = SeriesBuilder::new(store.clone(), legend.clone());
    let broadcaster = Arc::new(Broadcaster::new(
        legend,
        series,
        config.subscriber_send_timeout(),
    ));
    AppState {
        config: Arc::new(config),
        store,
        broadcaster,
        ingest_stats: Arc::new(IngestStats::new()),
    }
}
