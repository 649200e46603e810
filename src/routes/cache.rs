use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::state::AppState;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsResponse {
    pub cache_stats: BTreeMap<String, usize>,
    pub total_cached_entries: usize,
    pub sources: Vec<String>,
}

pub(crate) async fn cache_stats(State(store): State<Store>) -> Json<CacheStatsResponse> {
    let cache_stats = store.cache().stats();
    Json(CacheStatsResponse {
        total_cached_entries: cache_stats.values().sum(),
        sources: cache_stats.keys().cloned().collect(),
        cache_stats,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/cache/stats", get(cache_stats))
}
