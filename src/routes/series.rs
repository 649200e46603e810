use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::broadcast::{Broadcaster, Chart, ChartDataset};
use crate::error::{AppError, AppResult};
use crate::legend::LegendEntry;
use crate::state::AppState;
use crate::store::{Store, StoredReading};

const DEBUG_SAMPLE_LEN: usize = 5;
const MAX_DEBUG_HOURS: i64 = 24 * 31;

pub(crate) async fn temperatures(State(broadcaster): State<Arc<Broadcaster>>) -> Json<Chart> {
    Json(broadcaster.build_chart().await)
}

pub(crate) async fn series_for_source(
    State(broadcaster): State<Arc<Broadcaster>>,
    Path(source): Path<String>,
) -> AppResult<Json<ChartDataset>> {
    let config = broadcaster
        .legend()
        .source(&source)
        .ok_or_else(|| AppError::not_found(format!("unknown source {source}")))?;
    let data = broadcaster.series().build_series(config).await;
    Ok(Json(ChartDataset::new(config, data)))
}

pub(crate) async fn legend(State(broadcaster): State<Arc<Broadcaster>>) -> Json<Vec<LegendEntry>> {
    Json(broadcaster.legend().snapshot().await)
}

#[derive(Debug, Deserialize)]
pub struct DebugQuery {
    #[serde(default)]
    pub use_cache: Option<bool>,
    #[serde(default)]
    pub hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct DebugReadingsResponse {
    pub source: String,
    pub data_source: &'static str,
    pub hours: i64,
    pub since: DateTime<Utc>,
    pub count: usize,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub sample_data: Vec<StoredReading>,
}

/// Raw stored points for one source, read either through the cache or
/// straight from the store, for comparing the two.
pub(crate) async fn debug_readings(
    State(store): State<Store>,
    Path(source): Path<String>,
    Query(query): Query<DebugQuery>,
) -> AppResult<Json<DebugReadingsResponse>> {
    let hours = query.hours.unwrap_or(24);
    if !(1..=MAX_DEBUG_HOURS).contains(&hours) {
        return Err(AppError::bad_request(format!(
            "hours must be between 1 and {MAX_DEBUG_HOURS}"
        )));
    }
    let since = Utc::now() - ChronoDuration::hours(hours);
    let use_cache = query.use_cache.unwrap_or(true);

    let readings = if use_cache {
        store
            .cache()
            .read_with_fallback(&store, &source, since)
            .await
    } else {
        store
            .try_query(&source, since)
            .await
            .map_err(AppError::internal)?
    };

    Ok(Json(DebugReadingsResponse {
        data_source: if use_cache { "cache" } else { "store" },
        hours,
        since,
        count: readings.len(),
        first_timestamp: readings.first().map(|r| r.timestamp),
        last_timestamp: readings.last().map(|r| r.timestamp),
        sample_data: readings.into_iter().take(DEBUG_SAMPLE_LEN).collect(),
        source,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/temperatures", get(temperatures))
        .route("/api/series/{*source}", get(series_for_source))
        .route("/api/legend", get(legend))
        .route("/debug/temperatures/{*source}", get(debug_readings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::state::test_state;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn sources() -> Vec<SourceConfig> {
        vec![
            SourceConfig::new("home/a", "A"),
            SourceConfig::new("home/b", "B"),
        ]
    }

    #[tokio::test]
    async fn temperatures_returns_one_dataset_per_source() {
        let state = test_state(sources()).await;
        let app = router().with_state(state);
        let (status, json) = get_json(app, "/temperatures").await;
        assert_eq!(status, StatusCode::OK);
        let datasets = json["datasets"].as_array().unwrap();
        assert_eq!(datasets.len(), 2);
        assert_eq!(datasets[0]["label"], "A");
        assert_eq!(datasets[0]["borderJoinStyle"], "round");
        assert_eq!(datasets[0]["data"].as_object().unwrap().len(), 1441);
    }

    #[tokio::test]
    async fn series_accepts_topic_keys_and_labels() {
        let state = test_state(sources()).await;
        state
            .broadcaster
            .legend()
            .record("home/b", dec!(4.44), Utc::now())
            .await;
        let app = router().with_state(state);

        let (status, json) = get_json(app.clone(), "/api/series/home/b").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["source"], "home/b");
        let data = json["data"].as_object().unwrap();
        let latest = data.values().last().unwrap();
        assert_eq!(latest, "4.4");

        let (status, json) = get_json(app.clone(), "/api/series/A").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["source"], "home/a");

        let (status, _) = get_json(app, "/api/series/home/zz").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn legend_lists_configured_sources() {
        let state = test_state(sources()).await;
        state
            .broadcaster
            .legend()
            .record("home/a", dec!(21.26), Utc::now())
            .await;
        let app = router().with_state(state);
        let (_, json) = get_json(app, "/api/legend").await;
        assert_eq!(json[0]["value"], "21.3");
        assert_eq!(json[0]["state"], "live");
        assert_eq!(json[1]["value"], serde_json::Value::Null);
        assert_eq!(json[1]["state"], "unknown");
    }

    #[tokio::test]
    async fn debug_compares_cache_and_store() {
        let state = test_state(sources()).await;
        let now = Utc::now();
        for minutes in [30, 20, 10] {
            state
                .store
                .insert("home/a", now - ChronoDuration::minutes(minutes), dec!(20.5))
                .await
                .unwrap();
        }
        let app = router().with_state(state.clone());

        let (status, json) =
            get_json(app.clone(), "/debug/temperatures/home/a?use_cache=false&hours=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data_source"], "store");
        assert_eq!(json["count"], 3);
        assert_eq!(json["sample_data"][0]["value"], "20.5");
        assert!(state.cache().stats().is_empty());

        let (_, json) = get_json(app.clone(), "/debug/temperatures/home/a?hours=1").await;
        assert_eq!(json["data_source"], "cache");
        assert_eq!(json["count"], 3);
        assert_eq!(state.cache().stats().get("home/a"), Some(&3));

        let (status, _) = get_json(app, "/debug/temperatures/home/a?hours=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
