pub mod cache;
pub mod health;
pub mod series;
pub mod ws;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(series::router())
        .merge(cache::router())
        .merge(ws::router())
        .with_state(state)
}
