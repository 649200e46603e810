//! Sensor ingest: per-minute averaging into SQLite, a 24h read-through cache,
//! gap-filled display series and live push to websocket subscribers.

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod ingest;
pub mod legend;
pub mod mqtt;
pub mod pipeline;
pub mod routes;
pub mod series;
pub mod state;
pub mod store;
pub mod telemetry;
