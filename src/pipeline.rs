use crate::ingest::Aggregator;
use crate::telemetry::Reading;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum IngestCommand {
    Reading(Reading),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestCommand>,
    stats: Arc<IngestStats>,
}

impl IngestHandle {
    pub fn new(tx: mpsc::Sender<IngestCommand>, stats: Arc<IngestStats>) -> Self {
        Self { tx, stats }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub async fn submit(&self, reading: Reading) -> Result<()> {
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, source = %reading.source, value = %reading.value, "queued reading");
        if let Err(err) = self.tx.send(IngestCommand::Reading(reading)).await {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(err.into());
        }
        Ok(())
    }

    /// Closes the open minute and waits until it is persisted.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(IngestCommand::Flush(tx)).await?;
        rx.await?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub accepted_readings: AtomicU64,
    pub rejected_readings: AtomicU64,
    pub flushed_points: AtomicU64,
    pub failed_points: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            accepted_readings: AtomicU64::new(0),
            rejected_readings: AtomicU64::new(0),
            flushed_points: AtomicU64::new(0),
            failed_points: AtomicU64::new(0),
            last_flush_unix_ms: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            accepted_readings: self.accepted_readings.load(Ordering::Relaxed),
            rejected_readings: self.rejected_readings.load(Ordering::Relaxed),
            flushed_points: self.flushed_points.load(Ordering::Relaxed),
            failed_points: self.failed_points.load(Ordering::Relaxed),
            last_flush_unix_ms: self.last_flush_unix_ms.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestStatsSnapshot {
    pub queue_depth: u64,
    pub accepted_readings: u64,
    pub rejected_readings: u64,
    pub flushed_points: u64,
    pub failed_points: u64,
    pub last_flush_unix_ms: u64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

/// Runs the aggregator on its own task. The ticker closes minutes that went
/// quiet; a closed channel flushes the open minute and ends the task.
pub fn spawn_worker(
    mut aggregator: Aggregator,
    mut rx: mpsc::Receiver<IngestCommand>,
    flush_check_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stats = aggregator.stats();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + flush_check_interval,
            flush_check_interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    aggregator.close_elapsed(Utc::now()).await;
                }
                cmd = rx.recv() => {
                    match cmd {
                        Some(IngestCommand::Reading(reading)) => {
                            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                            aggregator.ingest(reading).await;
                        }
                        Some(IngestCommand::Flush(done)) => {
                            let saved = aggregator.flush().await;
                            tracing::debug!(saved, "flush on demand");
                            let _ = done.send(());
                        }
                        None => {
                            let saved = aggregator.flush().await;
                            tracing::info!(saved, "ingest worker stopped");
                            break;
                        }
                    }
                }
            }
        }
    })
}
