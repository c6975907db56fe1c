use std::{
    env,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::Serialize;
use tokio::{task::JoinHandle, time::timeout};
use tracing::{info, warn};

use crate::{
    batcher::{self, BatchConfig},
    buffer::{self, BatchBuffer},
    irc::ChatEvents,
    metrics::AppMetrics,
    models::RawMessage,
    processor::Processor,
};

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub buffer_size: usize,
    pub batch: BatchConfig,
    pub drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10_000,
            batch: BatchConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let buffer_size = env::var("BUFFER_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(10_000);
        let drain_timeout_secs = env::var("DRAIN_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(30);

        Self {
            buffer_size,
            batch: BatchConfig::from_env(),
            drain_timeout: Duration::from_secs(drain_timeout_secs),
        }
    }
}

#[derive(Default)]
pub struct PipelineStats {
    ingested: AtomicU64,
    dropped: AtomicU64,
    stored: AtomicU64,
    batches_flushed: AtomicU64,
    batches_failed: AtomicU64,
    messages_lost: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct PipelineStatsSnapshot {
    pub ingested: u64,
    pub dropped: u64,
    pub stored: u64,
    pub batches_flushed: u64,
    pub batches_failed: u64,
    pub messages_lost: u64,
}

impl PipelineStats {
    pub fn record_flush(&self, stored: usize) {
        self.stored.fetch_add(stored as u64, Ordering::Relaxed);
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_loss(&self, size: usize) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.messages_lost.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn ingested(&self) -> u64 {
        self.ingested.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn batches_failed(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }

    pub fn messages_lost(&self) -> u64 {
        self.messages_lost.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            ingested: self.ingested.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            messages_lost: self.messages_lost.load(Ordering::Relaxed),
        }
    }
}

/// Wires buffer, batcher and processor together and owns their lifecycle.
/// `ingest` is the IRC reader's single entry point and never blocks it.
pub struct Pipeline {
    buffer: Mutex<Option<BatchBuffer>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<PipelineStats>,
    metrics: Arc<AppMetrics>,
    drain_timeout: Duration,
}

impl Pipeline {
    pub fn start(
        processor: Arc<Processor>,
        config: PipelineConfig,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        let (buffer, receiver) = buffer::bounded(config.buffer_size);
        let stats = Arc::new(PipelineStats::default());
        let worker = batcher::spawn(
            receiver,
            processor,
            config.batch,
            metrics.clone(),
            stats.clone(),
        );

        Self {
            buffer: Mutex::new(Some(buffer)),
            worker: Mutex::new(Some(worker)),
            stats,
            metrics,
            drain_timeout: config.drain_timeout,
        }
    }

    /// Returns false when the message was shed (buffer full or pipeline
    /// already stopped).
    pub fn ingest(&self, message: RawMessage) -> bool {
        self.stats.ingested.fetch_add(1, Ordering::Relaxed);
        self.metrics.observe_ingested();

        let accepted = {
            let guard = self.buffer.lock().expect("pipeline buffer lock");
            match guard.as_ref() {
                Some(buffer) => buffer.try_enqueue(message),
                None => false,
            }
        };

        if !accepted {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            self.metrics.observe_dropped();
        }
        accepted
    }

    /// Closes the buffer and waits for the batcher to drain and flush its
    /// final batch, up to the drain timeout.
    pub async fn stop(&self) {
        let buffer = self.buffer.lock().expect("pipeline buffer lock").take();
        drop(buffer);

        let worker = self.worker.lock().expect("pipeline worker lock").take();
        let Some(worker) = worker else {
            return;
        };

        match timeout(self.drain_timeout, worker).await {
            Ok(Ok(())) => info!(snapshot = ?self.stats.snapshot(), "pipeline drained"),
            Ok(Err(error)) => warn!(error = %error, "batcher task failed during drain"),
            Err(_) => warn!(
                timeout_secs = self.drain_timeout.as_secs(),
                "batcher did not drain in time"
            ),
        }
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }
}

impl ChatEvents for Pipeline {
    fn on_message(&self, message: RawMessage) {
        self.ingest(message);
    }

    fn on_channel_change(&self, channel: &str, joined: bool) {
        info!(channel, joined, "channel membership changed");
    }
}
