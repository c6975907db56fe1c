use std::{env, sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, error};

use crate::{
    buffer::BufferReceiver, metrics::AppMetrics, models::RawMessage, pipeline::PipelineStats,
    processor::Processor,
};

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_timeout: Duration::from_millis(100),
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Self {
        let batch_size = env::var("BATCH_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(100)
            .clamp(50, 500);
        let flush_timeout_ms = env::var("FLUSH_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(100)
            .clamp(50, 500);

        Self {
            batch_size,
            flush_timeout: Duration::from_millis(flush_timeout_ms),
        }
    }
}

pub fn spawn(
    receiver: BufferReceiver,
    processor: Arc<Processor>,
    config: BatchConfig,
    metrics: Arc<AppMetrics>,
    stats: Arc<PipelineStats>,
) -> JoinHandle<()> {
    tokio::spawn(run_batcher(receiver, processor, config, metrics, stats))
}

/// Accumulates messages until the batch is full or the flush deadline set by
/// the batch's first message passes, then hands the batch to the processor.
/// When the buffer closes, whatever remains is drained and flushed as a
/// final undersized batch.
async fn run_batcher(
    mut receiver: BufferReceiver,
    processor: Arc<Processor>,
    config: BatchConfig,
    metrics: Arc<AppMetrics>,
    stats: Arc<PipelineStats>,
) {
    loop {
        let Some(first) = receiver.recv().await else {
            break;
        };

        let deadline = Instant::now() + config.flush_timeout;
        let mut batch = Vec::with_capacity(config.batch_size);
        batch.push(first);
        let mut buffer_closed = false;

        while batch.len() < config.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, receiver.recv()).await {
                Ok(Some(message)) => batch.push(message),
                Ok(None) => {
                    buffer_closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        flush(&processor, batch, &metrics, &stats).await;

        if buffer_closed {
            break;
        }
    }

    debug!("batcher drained and stopped");
}

async fn flush(
    processor: &Processor,
    batch: Vec<RawMessage>,
    metrics: &AppMetrics,
    stats: &PipelineStats,
) {
    let size = batch.len();
    let started = Instant::now();
    match processor.process_batch(batch).await {
        Ok(stored) => {
            metrics.observe_batch_flushed(stored, started.elapsed());
            stats.record_flush(stored);
            debug!(batch_size = stored, "batch stored");
        }
        Err(error) => {
            // The batch is gone; the loss counter is the only record of it.
            metrics.observe_batch_failure();
            stats.record_batch_loss(size);
            error!(error = %error, batch_size = size, "batch lost, store rejected it");
        }
    }
}
