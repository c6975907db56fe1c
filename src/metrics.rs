use std::time::Duration;

use prometheus::{
    opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    messages_ingested_total: IntCounter,
    messages_dropped_total: IntCounter,
    messages_stored_total: IntCounter,
    batches_flushed_total: IntCounter,
    batch_failures_total: IntCounter,
    batch_size: Histogram,
    store_batch_duration_seconds: Histogram,
    irc_reconnects_total: IntCounter,
    irc_parse_errors_total: IntCounter,
    sse_clients: IntGauge,
    sse_events_dropped_total: IntCounter,
    sse_fallbacks_total: IntCounterVec,
}

pub struct SseClientGuard {
    gauge: IntGauge,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_ingested_total = IntCounter::with_opts(opts!(
            "chatvault_messages_ingested_total",
            "Chat messages accepted by the ingestion pipeline"
        ))
        .expect("valid messages_ingested_total metric");

        let messages_dropped_total = IntCounter::with_opts(opts!(
            "chatvault_messages_dropped_total",
            "Chat messages shed because the ingest buffer was full"
        ))
        .expect("valid messages_dropped_total metric");

        let messages_stored_total = IntCounter::with_opts(opts!(
            "chatvault_messages_stored_total",
            "Chat messages durably stored"
        ))
        .expect("valid messages_stored_total metric");

        let batches_flushed_total = IntCounter::with_opts(opts!(
            "chatvault_batches_flushed_total",
            "Batches handed to the processor"
        ))
        .expect("valid batches_flushed_total metric");

        let batch_failures_total = IntCounter::with_opts(opts!(
            "chatvault_batch_failures_total",
            "Batches lost because the store rejected them"
        ))
        .expect("valid batch_failures_total metric");

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("chatvault_batch_size", "Messages per flushed batch")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
        )
        .expect("valid batch_size metric");

        let store_batch_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "chatvault_store_batch_duration_seconds",
            "Latency of persisting one batch",
        ))
        .expect("valid store_batch_duration_seconds metric");

        let irc_reconnects_total = IntCounter::with_opts(opts!(
            "chatvault_irc_reconnects_total",
            "IRC reconnect attempts"
        ))
        .expect("valid irc_reconnects_total metric");

        let irc_parse_errors_total = IntCounter::with_opts(opts!(
            "chatvault_irc_parse_errors_total",
            "IRC lines that failed to parse"
        ))
        .expect("valid irc_parse_errors_total metric");

        let sse_clients = IntGauge::new("chatvault_sse_clients", "Connected live-stream clients")
            .expect("valid sse_clients metric");

        let sse_events_dropped_total = IntCounter::with_opts(opts!(
            "chatvault_sse_events_dropped_total",
            "Live events shed because a client outbox was full"
        ))
        .expect("valid sse_events_dropped_total metric");

        let sse_fallbacks_total = IntCounterVec::new(
            opts!(
                "chatvault_sse_fallbacks_total",
                "Fallback statuses sent to live-stream clients by reason"
            ),
            &["reason"],
        )
        .expect("valid sse_fallbacks_total metric");

        registry
            .register(Box::new(messages_ingested_total.clone()))
            .expect("register messages_ingested_total");
        registry
            .register(Box::new(messages_dropped_total.clone()))
            .expect("register messages_dropped_total");
        registry
            .register(Box::new(messages_stored_total.clone()))
            .expect("register messages_stored_total");
        registry
            .register(Box::new(batches_flushed_total.clone()))
            .expect("register batches_flushed_total");
        registry
            .register(Box::new(batch_failures_total.clone()))
            .expect("register batch_failures_total");
        registry
            .register(Box::new(batch_size.clone()))
            .expect("register batch_size");
        registry
            .register(Box::new(store_batch_duration_seconds.clone()))
            .expect("register store_batch_duration_seconds");
        registry
            .register(Box::new(irc_reconnects_total.clone()))
            .expect("register irc_reconnects_total");
        registry
            .register(Box::new(irc_parse_errors_total.clone()))
            .expect("register irc_parse_errors_total");
        registry
            .register(Box::new(sse_clients.clone()))
            .expect("register sse_clients");
        registry
            .register(Box::new(sse_events_dropped_total.clone()))
            .expect("register sse_events_dropped_total");
        registry
            .register(Box::new(sse_fallbacks_total.clone()))
            .expect("register sse_fallbacks_total");

        Self {
            registry,
            messages_ingested_total,
            messages_dropped_total,
            messages_stored_total,
            batches_flushed_total,
            batch_failures_total,
            batch_size,
            store_batch_duration_seconds,
            irc_reconnects_total,
            irc_parse_errors_total,
            sse_clients,
            sse_events_dropped_total,
            sse_fallbacks_total,
        }
    }

    pub fn observe_ingested(&self) {
        self.messages_ingested_total.inc();
    }

    pub fn observe_dropped(&self) {
        self.messages_dropped_total.inc();
    }

    pub fn observe_batch_flushed(&self, size: usize, duration: Duration) {
        self.batches_flushed_total.inc();
        self.batch_size.observe(size as f64);
        self.store_batch_duration_seconds
            .observe(duration.as_secs_f64());
        self.messages_stored_total.inc_by(size as u64);
    }

    pub fn observe_batch_failure(&self) {
        self.batch_failures_total.inc();
    }

    pub fn observe_irc_reconnect(&self) {
        self.irc_reconnects_total.inc();
    }

    pub fn observe_parse_error(&self) {
        self.irc_parse_errors_total.inc();
    }

    pub fn observe_sse_drop(&self) {
        self.sse_events_dropped_total.inc();
    }

    pub fn observe_sse_fallback(&self, reason: &str) {
        self.sse_fallbacks_total.with_label_values(&[reason]).inc();
    }

    pub fn sse_client_guard(&self) -> SseClientGuard {
        self.sse_clients.inc();
        SseClientGuard {
            gauge: self.sse_clients.clone(),
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SseClientGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
