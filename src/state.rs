use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::{
    broadcaster::{Broadcaster, BroadcasterConfig},
    irc::IrcClient,
    metrics::AppMetrics,
    pipeline::{Pipeline, PipelineConfig},
    processor::Processor,
    sse::SseConfig,
    store::MessageStore,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
    pub broadcaster: BroadcasterConfig,
    pub sse: SseConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            pipeline: PipelineConfig::from_env(),
            broadcaster: BroadcasterConfig::from_env(),
            sse: SseConfig::from_env(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub pipeline: Arc<Pipeline>,
    pub broadcaster: Arc<Broadcaster>,
    pub metrics: Arc<AppMetrics>,
    pub sse: SseConfig,
    pub irc: Option<IrcClient>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self::with_config(store, AppConfig::from_env())
    }

    /// Explicit-config constructor; the tests use this to pin batch sizes,
    /// outbox capacities and heartbeat periods without touching the process
    /// environment.
    pub fn with_config(store: Arc<dyn MessageStore>, config: AppConfig) -> Self {
        let metrics = Arc::new(AppMetrics::new());
        let shutdown = CancellationToken::new();

        let broadcaster = Arc::new(Broadcaster::new(
            store.clone(),
            config.broadcaster,
            metrics.clone(),
        ));
        broadcaster
            .clone()
            .spawn_metrics_publisher(shutdown.clone());

        let processor = Arc::new(Processor::new(store.clone(), broadcaster.clone()));
        let pipeline = Arc::new(Pipeline::start(processor, config.pipeline, metrics.clone()));

        Self {
            store,
            pipeline,
            broadcaster,
            metrics,
            sse: config.sse,
            irc: None,
            shutdown,
        }
    }

    pub fn with_irc(mut self, irc: IrcClient) -> Self {
        self.irc = Some(irc);
        self
    }
}
