use std::{sync::Arc, time::Duration};

use chatvault::{
    batcher::BatchConfig,
    models::RawMessage,
    pipeline::PipelineConfig,
    state::{AppConfig, AppState},
    store::{memory::MemoryStore, ChannelRepo, MessageRepo},
};
use tokio::time::{sleep, Instant};

fn app_config(batch_size: usize, flush_timeout: Duration, buffer_size: usize) -> AppConfig {
    AppConfig {
        pipeline: PipelineConfig {
            buffer_size,
            batch: BatchConfig {
                batch_size,
                flush_timeout,
            },
            drain_timeout: Duration::from_secs(10),
        },
        ..AppConfig::default()
    }
}

async fn wait_for_count(store: &MemoryStore, expected: i64, budget: Duration) {
    let deadline = Instant::now() + budget;
    loop {
        let count = store.message_count().await.expect("message count");
        if count == expected {
            return;
        }
        if Instant::now() >= deadline {
            panic!("expected {expected} stored messages, found {count}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn full_batch_is_stored_as_one_insert_with_counters() {
    let store = Arc::new(MemoryStore::default());
    let state = AppState::with_config(
        store.clone(),
        app_config(2, Duration::from_secs(1), 10_000),
    );

    state.pipeline.ingest(RawMessage::new("#a", "u", "U", "hi"));
    state.pipeline.ingest(RawMessage::new("#a", "v", "V", "ho"));

    wait_for_count(&store, 2, Duration::from_millis(500)).await;
    assert_eq!(store.recorded_batches().await, vec![2]);

    let messages = store.get_global_after_id(0, 10).await.expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text, "hi");
    assert_eq!(messages[1].text, "ho");
    assert!(messages[0].id < messages[1].id);

    let channel = store
        .get_channel("a")
        .await
        .expect("channel lookup")
        .expect("channel exists");
    assert_eq!(channel.total_messages, 2);

    state.pipeline.stop().await;
}

#[tokio::test]
async fn burst_against_slow_store_sheds_but_never_reorders() {
    let store = Arc::new(MemoryStore::with_write_delay(Duration::from_millis(100)));
    let state = AppState::with_config(
        store.clone(),
        app_config(10, Duration::from_millis(10), 10),
    );

    for index in 0..1_000 {
        state
            .pipeline
            .ingest(RawMessage::new("a", "u", "U", format!("{index}")));
    }
    state.pipeline.stop().await;

    let stats = state.pipeline.stats();
    assert_eq!(stats.ingested(), 1_000);
    assert!(stats.dropped() > 0);
    assert_eq!(stats.stored() + stats.dropped(), 1_000);
    assert_eq!(
        store.message_count().await.expect("count") as u64,
        stats.stored()
    );

    let stored = store
        .get_global_after_id(0, 1_000)
        .await
        .expect("stored messages");
    let mut previous = -1i64;
    for message in &stored {
        let index = message.text.parse::<i64>().expect("sequence number");
        assert!(
            index > previous,
            "arrival order violated: {index} after {previous}"
        );
        previous = index;
    }
}

#[tokio::test]
async fn stop_flushes_partial_batch_before_returning() {
    let store = Arc::new(MemoryStore::default());
    let state = AppState::with_config(
        store.clone(),
        app_config(100, Duration::from_secs(10), 10_000),
    );

    for index in 0..7 {
        state
            .pipeline
            .ingest(RawMessage::new("a", "u", "U", format!("m{index}")));
    }
    state.pipeline.stop().await;

    assert_eq!(store.message_count().await.expect("count"), 7);
    assert_eq!(store.recorded_batches().await, vec![7]);

    let stats = state.pipeline.stats();
    assert_eq!(stats.stored() + stats.dropped(), stats.ingested());
}
