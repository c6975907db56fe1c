use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::RawMessage;

/// Bounded FIFO between the IRC reader and the batcher. Enqueue never
/// blocks: a full buffer sheds the message and counts the drop, because
/// back-pressuring the IRC reader would stall keep-alive handling and get
/// the connection killed server-side.
pub fn bounded(capacity: usize) -> (BatchBuffer, BufferReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        BatchBuffer {
            tx,
            dropped: dropped.clone(),
        },
        BufferReceiver { rx, dropped },
    )
}

#[derive(Clone)]
pub struct BatchBuffer {
    tx: mpsc::Sender<RawMessage>,
    dropped: Arc<AtomicU64>,
}

impl BatchBuffer {
    /// Returns false when the message was shed.
    pub fn try_enqueue(&self, message: RawMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct BufferReceiver {
    rx: mpsc::Receiver<RawMessage>,
    dropped: Arc<AtomicU64>,
}

impl BufferReceiver {
    /// FIFO dequeue; yields `None` once every sender is gone and the buffer
    /// has drained.
    pub async fn recv(&mut self) -> Option<RawMessage> {
        self.rx.recv().await
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_sheds_newest_and_counts() {
        let (buffer, mut receiver) = bounded(2);

        assert!(buffer.try_enqueue(RawMessage::new("a", "u", "U", "1")));
        assert!(buffer.try_enqueue(RawMessage::new("a", "u", "U", "2")));
        assert!(!buffer.try_enqueue(RawMessage::new("a", "u", "U", "3")));
        assert_eq!(buffer.dropped(), 1);

        let first = receiver.recv().await.expect("first message");
        let second = receiver.recv().await.expect("second message");
        assert_eq!(first.text, "1");
        assert_eq!(second.text, "2");
    }

    #[tokio::test]
    async fn dequeue_preserves_arrival_order_and_closes() {
        let (buffer, mut receiver) = bounded(16);
        for index in 0..5 {
            assert!(buffer.try_enqueue(RawMessage::new("a", "u", "U", format!("m{index}"))));
        }
        drop(buffer);

        let mut texts = Vec::new();
        while let Some(message) = receiver.recv().await {
            texts.push(message.text);
        }
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
    }
}
