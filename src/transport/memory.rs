//! A bounded in-process transport: `consume` drains whatever is queued and returns.

use super::{BatchHandler, Disposition, QueueClient};
use crate::error::WorkerError;
use crate::item::QueueItem;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<QueueItem>>,
    unacknowledged: HashMap<String, Vec<QueueItem>>,
}

/// Thread-safe in-memory queues keyed by name.
///
/// Items left unacknowledged by a handler are kept aside rather than redelivered,
/// so a bounded run always terminates.
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<State>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items waiting across all queues.
    pub fn local_queue_size(&self) -> usize {
        self.state.lock().queues.values().map(VecDeque::len).sum()
    }

    pub fn queue_len(&self, queue_name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    /// Items whose handling was interrupted and never acknowledged.
    pub fn unacknowledged(&self, queue_name: &str) -> Vec<QueueItem> {
        self.state
            .lock()
            .unacknowledged
            .get(queue_name)
            .cloned()
            .unwrap_or_default()
    }

    fn next_batch(&self, queue_name: &str, batch_size: usize) -> Vec<QueueItem> {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Vec::new();
        };
        let take = batch_size.max(1).min(queue.len());
        queue.drain(..take).collect()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn enqueue(&self, queue_name: &str, item: QueueItem) -> Result<(), WorkerError> {
        self.state
            .lock()
            .queues
            .entry(queue_name.to_string())
            .or_default()
            .push_back(item);
        Ok(())
    }

    async fn consume(
        &self,
        queue_name: &str,
        batch_size: usize,
        _timeout: Option<Duration>,
        handler: &mut (dyn BatchHandler + Send),
    ) -> Result<(), WorkerError> {
        loop {
            let batch = self.next_batch(queue_name, batch_size);
            if batch.is_empty() {
                return Ok(());
            }

            let kept = batch.clone();
            if handler.handle_batch(batch).await == Disposition::Redeliver {
                log::debug!(
                    "Leaving {} interrupted item(s) on queue {} unacknowledged",
                    kept.len(),
                    queue_name
                );
                self.state
                    .lock()
                    .unacknowledged
                    .entry(queue_name.to_string())
                    .or_default()
                    .extend(kept);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Recorder {
        batches: Vec<Vec<String>>,
        redeliver: bool,
    }

    #[async_trait]
    impl BatchHandler for Recorder {
        async fn handle_batch(&mut self, batch: Vec<QueueItem>) -> Disposition {
            self.batches.push(
                batch
                    .iter()
                    .map(|item| item.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string())
                    .collect(),
            );
            if self.redeliver {
                Disposition::Redeliver
            } else {
                Disposition::Ack
            }
        }

        async fn handle_unparsable(&mut self, _item: QueueItem) {}
    }

    fn item(kind: &str) -> QueueItem {
        QueueItem::try_from(json!({ "type": kind })).unwrap()
    }

    #[tokio::test]
    async fn test_consume_chunks_by_batch_size_in_order() {
        let queue = InMemoryQueue::new();
        for kind in ["a", "b", "c", "d", "e"] {
            queue.enqueue("q", item(kind)).await.unwrap();
        }
        queue.enqueue("other", item("x")).await.unwrap();

        let mut recorder = Recorder { batches: Vec::new(), redeliver: false };
        queue.consume("q", 2, None, &mut recorder).await.unwrap();

        assert_eq!(
            recorder.batches,
            vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]
        );
        assert_eq!(queue.queue_len("q"), 0);
        assert_eq!(queue.local_queue_size(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_batches_are_set_aside() {
        let queue = InMemoryQueue::new();
        queue.enqueue("q", item("stuck")).await.unwrap();

        let mut recorder = Recorder { batches: Vec::new(), redeliver: true };
        queue.consume("q", 1, None, &mut recorder).await.unwrap();

        assert_eq!(recorder.batches.len(), 1);
        assert_eq!(queue.unacknowledged("q"), vec![item("stuck")]);
        assert_eq!(queue.local_queue_size(), 0);
    }
}
