//! `embed_links`: fetches link previews for a message and re-renders it.

use crate::error::WorkerError;
use crate::handler::{format_seconds, QueueProcessor, TimeoutAction};
use crate::item::QueueItem;
use crate::worker::{QueueWorker, WorkerContext};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE_NAME: &str = "embed_links";

/// Fetching is bounded so one slow site cannot stall the queue.
pub const MAX_CONSUME: Duration = Duration::from_secs(60);

#[async_trait]
pub trait LinkPreviewer: Send + Sync {
    /// Fetches and caches preview data for one URL.
    async fn fetch_embed_data(&self, url: &str) -> Result<(), WorkerError>;

    /// Re-renders the message so cached previews show up.
    async fn render_message(&self, message_id: u64) -> Result<(), WorkerError>;
}

#[derive(Debug, Deserialize)]
struct EmbedLinksEvent {
    message_id: u64,
    #[serde(default)]
    urls: Vec<String>,
}

pub struct EmbedLinksProcessor {
    previewer: Arc<dyn LinkPreviewer>,
}

impl EmbedLinksProcessor {
    pub fn new(previewer: Arc<dyn LinkPreviewer>) -> Self {
        Self { previewer }
    }
}

#[async_trait]
impl QueueProcessor for EmbedLinksProcessor {
    async fn consume(&self, item: QueueItem, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        let event: EmbedLinksEvent = item.decode()?;
        for url in &event.urls {
            self.previewer.fetch_embed_data(url).await?;
        }
        self.previewer.render_message(event.message_id).await
    }

    /// Logs the URLs being fetched; the item is skipped, not dead-lettered.
    fn on_timeout(&self, _queue_name: &str, limit: Duration, items: &[QueueItem]) -> TimeoutAction {
        for item in items {
            match item.decode::<EmbedLinksEvent>() {
                Ok(event) => log::warn!(
                    "Timed out after {} seconds while fetching URLs for message {}: {:?}",
                    format_seconds(limit),
                    event.message_id,
                    event.urls
                ),
                Err(_) => log::warn!(
                    "Timed out after {} seconds while fetching URLs for {:?}",
                    format_seconds(limit),
                    item.as_map()
                ),
            }
        }
        TimeoutAction::Skip
    }
}

pub type EmbedLinksWorker = QueueWorker<EmbedLinksProcessor>;

pub fn worker(previewer: Arc<dyn LinkPreviewer>) -> Result<EmbedLinksWorker, WorkerError> {
    Ok(QueueWorker::new(QUEUE_NAME, EmbedLinksProcessor::new(previewer))?.max_consume(MAX_CONSUME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::dlq::DeadLetterLog;
    use crate::transport::{InMemoryQueue, QueueClient};
    use crate::worker::Worker;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct SlowPreviewer {
        delay: Option<Duration>,
        fetched: Mutex<Vec<String>>,
        rendered: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl LinkPreviewer for SlowPreviewer {
        async fn fetch_embed_data(&self, url: &str) -> Result<(), WorkerError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.fetched.lock().push(url.to_string());
            Ok(())
        }

        async fn render_message(&self, message_id: u64) -> Result<(), WorkerError> {
            self.rendered.lock().push(message_id);
            Ok(())
        }
    }

    fn event() -> QueueItem {
        QueueItem::try_from(json!({ "message_id": 15, "urls": ["first", "second"] })).unwrap()
    }

    #[tokio::test]
    async fn test_urls_are_fetched_then_the_message_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryQueue::new());
        queue.enqueue(QUEUE_NAME, event()).await.unwrap();

        let previewer = Arc::new(SlowPreviewer::default());
        let mut worker = worker(previewer.clone()).unwrap();
        worker.setup(queue, Arc::new(QueueSettings::builder().queue_error_dir(dir.path()).build()));
        worker.start().await.unwrap();

        assert_eq!(*previewer.fetched.lock(), vec!["first", "second"]);
        assert_eq!(*previewer.rendered.lock(), vec![15]);
    }

    #[tokio::test]
    async fn test_timeout_skips_instead_of_dead_lettering() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryQueue::new());
        queue.enqueue(QUEUE_NAME, event()).await.unwrap();

        let previewer = Arc::new(SlowPreviewer {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        let mut worker = worker(previewer.clone())
            .unwrap()
            .max_consume(Duration::from_millis(100))
            .enable_timeouts(true);
        worker.setup(
            queue.clone(),
            Arc::new(QueueSettings::builder().queue_error_dir(dir.path()).build()),
        );
        let stats = worker.start().await.unwrap();

        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.dead_lettered, 0);
        assert!(previewer.rendered.lock().is_empty());
        assert!(queue.unacknowledged(QUEUE_NAME).is_empty());
        assert!(DeadLetterLog::new(dir.path(), QUEUE_NAME).read_all().await.unwrap().is_empty());
    }
}
