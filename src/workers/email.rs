//! `email_senders`: delivers templated emails, retrying transient delivery failures.

use crate::error::WorkerError;
use crate::handler::QueueProcessor;
use crate::item::QueueItem;
use crate::retry::RetryOutcome;
use crate::worker::{QueueWorker, WorkerContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

pub const QUEUE_NAME: &str = "email_senders";

/// An email to render from `template_prefix` and send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRequest {
    pub template_prefix: String,
    #[serde(default)]
    pub to_emails: Vec<String>,
    #[serde(default)]
    pub to_user_ids: Vec<u64>,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub from_address: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmailError {
    /// The mail server did not accept the message; worth retrying.
    #[error("email was not delivered: {0}")]
    NotDelivered(String),
    /// The request itself is unusable.
    #[error("invalid email request: {0}")]
    Invalid(String),
}

impl EmailError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmailError::NotDelivered(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EmailError::NotDelivered(_) => "EmailNotDeliveredException",
            EmailError::Invalid(_) => "InvalidEmailRequest",
        }
    }
}

#[async_trait]
pub trait EmailBackend: Send + Sync {
    async fn send_email(&self, request: &EmailRequest) -> Result<(), EmailError>;
}

pub struct EmailProcessor {
    backend: Arc<dyn EmailBackend>,
    abandoned: Mutex<Vec<QueueItem>>,
}

impl EmailProcessor {
    pub fn new(backend: Arc<dyn EmailBackend>) -> Self {
        Self {
            backend,
            abandoned: Mutex::new(Vec::new()),
        }
    }

    /// Items given up on after exhausting their retries, as last published.
    pub fn abandoned(&self) -> Vec<QueueItem> {
        self.abandoned.lock().clone()
    }
}

#[async_trait]
impl QueueProcessor for EmailProcessor {
    async fn consume(&self, item: QueueItem, ctx: &WorkerContext) -> Result<(), WorkerError> {
        let request: EmailRequest = item.decode()?;

        let error = match self.backend.send_email(&request).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(WorkerError::handler(e.kind(), e.to_string())),
        };

        let kind = error.kind();
        let outcome = ctx
            .retry_event(item, |item| {
                log::error!("Event {:?} failed due to exception {}", item.as_map(), kind);
            })
            .await?;

        match outcome {
            RetryOutcome::Requeued { failed_tries } => {
                log::info!("Retrying email to {:?} (attempt {})", request.to_emails, failed_tries);
            }
            RetryOutcome::Exhausted(item) => self.abandoned.lock().push(item),
        }
        Ok(())
    }
}

pub type EmailSendingWorker = QueueWorker<EmailProcessor>;

pub fn worker(backend: Arc<dyn EmailBackend>) -> Result<EmailSendingWorker, WorkerError> {
    QueueWorker::new(QUEUE_NAME, EmailProcessor::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueSettings, MAX_REQUEST_RETRIES};
    use crate::dlq::DeadLetterLog;
    use crate::transport::{InMemoryQueue, QueueClient};
    use crate::worker::Worker;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyBackend {
        error: Option<EmailError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmailBackend for FlakyBackend {
        async fn send_email(&self, _request: &EmailRequest) -> Result<(), EmailError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    fn request() -> QueueItem {
        QueueItem::try_from(json!({
            "template_prefix": "zerver/emails/confirm_new_email",
            "to_emails": ["hamlet@zulip.com"],
            "from_name": "Zulip Account Security",
            "from_address": "noreply@zulip.com",
            "context": {},
        }))
        .unwrap()
    }

    async fn run(error: Option<EmailError>) -> (Arc<FlakyBackend>, EmailSendingWorker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(InMemoryQueue::new());
        queue.enqueue(QUEUE_NAME, request()).await.unwrap();

        let backend = Arc::new(FlakyBackend { error, calls: AtomicUsize::new(0) });
        let mut worker = worker(backend.clone()).unwrap();
        worker.setup(
            queue.clone(),
            Arc::new(QueueSettings::builder().queue_error_dir(dir.path()).build()),
        );
        worker.start().await.unwrap();
        assert_eq!(queue.local_queue_size(), 0);

        (backend, worker, dir)
    }

    #[tokio::test]
    async fn test_delivered_email_is_sent_once() {
        let (backend, worker, _dir) = run(None).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(worker.processor().abandoned().is_empty());
    }

    #[tokio::test]
    async fn test_undeliverable_email_is_retried_then_abandoned() {
        let (backend, worker, dir) = run(Some(EmailError::NotDelivered("smtp down".into()))).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1 + MAX_REQUEST_RETRIES as usize);
        let abandoned = worker.processor().abandoned();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].failed_tries(), 1 + MAX_REQUEST_RETRIES);

        // Giving up is not a processing failure.
        let records = DeadLetterLog::new(dir.path(), QUEUE_NAME).read_all().await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_is_dead_lettered_without_retry() {
        let (backend, worker, dir) = run(Some(EmailError::Invalid("no recipients".into()))).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(worker.processor().abandoned().is_empty());
        let records = DeadLetterLog::new(dir.path(), QUEUE_NAME).read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].items, vec![request()]);
    }
}
