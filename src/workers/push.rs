//! `missedmessage_mobile_notifications`: mobile push delivery through a remote bouncer.

use crate::error::WorkerError;
use crate::handler::QueueProcessor;
use crate::item::QueueItem;
use crate::retry::RetryOutcome;
use crate::worker::{QueueWorker, WorkerContext};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const QUEUE_NAME: &str = "missedmessage_mobile_notifications";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PushError {
    /// The bouncer asked us to try again later.
    #[error("push bouncer asked to retry later: {0}")]
    RetryLater(String),
    #[error("push notification failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait PushBackend: Send + Sync {
    /// Sends a notification for a new message; `event` is the item as published.
    async fn send_notification(&self, user_profile_id: u64, event: &QueueItem) -> Result<(), PushError>;

    /// Retracts notifications for messages that were read elsewhere.
    async fn remove_notifications(&self, user_profile_id: u64, message_ids: &[u64]) -> Result<(), PushError>;
}

#[derive(Debug, Deserialize)]
struct Target {
    user_profile_id: u64,
}

#[derive(Debug, Deserialize)]
struct RemoveEvent {
    user_profile_id: u64,
    #[serde(default)]
    message_ids: Option<Vec<u64>>,
    /// Older publishers sent a single id.
    #[serde(default)]
    message_id: Option<u64>,
}

impl RemoveEvent {
    fn message_ids(&self) -> Vec<u64> {
        match (&self.message_ids, self.message_id) {
            (Some(ids), _) => ids.clone(),
            (None, Some(id)) => vec![id],
            (None, None) => Vec::new(),
        }
    }
}

pub struct PushNotificationsProcessor {
    backend: Arc<dyn PushBackend>,
    abandoned: AtomicUsize,
}

impl PushNotificationsProcessor {
    pub fn new(backend: Arc<dyn PushBackend>) -> Self {
        Self {
            backend,
            abandoned: AtomicUsize::new(0),
        }
    }

    /// Events given up on after exhausting their retries.
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueueProcessor for PushNotificationsProcessor {
    async fn consume(&self, item: QueueItem, ctx: &WorkerContext) -> Result<(), WorkerError> {
        let is_remove = item.get("type").and_then(|v| v.as_str()) == Some("remove");

        let (user_profile_id, result) = if is_remove {
            let event: RemoveEvent = item.decode()?;
            let result = self
                .backend
                .remove_notifications(event.user_profile_id, &event.message_ids())
                .await;
            (event.user_profile_id, result)
        } else {
            let target: Target = item.decode()?;
            let result = self.backend.send_notification(target.user_profile_id, &item).await;
            (target.user_profile_id, result)
        };

        match result {
            Ok(()) => Ok(()),
            Err(PushError::RetryLater(reason)) => {
                log::debug!("Push bouncer unavailable for user {}: {}", user_profile_id, reason);
                let outcome = ctx
                    .retry_event(item, |_| {
                        log::warn!(
                            "Maximum retries exceeded for trigger:{} event:push_notification",
                            user_profile_id
                        );
                    })
                    .await?;
                if let RetryOutcome::Exhausted(_) = outcome {
                    self.abandoned.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(e) => Err(WorkerError::handler("PushNotificationError", e.to_string())),
        }
    }
}

pub type PushNotificationsWorker = QueueWorker<PushNotificationsProcessor>;

pub fn worker(backend: Arc<dyn PushBackend>) -> Result<PushNotificationsWorker, WorkerError> {
    QueueWorker::new(QUEUE_NAME, PushNotificationsProcessor::new(backend))
}
