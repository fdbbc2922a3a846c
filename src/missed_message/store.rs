//! Durable rows backing pending missed-message notifications.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Why a user is being notified about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTrigger {
    PrivateMessage,
    Mentioned,
    WildcardMentioned,
    StreamEmailNotify,
}

/// One pending notification for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub user_profile_id: u64,
    pub message_id: u64,
    pub trigger: NotificationTrigger,
    pub mentioned_user_group_id: Option<u64>,
    pub scheduled_timestamp: DateTime<Utc>,
}

/// Persistence for scheduled notification rows.
///
/// `take_due` must read and delete as one atomic step so rows appended concurrently
/// are neither sent twice nor lost.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// The deadline of the recipient's batch that is still open at `now`, if any.
    async fn open_batch_deadline(
        &self,
        user_profile_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Persists a row. Rows referencing missing messages or duplicating an existing
    /// `(user_profile_id, message_id)` pair fail with `StoreError::Integrity`.
    async fn insert(&self, row: ScheduledNotification) -> Result<(), StoreError>;

    /// Recipients with at least one row scheduled at or before `now`, ascending.
    async fn due_recipients(&self, now: DateTime<Utc>) -> Result<Vec<u64>, StoreError>;

    /// Removes and returns the recipient's rows scheduled at or before `up_to`,
    /// in insertion order.
    async fn take_due(
        &self,
        user_profile_id: u64,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<ScheduledNotification>, StoreError>;

    async fn has_pending(&self) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Rows {
    rows: Vec<ScheduledNotification>,
    deleted_messages: HashSet<u64>,
}

/// A process-local `NotificationStore`.
#[derive(Default)]
pub struct InMemoryNotificationStore {
    inner: Mutex<Rows>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a message as deleted; later rows referencing it are rejected.
    pub fn delete_message(&self, message_id: u64) {
        self.inner.lock().deleted_messages.insert(message_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows_for(&self, user_profile_id: u64) -> Vec<ScheduledNotification> {
        self.inner
            .lock()
            .rows
            .iter()
            .filter(|row| row.user_profile_id == user_profile_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn open_batch_deadline(
        &self,
        user_profile_id: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .rows
            .iter()
            .filter(|row| row.user_profile_id == user_profile_id && row.scheduled_timestamp > now)
            .map(|row| row.scheduled_timestamp)
            .min())
    }

    async fn insert(&self, row: ScheduledNotification) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        if inner.deleted_messages.contains(&row.message_id) {
            return Err(StoreError::Integrity(format!(
                "message {} does not exist",
                row.message_id
            )));
        }
        let duplicate = inner.rows.iter().any(|existing| {
            existing.user_profile_id == row.user_profile_id && existing.message_id == row.message_id
        });
        if duplicate {
            return Err(StoreError::Integrity(format!(
                "duplicate row for user {} and message {}",
                row.user_profile_id, row.message_id
            )));
        }

        inner.rows.push(row);
        Ok(())
    }

    async fn due_recipients(&self, now: DateTime<Utc>) -> Result<Vec<u64>, StoreError> {
        let due: BTreeSet<u64> = self
            .inner
            .lock()
            .rows
            .iter()
            .filter(|row| row.scheduled_timestamp <= now)
            .map(|row| row.user_profile_id)
            .collect();
        Ok(due.into_iter().collect())
    }

    async fn take_due(
        &self,
        user_profile_id: u64,
        up_to: DateTime<Utc>,
    ) -> Result<Vec<ScheduledNotification>, StoreError> {
        let mut inner = self.inner.lock();
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.rows)
            .into_iter()
            .partition(|row| row.user_profile_id == user_profile_id && row.scheduled_timestamp <= up_to);
        inner.rows = kept;
        Ok(taken)
    }

    async fn has_pending(&self) -> Result<bool, StoreError> {
        Ok(!self.inner.lock().rows.is_empty())
    }
}
