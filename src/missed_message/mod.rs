//! Missed-message email batching.
//!
//! Events for a recipient are persisted as they arrive and coalesced until the
//! recipient's batching window closes; a check timer then sends one digest per
//! recipient. The timer is one-shot and re-armed only while rows remain pending.

pub mod store;

use crate::clock::Clock;
use crate::config::QueueSettings;
use crate::dlq::DeadLetterLog;
use crate::error::{StoreError, WorkerError};
use crate::handler::QueueProcessor;
use crate::item::QueueItem;
use crate::transport::QueueClient;
use crate::worker::{QueueWorker, RunStats, Worker, WorkerContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub use store::{InMemoryNotificationStore, NotificationStore, NotificationTrigger, ScheduledNotification};

pub const QUEUE_NAME: &str = "missedmessage_emails";

/// Payload published to `missedmessage_emails`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedMessageEvent {
    pub user_profile_id: u64,
    pub message_id: u64,
    pub trigger: NotificationTrigger,
    #[serde(default)]
    pub mentioned_user_group_id: Option<u64>,
}

/// Sends the digest for one recipient.
#[async_trait]
pub trait MissedMessageSender: Send + Sync {
    async fn send_batch(
        &self,
        user_profile_id: u64,
        events: Vec<ScheduledNotification>,
        count: usize,
    ) -> Result<(), WorkerError>;
}

/// Per-recipient batching window lookup.
pub trait BatchingWindows: Send + Sync {
    fn window_for(&self, user_profile_id: u64) -> Duration;
}

impl BatchingWindows for Duration {
    fn window_for(&self, _user_profile_id: u64) -> Duration {
        *self
    }
}

/// A default window with per-recipient overrides.
#[derive(Debug, Clone)]
pub struct PerRecipientWindows {
    pub default: Duration,
    pub overrides: HashMap<u64, Duration>,
}

impl BatchingWindows for PerRecipientWindows {
    fn window_for(&self, user_profile_id: u64) -> Duration {
        self.overrides
            .get(&user_profile_id)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Scheduled(DateTime<Utc>),
    /// The row could not be persisted (deleted message or duplicate).
    Dropped,
}

/// Result of one flush pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    /// `(user_profile_id, count)` for every digest handed to the sender.
    pub sent: Vec<(u64, usize)>,
    /// Recipients whose digest failed to send.
    pub failed: Vec<u64>,
    /// Rows of failed digests written to the `missedmessage_emails` dead-letter file.
    pub dead_lettered: usize,
}

#[derive(Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// The stateful coordinator behind `MissedMessageWorker`.
pub struct MissedMessageScheduler {
    store: Arc<dyn NotificationStore>,
    sender: Arc<dyn MissedMessageSender>,
    clock: Arc<dyn Clock>,
    windows: Arc<dyn BatchingWindows>,
    check_interval: Duration,
    dead_letters: DeadLetterLog,
    timer: Mutex<TimerSlot>,
}

impl MissedMessageScheduler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        sender: Arc<dyn MissedMessageSender>,
        clock: Arc<dyn Clock>,
        windows: Arc<dyn BatchingWindows>,
        check_interval: Duration,
        dead_letters: DeadLetterLog,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sender,
            clock,
            windows,
            check_interval,
            dead_letters,
            timer: Mutex::new(TimerSlot::default()),
        })
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub async fn timer_armed(&self) -> bool {
        self.timer.lock().await.handle.is_some()
    }

    /// Persists the event into the recipient's open batch, or opens a new one.
    pub async fn record(self: &Arc<Self>, event: MissedMessageEvent) -> Result<RecordOutcome, WorkerError> {
        let now = self.clock.now();
        let scheduled_timestamp = match self.store.open_batch_deadline(event.user_profile_id, now).await? {
            Some(deadline) => deadline,
            None => {
                let window = self.windows.window_for(event.user_profile_id);
                now + chrono::Duration::from_std(window)
                    .map_err(|e| WorkerError::from(format!("invalid batching window: {}", e)))?
            }
        };

        let row = ScheduledNotification {
            user_profile_id: event.user_profile_id,
            message_id: event.message_id,
            trigger: event.trigger,
            mentioned_user_group_id: event.mentioned_user_group_id,
            scheduled_timestamp,
        };

        match self.store.insert(row).await {
            Ok(()) => {}
            Err(StoreError::Integrity(reason)) => {
                log::debug!(
                    "ScheduledMessageNotificationEmail row could not be created. The message may have been deleted. Skipping event. ({})",
                    reason
                );
                return Ok(RecordOutcome::Dropped);
            }
            Err(e) => return Err(e.into()),
        }

        self.ensure_timer().await;
        Ok(RecordOutcome::Scheduled(scheduled_timestamp))
    }

    /// Arms the check timer unless one is already pending.
    pub async fn ensure_timer(self: &Arc<Self>) {
        let mut slot = self.timer.lock().await;
        if slot.handle.is_none() {
            self.arm(&mut slot);
        }
    }

    fn arm(self: &Arc<Self>, slot: &mut TimerSlot) {
        slot.generation += 1;
        let generation = slot.generation;
        let interval = self.check_interval;
        let scheduler: Weak<Self> = Arc::downgrade(self);

        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.on_timer(generation).await;
            }
        }));
    }

    async fn on_timer(self: &Arc<Self>, generation: u64) {
        {
            let mut slot = self.timer.lock().await;
            if slot.generation != generation || slot.handle.is_none() {
                return;
            }
            // This task is the armed timer; release the slot without aborting ourselves.
            slot.handle = None;
        }

        if let Err(e) = self.flush(self.clock.now()).await {
            log::error!("Failed to flush missed-message batches: {}", e);
        }
        self.rearm_if_pending().await;
    }

    /// Flushes every batch due now, cancelling the armed timer and re-arming it only
    /// if rows remain.
    pub async fn flush_due(self: &Arc<Self>) -> Result<FlushReport, WorkerError> {
        if let Some(handle) = self.timer.lock().await.handle.take() {
            handle.abort();
        }

        let report = self.flush(self.clock.now()).await;
        self.rearm_if_pending().await;
        report
    }

    async fn flush(&self, now: DateTime<Utc>) -> Result<FlushReport, WorkerError> {
        let mut report = FlushReport::default();

        for user_profile_id in self.store.due_recipients(now).await? {
            let events = self.store.take_due(user_profile_id, now).await?;
            if events.is_empty() {
                continue;
            }

            let count = events.len();
            log::info!(
                "Batch-processing {} missedmessage_emails events for user {}",
                count,
                user_profile_id
            );

            match self.sender.send_batch(user_profile_id, events.clone(), count).await {
                Ok(()) => report.sent.push((user_profile_id, count)),
                Err(e) => {
                    log::error!(
                        "Failed to process {} missedmessage_emails for user {}: {:?}",
                        count,
                        user_profile_id,
                        e
                    );
                    report.failed.push(user_profile_id);
                    report.dead_lettered += self.keep_undelivered(events).await;
                }
            }
        }

        Ok(report)
    }

    /// Dead-letters rows whose digest failed. If that write fails too, the rows go
    /// back into the store for the next flush. Returns the number dead-lettered.
    async fn keep_undelivered(&self, rows: Vec<ScheduledNotification>) -> usize {
        let items: Result<Vec<QueueItem>, _> = rows.iter().map(QueueItem::from_serialize).collect();
        let written = match items {
            Ok(items) => self.dead_letters.append(&items).await,
            Err(e) => Err(e.into()),
        };

        match written {
            Ok(()) => rows.len(),
            Err(e) => {
                log::error!(
                    "Could not dead-letter {} missedmessage_emails rows, keeping them for the next flush: {}",
                    rows.len(),
                    e
                );
                for row in rows {
                    if let Err(e) = self.store.insert(row).await {
                        log::error!("Failed to restore missed-message row: {}", e);
                    }
                }
                0
            }
        }
    }

    async fn rearm_if_pending(self: &Arc<Self>) {
        let mut slot = self.timer.lock().await;
        if slot.handle.is_some() {
            return;
        }

        match self.store.has_pending().await {
            Ok(false) => {}
            Ok(true) => self.arm(&mut slot),
            Err(e) => {
                log::error!("Could not check pending missed-message rows, re-arming: {}", e);
                self.arm(&mut slot);
            }
        }
    }

    /// Cancels the armed timer. Pending rows stay in the store.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.timer.lock().await.handle.take() {
            handle.abort();
        }
    }
}

/// Queue processor feeding events into the scheduler.
pub struct MissedMessageProcessor {
    scheduler: Arc<MissedMessageScheduler>,
}

#[async_trait]
impl QueueProcessor for MissedMessageProcessor {
    async fn consume(&self, item: QueueItem, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        let event: MissedMessageEvent = item.decode()?;
        self.scheduler.record(event).await?;
        Ok(())
    }
}

/// Worker for the `missedmessage_emails` queue.
pub struct MissedMessageWorker {
    inner: QueueWorker<MissedMessageProcessor>,
    scheduler: Arc<MissedMessageScheduler>,
}

impl MissedMessageWorker {
    pub fn new(scheduler: Arc<MissedMessageScheduler>) -> Result<Self, WorkerError> {
        let processor = MissedMessageProcessor {
            scheduler: Arc::clone(&scheduler),
        };
        Ok(Self {
            inner: QueueWorker::new(QUEUE_NAME, processor)?,
            scheduler,
        })
    }

    /// Builds the scheduler from settings: fixed window and check interval.
    pub fn from_settings(
        settings: &QueueSettings,
        store: Arc<dyn NotificationStore>,
        sender: Arc<dyn MissedMessageSender>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WorkerError> {
        Self::with_windows(settings, store, sender, clock, Arc::new(settings.email_batching_period))
    }

    /// Like `from_settings`, with batching windows looked up per recipient.
    pub fn with_windows(
        settings: &QueueSettings,
        store: Arc<dyn NotificationStore>,
        sender: Arc<dyn MissedMessageSender>,
        clock: Arc<dyn Clock>,
        windows: Arc<dyn BatchingWindows>,
    ) -> Result<Self, WorkerError> {
        let scheduler = MissedMessageScheduler::new(
            store,
            sender,
            clock,
            windows,
            settings.missed_message_check_interval,
            DeadLetterLog::new(&settings.queue_error_dir, QUEUE_NAME),
        );
        Self::new(scheduler)
    }

    pub fn scheduler(&self) -> &Arc<MissedMessageScheduler> {
        &self.scheduler
    }

    pub async fn flush_due(&self) -> Result<FlushReport, WorkerError> {
        self.scheduler.flush_due().await
    }
}

#[async_trait]
impl Worker for MissedMessageWorker {
    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    fn setup(&mut self, client: Arc<dyn QueueClient>, settings: Arc<QueueSettings>) {
        self.inner.setup(client, settings);
    }

    async fn start(&self) -> Result<RunStats, WorkerError> {
        self.inner.start().await
    }
}
