//! Defines the core traits for queue handling logic.

use crate::error::WorkerError;
use crate::item::QueueItem;
use crate::worker::WorkerContext;
use async_trait::async_trait;
use std::time::Duration;

/// What to do with items whose processing exceeded the consume limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Persist the items to the queue's dead-letter file.
    DeadLetter,
    /// Drop the items after logging; they are acknowledged as handled.
    Skip,
}

/// A trait for processing items of a queue one at a time.
///
/// Implement this trait for your specific business logic and wrap it in a
/// `QueueWorker`.
#[async_trait]
pub trait QueueProcessor: Send + Sync + 'static {
    /// Processes a single item.
    ///
    /// # Returns
    /// `Ok(())` if the item was handled, or a `WorkerError` to have it dead-lettered.
    async fn consume(&self, item: QueueItem, ctx: &WorkerContext) -> Result<(), WorkerError>;

    /// Called after `consume` ran past `limit` and was aborted.
    fn on_timeout(&self, queue_name: &str, limit: Duration, items: &[QueueItem]) -> TimeoutAction {
        report_timeout(queue_name, limit, items)
    }
}

/// A trait for processing whole batches of a queue at once.
#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    /// Processes every item of the batch. An error dead-letters the entire batch.
    async fn consume_batch(
        &self,
        items: Vec<QueueItem>,
        ctx: &WorkerContext,
    ) -> Result<(), WorkerError>;

    fn on_timeout(&self, queue_name: &str, limit: Duration, items: &[QueueItem]) -> TimeoutAction {
        report_timeout(queue_name, limit, items)
    }
}

/// The default timeout report: an error line, then dead-lettering.
pub fn report_timeout(queue_name: &str, limit: Duration, items: &[QueueItem]) -> TimeoutAction {
    log::error!(
        "Timed out after {} seconds processing {} events in queue {}",
        format_seconds(limit),
        items.len(),
        queue_name
    );
    for item in items {
        log::error!("Timed-out event in queue {}: {:?}", queue_name, item.as_map());
    }
    TimeoutAction::DeadLetter
}

/// Renders whole seconds without a fraction, e.g. `1` rather than `1.0`.
pub fn format_seconds(limit: Duration) -> String {
    if limit.subsec_nanos() == 0 {
        limit.as_secs().to_string()
    } else {
        format!("{}", limit.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_seconds() {
        assert_eq!(format_seconds(Duration::from_secs(1)), "1");
        assert_eq!(format_seconds(Duration::from_millis(1500)), "1.5");
    }

    #[test]
    fn test_default_timeout_report_dead_letters() {
        assert_eq!(
            report_timeout("timeout_worker", Duration::from_secs(1), &[QueueItem::new()]),
            TimeoutAction::DeadLetter
        );
    }
}
