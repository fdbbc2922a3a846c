//! Queue transport abstraction and its implementations.

pub mod amqp;
pub mod memory;

use crate::error::WorkerError;
use crate::item::QueueItem;
use async_trait::async_trait;
use std::time::Duration;

pub use amqp::AmqpQueue;
pub use memory::InMemoryQueue;

/// What the transport should do with a batch once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The batch was handled (successfully or by dead-lettering) and can be acknowledged.
    Ack,
    /// The work was interrupted; leave it unacknowledged so the broker can redeliver it.
    Redeliver,
}

/// Receives batches accumulated by `QueueClient::consume`.
#[async_trait]
pub trait BatchHandler: Send {
    async fn handle_batch(&mut self, batch: Vec<QueueItem>) -> Disposition;

    /// Receives a delivery that could not be decoded into an item, wrapped by
    /// `QueueItem::from_raw`. Called before the transport rejects it.
    async fn handle_unparsable(&mut self, item: QueueItem);
}

/// An at-least-once message queue client.
///
/// Implementations must deliver items of one queue in publish order.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Publishes a JSON object to the named queue.
    async fn enqueue(&self, queue_name: &str, item: QueueItem) -> Result<(), WorkerError>;

    /// Consumes the named queue, invoking `handler` once per accumulated batch of at
    /// most `batch_size` items. `timeout` bounds how long a partial batch may wait for
    /// more items before being handed over.
    ///
    /// Bounded transports return once the queue is drained; broker transports run
    /// until the connection ends.
    async fn consume(
        &self,
        queue_name: &str,
        batch_size: usize,
        timeout: Option<Duration>,
        handler: &mut (dyn BatchHandler + Send),
    ) -> Result<(), WorkerError>;
}
