//! # Queue Processors
//! Background queue workers with per-item or per-batch dead-lettering, handler-driven
//! retries, execution timeouts and time-windowed batching of missed-message emails.

pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod executor;
pub mod handler;
pub mod item;
pub mod missed_message;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod transport;
pub mod worker;
pub mod workers;

// Re-export key components for easy access
pub use config::{QueueSettings, MAX_REQUEST_RETRIES};
pub use dispatcher::Dispatcher;
pub use dlq::{DeadLetterLog, DeadLetterRecord};
pub use error::{StoreError, WorkerError};
pub use handler::{BatchProcessor, QueueProcessor, TimeoutAction};
pub use item::QueueItem;
pub use registry::{WorkerDescriptor, WorkerRegistry};
pub use retry::{retry_event, RetryOutcome, RetryPolicy};
pub use transport::{AmqpQueue, InMemoryQueue, QueueClient};
pub use worker::{LoopQueueWorker, QueueWorker, RunStats, Worker, WorkerContext};
pub use workers::{default_registry, Backends, WorkerKind};
