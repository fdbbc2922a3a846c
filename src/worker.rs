//! Queue worker loops: one item at a time (`QueueWorker`) or in batches (`LoopQueueWorker`).

use crate::config::QueueSettings;
use crate::dlq::DeadLetterLog;
use crate::error::WorkerError;
use crate::executor::{run_guarded, ConsumeOutcome};
use crate::handler::{BatchProcessor, QueueProcessor, TimeoutAction};
use crate::item::QueueItem;
use crate::retry::{retry_event, RetryOutcome, RetryPolicy};
use crate::transport::{BatchHandler, Disposition, QueueClient};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Everything a handler may need while processing: its queue, the transport and settings.
#[derive(Clone)]
pub struct WorkerContext {
    queue_name: Arc<str>,
    client: Arc<dyn QueueClient>,
    settings: Arc<QueueSettings>,
}

impl WorkerContext {
    pub fn new(queue_name: &str, client: Arc<dyn QueueClient>, settings: Arc<QueueSettings>) -> Self {
        Self {
            queue_name: Arc::from(queue_name),
            client,
            settings,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.settings.max_request_retries)
    }

    pub fn dead_letter_log(&self) -> DeadLetterLog {
        DeadLetterLog::new(&self.settings.queue_error_dir, &self.queue_name)
    }

    /// Re-publishes `item` to this worker's own queue, see `retry::retry_event`.
    pub async fn retry_event<F>(&self, item: QueueItem, on_failure: F) -> Result<RetryOutcome, WorkerError>
    where
        F: FnOnce(&QueueItem),
    {
        retry_event(
            self.client.as_ref(),
            &self.queue_name,
            item,
            self.retry_policy(),
            on_failure,
        )
        .await
    }
}

/// Counters describing one `start()` run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    /// Items handled without error.
    pub processed: usize,
    /// Items whose handler (or batch) returned an error.
    pub failed: usize,
    /// Items whose handler (or batch) was aborted at the deadline.
    pub timed_out: usize,
    /// Items written to the dead-letter file.
    pub dead_lettered: usize,
}

/// A consumer loop bound to exactly one queue.
#[async_trait]
pub trait Worker: Send + Sync {
    fn queue_name(&self) -> &str;

    /// Binds the worker to its transport connection.
    fn setup(&mut self, client: Arc<dyn QueueClient>, settings: Arc<QueueSettings>);

    /// Consumes until the transport stops delivering.
    async fn start(&self) -> Result<RunStats, WorkerError>;
}

fn declared_name(queue_name: String, worker_class: &str) -> Result<String, WorkerError> {
    if queue_name.trim().is_empty() {
        return Err(WorkerError::WorkerDeclaration(worker_class.to_string()));
    }
    Ok(queue_name)
}

fn failure_message(queue_name: &str, error: &WorkerError, items: &[QueueItem]) -> String {
    let data: Vec<_> = items.iter().map(QueueItem::as_map).collect();
    format!("Problem handling data on queue {}: {:?} data: {:?}", queue_name, error, data)
}

/// Shared loop bookkeeping for both worker flavours.
struct LoopState {
    ctx: WorkerContext,
    dead_letters: DeadLetterLog,
    limit: Option<Duration>,
    stats: RunStats,
}

impl LoopState {
    fn new(ctx: WorkerContext, limit: Option<Duration>) -> Self {
        Self {
            dead_letters: ctx.dead_letter_log(),
            ctx,
            limit,
            stats: RunStats::default(),
        }
    }

    async fn dead_letter(&mut self, items: &[QueueItem]) {
        match self.dead_letters.append(items).await {
            Ok(()) => self.stats.dead_lettered += items.len(),
            Err(e) => log::error!(
                "Failed to write {} item(s) to {}: {}",
                items.len(),
                self.dead_letters.path().display(),
                e
            ),
        }
    }

    async fn record_failure(&mut self, error: WorkerError, items: &[QueueItem]) {
        log::error!("{}", failure_message(self.ctx.queue_name(), &error, items));
        self.stats.failed += items.len();
        self.dead_letter(items).await;
    }

    async fn record_unparsable(&mut self, item: QueueItem) {
        log::error!("Undecodable delivery on queue {}: {:?}", self.ctx.queue_name(), item.as_map());
        self.stats.failed += 1;
        self.dead_letter(std::slice::from_ref(&item)).await;
    }

    async fn record_timeout(&mut self, action: TimeoutAction, items: &[QueueItem]) -> Disposition {
        self.stats.timed_out += items.len();
        match action {
            TimeoutAction::DeadLetter => {
                self.dead_letter(items).await;
                Disposition::Redeliver
            }
            TimeoutAction::Skip => Disposition::Ack,
        }
    }
}

/// Worker that hands each delivered item to a `QueueProcessor` on its own.
///
/// A failing item is dead-lettered alone and never affects its neighbours. A timed-out
/// item is dead-lettered and left unacknowledged, like a timed-out `LoopQueueWorker` batch.
pub struct QueueWorker<P: QueueProcessor> {
    queue_name: String,
    processor: Arc<P>,
    max_consume: Option<Duration>,
    enable_timeouts: Option<bool>,
    context: Option<WorkerContext>,
}

impl<P: QueueProcessor> QueueWorker<P> {
    /// Declares a worker for `queue_name`. An empty name is a declaration error.
    pub fn new(queue_name: impl Into<String>, processor: P) -> Result<Self, WorkerError> {
        Ok(Self {
            queue_name: declared_name(queue_name.into(), std::any::type_name::<P>())?,
            processor: Arc::new(processor),
            max_consume: None,
            enable_timeouts: None,
            context: None,
        })
    }

    /// Sets the per-item limit; only enforced while timeouts are enabled.
    pub fn max_consume(mut self, limit: Duration) -> Self {
        self.max_consume = Some(limit);
        self
    }

    /// Overrides `QueueSettings::enable_timeouts` for this worker.
    pub fn enable_timeouts(mut self, enabled: bool) -> Self {
        self.enable_timeouts = Some(enabled);
        self
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }

    pub fn context(&self) -> Option<&WorkerContext> {
        self.context.as_ref()
    }
}

fn effective_limit(
    max_consume: Option<Duration>,
    enable_timeouts: Option<bool>,
    settings: &QueueSettings,
) -> Option<Duration> {
    if enable_timeouts.unwrap_or(settings.enable_timeouts) {
        max_consume.filter(|limit| !limit.is_zero())
    } else {
        None
    }
}

struct SingleItemLoop<P: QueueProcessor> {
    processor: Arc<P>,
    state: LoopState,
}

#[async_trait]
impl<P: QueueProcessor> BatchHandler for SingleItemLoop<P> {
    async fn handle_batch(&mut self, batch: Vec<QueueItem>) -> Disposition {
        let mut disposition = Disposition::Ack;

        for item in batch {
            let processor = Arc::clone(&self.processor);
            let ctx = self.state.ctx.clone();
            let work_item = item.clone();
            let outcome = run_guarded(self.state.limit, async move {
                processor.consume(work_item, &ctx).await
            })
            .await;

            match outcome {
                ConsumeOutcome::Processed => self.state.stats.processed += 1,
                ConsumeOutcome::Failed(e) => {
                    self.state.record_failure(e, std::slice::from_ref(&item)).await
                }
                ConsumeOutcome::TimedOut(limit) => {
                    let items = std::slice::from_ref(&item);
                    let action = self.processor.on_timeout(self.state.ctx.queue_name(), limit, items);
                    if self.state.record_timeout(action, items).await == Disposition::Redeliver {
                        disposition = Disposition::Redeliver;
                    }
                }
            }
        }

        disposition
    }

    async fn handle_unparsable(&mut self, item: QueueItem) {
        self.state.record_unparsable(item).await;
    }
}

#[async_trait]
impl<P: QueueProcessor> Worker for QueueWorker<P> {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn setup(&mut self, client: Arc<dyn QueueClient>, settings: Arc<QueueSettings>) {
        self.context = Some(WorkerContext::new(&self.queue_name, client, settings));
    }

    async fn start(&self) -> Result<RunStats, WorkerError> {
        let ctx = self
            .context
            .clone()
            .ok_or_else(|| WorkerError::NotSetUp(self.queue_name.clone()))?;
        let limit = effective_limit(self.max_consume, self.enable_timeouts, ctx.settings());

        let client = Arc::clone(ctx.client());
        let mut sink = SingleItemLoop {
            processor: Arc::clone(&self.processor),
            state: LoopState::new(ctx, limit),
        };

        client.consume(&self.queue_name, 1, None, &mut sink).await?;

        log::debug!("Queue {} run finished: {:?}", self.queue_name, sink.state.stats);
        Ok(sink.state.stats)
    }
}

/// Worker that accumulates up to `batch_size` items and hands them to a
/// `BatchProcessor` together.
///
/// Any failure dead-letters the whole batch in its original order.
///
/// A batch that times out is dead-lettered *and* left unacknowledged, so a broker
/// transport delivers it one more time. If that redelivery succeeds, the dead-letter
/// file still holds a record for items that were eventually processed; replay tools
/// must tolerate such duplicates.
pub struct LoopQueueWorker<P: BatchProcessor> {
    queue_name: String,
    processor: Arc<P>,
    batch_size: Option<usize>,
    max_consume: Option<Duration>,
    enable_timeouts: Option<bool>,
    context: Option<WorkerContext>,
}

impl<P: BatchProcessor> LoopQueueWorker<P> {
    pub fn new(queue_name: impl Into<String>, processor: P) -> Result<Self, WorkerError> {
        Ok(Self {
            queue_name: declared_name(queue_name.into(), std::any::type_name::<P>())?,
            processor: Arc::new(processor),
            batch_size: None,
            max_consume: None,
            enable_timeouts: None,
            context: None,
        })
    }

    /// Defaults to `QueueSettings::loop_batch_size`.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    /// Sets the per-batch limit; only enforced while timeouts are enabled.
    pub fn max_consume(mut self, limit: Duration) -> Self {
        self.max_consume = Some(limit);
        self
    }

    pub fn enable_timeouts(mut self, enabled: bool) -> Self {
        self.enable_timeouts = Some(enabled);
        self
    }

    pub fn processor(&self) -> &Arc<P> {
        &self.processor
    }
}

struct BatchLoop<P: BatchProcessor> {
    processor: Arc<P>,
    state: LoopState,
}

#[async_trait]
impl<P: BatchProcessor> BatchHandler for BatchLoop<P> {
    async fn handle_batch(&mut self, batch: Vec<QueueItem>) -> Disposition {
        let processor = Arc::clone(&self.processor);
        let ctx = self.state.ctx.clone();
        let work = batch.clone();
        let outcome = run_guarded(self.state.limit, async move {
            processor.consume_batch(work, &ctx).await
        })
        .await;

        match outcome {
            ConsumeOutcome::Processed => {
                self.state.stats.processed += batch.len();
                Disposition::Ack
            }
            ConsumeOutcome::Failed(e) => {
                self.state.record_failure(e, &batch).await;
                Disposition::Ack
            }
            ConsumeOutcome::TimedOut(limit) => {
                let action = self.processor.on_timeout(self.state.ctx.queue_name(), limit, &batch);
                self.state.record_timeout(action, &batch).await
            }
        }
    }

    async fn handle_unparsable(&mut self, item: QueueItem) {
        self.state.record_unparsable(item).await;
    }
}

#[async_trait]
impl<P: BatchProcessor> Worker for LoopQueueWorker<P> {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn setup(&mut self, client: Arc<dyn QueueClient>, settings: Arc<QueueSettings>) {
        self.context = Some(WorkerContext::new(&self.queue_name, client, settings));
    }

    async fn start(&self) -> Result<RunStats, WorkerError> {
        let ctx = self
            .context
            .clone()
            .ok_or_else(|| WorkerError::NotSetUp(self.queue_name.clone()))?;
        let limit = effective_limit(self.max_consume, self.enable_timeouts, ctx.settings());
        let batch_size = self.batch_size.unwrap_or(ctx.settings().loop_batch_size);
        let batch_timeout = ctx.settings().loop_batch_timeout;

        let client = Arc::clone(ctx.client());
        let mut sink = BatchLoop {
            processor: Arc::clone(&self.processor),
            state: LoopState::new(ctx, limit),
        };

        client
            .consume(&self.queue_name, batch_size, Some(batch_timeout), &mut sink)
            .await?;

        log::debug!("Queue {} run finished: {:?}", self.queue_name, sink.state.stats);
        Ok(sink.state.stats)
    }
}
