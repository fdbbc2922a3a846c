//! Starts one consumer task per active queue.

use crate::config::QueueSettings;
use crate::error::WorkerError;
use crate::registry::WorkerRegistry;
use crate::transport::QueueClient;
use crate::worker::RunStats;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A running worker task.
pub struct RunningWorker {
    pub queue_name: String,
    pub handle: JoinHandle<Result<RunStats, WorkerError>>,
}

pub struct Dispatcher {
    registry: WorkerRegistry,
    settings: Arc<QueueSettings>,
}

impl Dispatcher {
    pub fn new(registry: WorkerRegistry, settings: Arc<QueueSettings>) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Creates, sets up and spawns the worker for `queue_name`. `connect` supplies
    /// the worker's own transport handle.
    pub async fn spawn<C, Fut>(&self, queue_name: &str, connect: C) -> Result<RunningWorker, WorkerError>
    where
        C: FnOnce(&str) -> Fut,
        Fut: Future<Output = Result<Arc<dyn QueueClient>, WorkerError>>,
    {
        let mut worker = self.registry.create(queue_name)?;
        let client = connect(queue_name).await?;
        worker.setup(client, Arc::clone(&self.settings));

        let name = queue_name.to_string();
        let handle = tokio::spawn(async move {
            log::info!("Worker for queue {} started", name);
            let result = worker.start().await;
            match &result {
                Ok(stats) => log::info!("Worker for queue {} stopped: {:?}", name, stats),
                Err(e) => log::error!("Worker for queue {} failed: {}", name, e),
            }
            result
        });

        Ok(RunningWorker {
            queue_name: queue_name.to_string(),
            handle,
        })
    }

    /// Spawns every queue whose test flag equals `only_test`.
    pub async fn spawn_all<C, Fut>(&self, only_test: bool, connect: C) -> Result<Vec<RunningWorker>, WorkerError>
    where
        C: Fn(&str) -> Fut,
        Fut: Future<Output = Result<Arc<dyn QueueClient>, WorkerError>>,
    {
        let mut running = Vec::new();
        for queue_name in self.registry.active_queues(only_test) {
            running.push(self.spawn(&queue_name, &connect).await?);
        }
        Ok(running)
    }
}
