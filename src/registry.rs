//! Explicit queue-name → worker table, built once at start-up.

use crate::error::WorkerError;
use crate::worker::Worker;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds a fresh, not yet set-up worker for one queue.
pub type WorkerFactory = Arc<dyn Fn() -> Result<Box<dyn Worker>, WorkerError> + Send + Sync>;

/// Static description of a registered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    pub queue_name: String,
    pub worker_class: String,
    /// Test-only queues are excluded from production dispatch.
    pub is_test_queue: bool,
}

impl WorkerDescriptor {
    pub fn new(queue_name: impl Into<String>, worker_class: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            worker_class: worker_class.into(),
            is_test_queue: false,
        }
    }

    pub fn test_queue(mut self) -> Self {
        self.is_test_queue = true;
        self
    }
}

struct Registration {
    descriptor: WorkerDescriptor,
    factory: WorkerFactory,
}

#[derive(Default)]
pub struct WorkerRegistryBuilder {
    entries: BTreeMap<String, Registration>,
}

impl WorkerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under the descriptor's queue name. Each name may be
    /// registered once.
    pub fn register<F>(mut self, descriptor: WorkerDescriptor, factory: F) -> Result<Self, WorkerError>
    where
        F: Fn() -> Result<Box<dyn Worker>, WorkerError> + Send + Sync + 'static,
    {
        if descriptor.queue_name.trim().is_empty() {
            return Err(WorkerError::WorkerDeclaration(descriptor.worker_class));
        }
        if self.entries.contains_key(&descriptor.queue_name) {
            return Err(WorkerError::DuplicateQueue(descriptor.queue_name));
        }

        log::debug!(
            "Registered {} for queue {}",
            descriptor.worker_class,
            descriptor.queue_name
        );
        self.entries.insert(
            descriptor.queue_name.clone(),
            Registration {
                descriptor,
                factory: Arc::new(factory),
            },
        );
        Ok(self)
    }

    pub fn build(self) -> WorkerRegistry {
        WorkerRegistry {
            entries: Arc::new(self.entries),
        }
    }

    /// Builds the registry, failing if any of `expected` was never registered.
    pub fn build_checked<'a, I>(self, expected: I) -> Result<WorkerRegistry, WorkerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for queue_name in expected {
            if !self.entries.contains_key(queue_name) {
                return Err(WorkerError::MissingWorker(queue_name.to_string()));
            }
        }
        Ok(self.build())
    }
}

/// Immutable lookup table shared with the dispatcher.
#[derive(Clone)]
pub struct WorkerRegistry {
    entries: Arc<BTreeMap<String, Registration>>,
}

impl WorkerRegistry {
    pub fn builder() -> WorkerRegistryBuilder {
        WorkerRegistryBuilder::new()
    }

    /// Sorted names of the queues whose `is_test_queue` flag equals `only_test`.
    pub fn active_queues(&self, only_test: bool) -> Vec<String> {
        self.entries
            .values()
            .filter(|entry| entry.descriptor.is_test_queue == only_test)
            .map(|entry| entry.descriptor.queue_name.clone())
            .collect()
    }

    pub fn descriptor(&self, queue_name: &str) -> Option<&WorkerDescriptor> {
        self.entries.get(queue_name).map(|entry| &entry.descriptor)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.entries.values().map(|entry| &entry.descriptor)
    }

    /// Instantiates the worker owning `queue_name`.
    pub fn create(&self, queue_name: &str) -> Result<Box<dyn Worker>, WorkerError> {
        let entry = self
            .entries
            .get(queue_name)
            .ok_or_else(|| WorkerError::MissingWorker(queue_name.to_string()))?;
        (entry.factory)()
    }
}
