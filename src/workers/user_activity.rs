//! `user_activity`: batched per-(user, client, query) activity counters.

use crate::error::WorkerError;
use crate::handler::BatchProcessor;
use crate::item::QueueItem;
use crate::worker::{LoopQueueWorker, WorkerContext};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const QUEUE_NAME: &str = "user_activity";

pub const BATCH_SIZE: usize = 100;

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Looks up a client id by name, for events in the old format.
    async fn client_id(&self, name: &str) -> Result<u64, WorkerError>;

    /// Adds `count` to the counter and moves `last_visit` forward.
    async fn update_user_activity(
        &self,
        user_profile_id: u64,
        client_id: u64,
        query: &str,
        count: u64,
        last_visit: DateTime<Utc>,
    ) -> Result<(), WorkerError>;
}

#[derive(Debug, Deserialize)]
struct ActivityEvent {
    user_profile_id: u64,
    #[serde(default)]
    client_id: Option<u64>,
    /// Older publishers sent the client name instead of its id.
    #[serde(default)]
    client: Option<String>,
    time: f64,
    query: String,
}

#[derive(Debug, Clone, Copy)]
struct Tally {
    count: u64,
    last_visit: DateTime<Utc>,
}

pub struct UserActivityProcessor {
    store: Arc<dyn ActivityStore>,
}

impl UserActivityProcessor {
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self { store }
    }

    async fn resolve_client(&self, event: &ActivityEvent) -> Result<u64, WorkerError> {
        match (event.client_id, &event.client) {
            (Some(id), _) => Ok(id),
            (None, Some(name)) => self.store.client_id(name).await,
            (None, None) => Err(WorkerError::handler(
                "InvalidActivityEvent",
                format!("event for user {} names no client", event.user_profile_id),
            )),
        }
    }
}

fn visit_time(seconds: f64) -> Result<DateTime<Utc>, WorkerError> {
    Utc.timestamp_millis_opt((seconds * 1000.0) as i64)
        .single()
        .ok_or_else(|| WorkerError::handler("InvalidActivityEvent", format!("bad timestamp {}", seconds)))
}

#[async_trait]
impl BatchProcessor for UserActivityProcessor {
    async fn consume_batch(&self, items: Vec<QueueItem>, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        let mut tallies: BTreeMap<(u64, u64, String), Tally> = BTreeMap::new();

        for item in &items {
            let event: ActivityEvent = item.decode()?;
            let client_id = self.resolve_client(&event).await?;
            let time = visit_time(event.time)?;

            tallies
                .entry((event.user_profile_id, client_id, event.query))
                .and_modify(|tally| {
                    tally.count += 1;
                    tally.last_visit = tally.last_visit.max(time);
                })
                .or_insert(Tally { count: 1, last_visit: time });
        }

        for ((user_profile_id, client_id, query), tally) in tallies {
            self.store
                .update_user_activity(user_profile_id, client_id, &query, tally.count, tally.last_visit)
                .await?;
        }
        Ok(())
    }
}

pub type UserActivityWorker = LoopQueueWorker<UserActivityProcessor>;

pub fn worker(store: Arc<dyn ActivityStore>) -> Result<UserActivityWorker, WorkerError> {
    Ok(LoopQueueWorker::new(QUEUE_NAME, UserActivityProcessor::new(store))?.batch_size(BATCH_SIZE))
}
