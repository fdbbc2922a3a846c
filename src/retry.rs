//! Handler-driven retry: re-publish an item with a bumped `failed_tries` until a cap.

use crate::config::MAX_REQUEST_RETRIES;
use crate::error::WorkerError;
use crate::item::QueueItem;
use crate::transport::QueueClient;
use serde::{Deserialize, Serialize};

/// Bounded retry policy for items whose remote call failed transiently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_request_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_request_retries: u32) -> Self {
        Self { max_request_retries }
    }

    /// Checks if an item that has now failed `failed_tries` times may be re-published.
    pub fn should_retry(&self, failed_tries: u32) -> bool {
        failed_tries <= self.max_request_retries
    }

    /// Returns a string slice describing the attempt for logging purposes.
    pub fn get_retry_type(&self, failed_tries: u32) -> &'static str {
        if failed_tries == 0 {
            "initial"
        } else if self.should_retry(failed_tries) {
            "retry"
        } else {
            "exhausted"
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_REQUEST_RETRIES)
    }
}

/// Represents the outcome of `retry_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// The item was published again with the given `failed_tries`.
    Requeued { failed_tries: u32 },
    /// The cap was reached; `on_failure` ran and nothing was published.
    Exhausted(QueueItem),
}

/// Bumps `failed_tries` and re-publishes `item` to `queue_name`, or hands it to
/// `on_failure` once the policy is exhausted.
///
/// An item thus reaches the handler at most `1 + max_request_retries` times.
pub async fn retry_event<F>(
    client: &dyn QueueClient,
    queue_name: &str,
    mut item: QueueItem,
    policy: RetryPolicy,
    on_failure: F,
) -> Result<RetryOutcome, WorkerError>
where
    F: FnOnce(&QueueItem),
{
    let failed_tries = item.increment_failed_tries();

    if !policy.should_retry(failed_tries) {
        on_failure(&item);
        return Ok(RetryOutcome::Exhausted(item));
    }

    client.enqueue(queue_name, item).await?;
    log::info!(
        "Item republished to {} ({} attempt {}).",
        queue_name,
        policy.get_retry_type(failed_tries),
        failed_tries
    );
    Ok(RetryOutcome::Requeued { failed_tries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryQueue;
    use serde_json::json;

    #[test]
    fn test_retry_policy_bounds() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_request_retries, 3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert_eq!(policy.get_retry_type(0), "initial");
        assert_eq!(policy.get_retry_type(2), "retry");
        assert_eq!(policy.get_retry_type(4), "exhausted");
    }

    #[tokio::test]
    async fn test_retry_event_requeues_until_cap() {
        let queue = InMemoryQueue::new();
        let policy = RetryPolicy::new(2);
        let mut item = QueueItem::try_from(json!({"to": "hamlet"})).unwrap();
        let mut gave_up = 0;

        for expected in 1..=2 {
            let outcome = retry_event(&queue, "email_senders", item.clone(), policy, |_| gave_up += 1)
                .await
                .unwrap();
            assert_eq!(outcome, RetryOutcome::Requeued { failed_tries: expected });
            item.increment_failed_tries();
        }
        assert_eq!(queue.queue_len("email_senders"), 2);

        let outcome = retry_event(&queue, "email_senders", item, policy, |_| gave_up += 1)
            .await
            .unwrap();
        match outcome {
            RetryOutcome::Exhausted(item) => assert_eq!(item.failed_tries(), 3),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(gave_up, 1);
        assert_eq!(queue.queue_len("email_senders"), 2);
    }
}
