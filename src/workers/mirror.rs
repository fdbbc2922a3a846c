//! `email_mirror`: turns inbound emails into messages, rate limited per realm.

use crate::error::WorkerError;
use crate::handler::QueueProcessor;
use crate::item::QueueItem;
use crate::rate_limit::{RateLimitDecision, SlidingWindowLimiter};
use crate::worker::{QueueWorker, WorkerContext};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const QUEUE_NAME: &str = "email_mirror";

const MISSED_MESSAGE_TOKEN_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Realm {
    pub string_id: String,
    pub name: String,
}

#[async_trait]
pub trait MirrorBackend: Send + Sync {
    /// Resolves the realm owning a stream email address.
    async fn realm_for_address(&self, rcpt_to: &str) -> Result<Realm, WorkerError>;

    async fn mirror_email(&self, message: &[u8], rcpt_to: &str) -> Result<(), WorkerError>;
}

#[derive(Debug, Deserialize)]
struct MirrorEvent {
    msg_base64: String,
    rcpt_to: String,
}

/// Reply addresses of missed-message emails look like `mm<32 chars>@<gateway>`.
pub fn is_missed_message_address(address: &str) -> bool {
    let local = address.split('@').next().unwrap_or_default();
    local.len() == 2 + MISSED_MESSAGE_TOKEN_LEN
        && local.starts_with("mm")
        && local[2..].chars().all(|c| c.is_ascii_alphanumeric())
}

/// The value of the first `From:` header, if the message has one.
fn from_header(message: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(message);
    text.lines()
        .take_while(|line| !line.is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("from").then(|| value.trim().to_string())
        })
}

fn rate_limit_key(realm: &Realm) -> String {
    format!("RateLimitedRealmMirror:{}", realm.string_id)
}

pub struct MirrorProcessor {
    backend: Arc<dyn MirrorBackend>,
    limiter: Arc<SlidingWindowLimiter>,
    rejected: AtomicUsize,
}

impl MirrorProcessor {
    pub fn new(backend: Arc<dyn MirrorBackend>, limiter: Arc<SlidingWindowLimiter>) -> Self {
        Self {
            backend,
            limiter,
            rejected: AtomicUsize::new(0),
        }
    }

    /// Emails dropped by the realm rate limit.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    fn admit(&self, realm: &Realm) -> bool {
        match self.limiter.check_and_record(&rate_limit_key(realm)) {
            Ok(RateLimitDecision::Allowed) => true,
            Ok(RateLimitDecision::Limited { .. }) => false,
            Err(e) => {
                log::warn!("{}", e);
                false
            }
        }
    }
}

#[async_trait]
impl QueueProcessor for MirrorProcessor {
    async fn consume(&self, item: QueueItem, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        let event: MirrorEvent = item.decode()?;
        let message = base64::engine::general_purpose::STANDARD
            .decode(event.msg_base64.as_bytes())
            .map_err(|e| WorkerError::handler("InvalidBase64", e.to_string()))?;

        if !is_missed_message_address(&event.rcpt_to) {
            let realm = self.backend.realm_for_address(&event.rcpt_to).await?;
            if !self.admit(&realm) {
                let from = from_header(&message);
                log::warn!(
                    "MirrorWorker: Rejecting an email from: {} to realm: {} - rate limited.",
                    from.as_deref().unwrap_or("None"),
                    realm.name
                );
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        self.backend.mirror_email(&message, &event.rcpt_to).await
    }
}

pub type MirrorWorker = QueueWorker<MirrorProcessor>;

pub fn worker(
    backend: Arc<dyn MirrorBackend>,
    limiter: Arc<SlidingWindowLimiter>,
) -> Result<MirrorWorker, WorkerError> {
    QueueWorker::new(QUEUE_NAME, MirrorProcessor::new(backend, limiter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueSettings;
    use crate::transport::{InMemoryQueue, QueueClient};
    use crate::worker::Worker;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    const STREAM_ADDRESS: &str = "Denmark.abcdefgh@zulip.example.com";

    #[derive(Default)]
    struct RecordingBackend {
        mirrored: Mutex<Vec<(Vec<u8>, String)>>,
    }

    #[async_trait]
    impl MirrorBackend for RecordingBackend {
        async fn realm_for_address(&self, _rcpt_to: &str) -> Result<Realm, WorkerError> {
            Ok(Realm { string_id: "zulip".into(), name: "Zulip Dev".into() })
        }

        async fn mirror_email(&self, message: &[u8], rcpt_to: &str) -> Result<(), WorkerError> {
            self.mirrored.lock().push((message.to_vec(), rcpt_to.to_string()));
            Ok(())
        }
    }

    fn event(rcpt_to: &str) -> QueueItem {
        QueueItem::try_from(json!({
            "msg_base64": base64::engine::general_purpose::STANDARD.encode(b"\xf3test"),
            "time": 1_600_000_000.0,
            "rcpt_to": rcpt_to,
        }))
        .unwrap()
    }

    struct Harness {
        queue: Arc<InMemoryQueue>,
        backend: Arc<RecordingBackend>,
        clock: Arc<ManualClock>,
        limiter: Arc<SlidingWindowLimiter>,
        worker: MirrorWorker,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(rules: Vec<(Duration, usize)>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let queue = Arc::new(InMemoryQueue::new());
            let backend = Arc::new(RecordingBackend::default());
            let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()));
            let limiter = Arc::new(SlidingWindowLimiter::new(rules, clock.clone()));

            let mut worker = worker(backend.clone(), limiter.clone()).unwrap();
            worker.setup(
                queue.clone(),
                Arc::new(QueueSettings::builder().queue_error_dir(dir.path()).build()),
            );
            Self { queue, backend, clock, limiter, worker, _dir: dir }
        }

        async fn send(&self, rcpt_to: &str, times: usize) {
            for _ in 0..times {
                self.queue.enqueue(QUEUE_NAME, event(rcpt_to)).await.unwrap();
            }
            self.worker.start().await.unwrap();
        }

        fn mirrored(&self) -> usize {
            self.backend.mirrored.lock().len()
        }
    }

    #[tokio::test]
    async fn test_emails_are_decoded_and_mirrored() {
        let h = Harness::new(vec![(Duration::from_secs(60), 50)]);
        h.send(STREAM_ADDRESS, 3).await;

        let mirrored = h.backend.mirrored.lock().clone();
        assert_eq!(mirrored.len(), 3);
        assert_eq!(mirrored[0], (b"\xf3test".to_vec(), STREAM_ADDRESS.to_string()));
    }

    #[tokio::test]
    async fn test_realm_rate_limit() {
        let h = Harness::new(vec![(Duration::from_secs(10), 2)]);

        h.send(STREAM_ADDRESS, 5).await;
        assert_eq!(h.mirrored(), 2);

        h.send(STREAM_ADDRESS, 1).await;
        assert_eq!(h.mirrored(), 2);

        // Missed-message replies bypass the realm limit.
        let reply_address = format!("mm{}@example.com", "x".repeat(32));
        h.send(&reply_address, 1).await;
        assert_eq!(h.mirrored(), 3);

        h.clock.advance(Duration::from_secs(11));
        h.send(STREAM_ADDRESS, 1).await;
        assert_eq!(h.mirrored(), 4);
        assert_eq!(h.worker.processor().rejected(), 4);
    }

    #[tokio::test]
    async fn test_limiter_lock_contention_rejects_the_email() {
        let h = Harness::new(vec![(Duration::from_secs(10), 2)]);
        let limiter = h.limiter.clone();

        // Hold the limiter's history lock from another thread while the worker runs.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = std::thread::spawn(move || {
            limiter.hold_lock_until(|| {
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
        });
        locked_rx.recv().unwrap();

        h.send(STREAM_ADDRESS, 1).await;
        release_tx.send(()).unwrap();
        holder.join().unwrap();

        assert_eq!(h.mirrored(), 0);
        assert_eq!(h.worker.processor().rejected(), 1);
    }

    #[test]
    fn test_missed_message_address_detection() {
        assert!(is_missed_message_address(&format!("mm{}@example.com", "a1".repeat(16))));
        assert!(!is_missed_message_address("mm1234@example.com"));
        assert!(!is_missed_message_address(STREAM_ADDRESS));
    }

    #[test]
    fn test_from_header_parsing() {
        assert_eq!(
            from_header(b"Subject: hi\r\nFrom: Hamlet <hamlet@zulip.com>\r\n\r\nFrom: body"),
            Some("Hamlet <hamlet@zulip.com>".to_string())
        );
        assert_eq!(from_header(b"\xf3test"), None);
    }
}
