//! The built-in queue workers and the registry that wires them to their backends.

pub mod email;
pub mod embed_links;
pub mod mirror;
pub mod push;
pub mod user_activity;

use crate::clock::Clock;
use crate::config::QueueSettings;
use crate::error::WorkerError;
use crate::missed_message::{self, BatchingWindows, MissedMessageSender, MissedMessageWorker, NotificationStore};
use crate::rate_limit::SlidingWindowLimiter;
use crate::registry::{WorkerDescriptor, WorkerRegistry, WorkerRegistryBuilder};
use crate::worker::Worker;
use std::sync::Arc;

/// Every worker shipped with the crate. Adding a variant without registering it
/// makes `default_registry` fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    EmailSenders,
    PushNotifications,
    EmailMirror,
    MissedMessageEmails,
    EmbedLinks,
    UserActivity,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 6] = [
        WorkerKind::EmailSenders,
        WorkerKind::PushNotifications,
        WorkerKind::EmailMirror,
        WorkerKind::MissedMessageEmails,
        WorkerKind::EmbedLinks,
        WorkerKind::UserActivity,
    ];

    pub fn queue_name(self) -> &'static str {
        match self {
            WorkerKind::EmailSenders => email::QUEUE_NAME,
            WorkerKind::PushNotifications => push::QUEUE_NAME,
            WorkerKind::EmailMirror => mirror::QUEUE_NAME,
            WorkerKind::MissedMessageEmails => missed_message::QUEUE_NAME,
            WorkerKind::EmbedLinks => embed_links::QUEUE_NAME,
            WorkerKind::UserActivity => user_activity::QUEUE_NAME,
        }
    }

    pub fn worker_class(self) -> &'static str {
        match self {
            WorkerKind::EmailSenders => "EmailSendingWorker",
            WorkerKind::PushNotifications => "PushNotificationsWorker",
            WorkerKind::EmailMirror => "MirrorWorker",
            WorkerKind::MissedMessageEmails => "MissedMessageWorker",
            WorkerKind::EmbedLinks => "EmbedLinksWorker",
            WorkerKind::UserActivity => "UserActivityWorker",
        }
    }

    pub fn descriptor(self) -> WorkerDescriptor {
        WorkerDescriptor::new(self.queue_name(), self.worker_class())
    }
}

/// The external collaborators the built-in workers call into.
#[derive(Clone)]
pub struct Backends {
    pub email: Arc<dyn email::EmailBackend>,
    pub push: Arc<dyn push::PushBackend>,
    pub mirror: Arc<dyn mirror::MirrorBackend>,
    pub notifications: Arc<dyn NotificationStore>,
    pub missed_message_sender: Arc<dyn MissedMessageSender>,
    pub link_previewer: Arc<dyn embed_links::LinkPreviewer>,
    pub activity: Arc<dyn user_activity::ActivityStore>,
    pub clock: Arc<dyn Clock>,
    /// Per-recipient digest windows; `None` uses `QueueSettings::email_batching_period`.
    pub missed_message_windows: Option<Arc<dyn BatchingWindows>>,
}

fn boxed<W: Worker + 'static>(worker: Result<W, WorkerError>) -> Result<Box<dyn Worker>, WorkerError> {
    Ok(Box::new(worker?))
}

fn register_kind(
    builder: WorkerRegistryBuilder,
    kind: WorkerKind,
    backends: &Backends,
    settings: &Arc<QueueSettings>,
    mirror_limiter: &Arc<SlidingWindowLimiter>,
) -> Result<WorkerRegistryBuilder, WorkerError> {
    let descriptor = kind.descriptor();
    match kind {
        WorkerKind::EmailSenders => {
            let backend = Arc::clone(&backends.email);
            builder.register(descriptor, move || boxed(email::worker(Arc::clone(&backend))))
        }
        WorkerKind::PushNotifications => {
            let backend = Arc::clone(&backends.push);
            builder.register(descriptor, move || boxed(push::worker(Arc::clone(&backend))))
        }
        WorkerKind::EmailMirror => {
            let backend = Arc::clone(&backends.mirror);
            let limiter = Arc::clone(mirror_limiter);
            builder.register(descriptor, move || {
                boxed(mirror::worker(Arc::clone(&backend), Arc::clone(&limiter)))
            })
        }
        WorkerKind::MissedMessageEmails => {
            let store = Arc::clone(&backends.notifications);
            let sender = Arc::clone(&backends.missed_message_sender);
            let clock = Arc::clone(&backends.clock);
            let windows: Arc<dyn BatchingWindows> = match &backends.missed_message_windows {
                Some(windows) => Arc::clone(windows),
                None => Arc::new(settings.email_batching_period),
            };
            let settings = Arc::clone(settings);
            builder.register(descriptor, move || {
                boxed(MissedMessageWorker::with_windows(
                    &settings,
                    Arc::clone(&store),
                    Arc::clone(&sender),
                    Arc::clone(&clock),
                    Arc::clone(&windows),
                ))
            })
        }
        WorkerKind::EmbedLinks => {
            let previewer = Arc::clone(&backends.link_previewer);
            builder.register(descriptor, move || boxed(embed_links::worker(Arc::clone(&previewer))))
        }
        WorkerKind::UserActivity => {
            let store = Arc::clone(&backends.activity);
            builder.register(descriptor, move || boxed(user_activity::worker(Arc::clone(&store))))
        }
    }
}

/// Registers every built-in worker, plus any `extra` registrations (test queues,
/// application workers), and checks that no built-in kind is missing.
pub fn default_registry_with<F>(
    backends: &Backends,
    settings: Arc<QueueSettings>,
    extra: F,
) -> Result<WorkerRegistry, WorkerError>
where
    F: FnOnce(WorkerRegistryBuilder) -> Result<WorkerRegistryBuilder, WorkerError>,
{
    let mirror_limiter = Arc::new(SlidingWindowLimiter::new(
        settings.mirror_rate_limit_rules.clone(),
        Arc::clone(&backends.clock),
    ));

    let mut builder = WorkerRegistry::builder();
    for kind in WorkerKind::ALL {
        builder = register_kind(builder, kind, backends, &settings, &mirror_limiter)?;
    }

    extra(builder)?.build_checked(WorkerKind::ALL.iter().map(|kind| kind.queue_name()))
}

pub fn default_registry(backends: &Backends, settings: Arc<QueueSettings>) -> Result<WorkerRegistry, WorkerError> {
    default_registry_with(backends, settings, |builder| Ok(builder))
}


#[cfg(test)]
mod tests {
    use super::testing::backends;
    use super::*;
    use crate::clock::ManualClock;
    use crate::handler::QueueProcessor;
    use crate::item::QueueItem;
    use crate::missed_message::{
        InMemoryNotificationStore, MissedMessageEvent, NotificationTrigger, PerRecipientWindows,
    };
    use crate::transport::{InMemoryQueue, QueueClient};
    use crate::worker::{QueueWorker, WorkerContext};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::time::Duration;

    struct TimeoutProcessor;

    #[async_trait]
    impl QueueProcessor for TimeoutProcessor {
        async fn consume(&self, _item: QueueItem, _ctx: &WorkerContext) -> Result<(), WorkerError> {
            Ok(())
        }
    }

    #[test]
    fn test_every_non_test_worker_is_active() {
        let registry = default_registry_with(&backends(), Arc::new(QueueSettings::default()), |builder| {
            builder.register(
                WorkerDescriptor::new("timeout_worker", "TimeoutWorker").test_queue(),
                || boxed(QueueWorker::new("timeout_worker", TimeoutProcessor)),
            )
        })
        .unwrap();

        let mut expected: Vec<String> = WorkerKind::ALL.iter().map(|k| k.queue_name().to_string()).collect();
        expected.sort();
        assert_eq!(registry.active_queues(false), expected);
        assert_eq!(registry.active_queues(true), vec!["timeout_worker"]);
    }

    #[test]
    fn test_factories_build_workers_for_their_own_queue() {
        let registry = default_registry(&backends(), Arc::new(QueueSettings::default())).unwrap();
        for kind in WorkerKind::ALL {
            let worker = registry.create(kind.queue_name()).unwrap();
            assert_eq!(worker.queue_name(), kind.queue_name());
            assert_eq!(registry.descriptor(kind.queue_name()).unwrap().worker_class, kind.worker_class());
        }
    }

    #[test]
    fn test_extra_registrations_cannot_shadow_built_in_queues() {
        let result = default_registry_with(&backends(), Arc::new(QueueSettings::default()), |builder| {
            builder.register(WorkerDescriptor::new("email_senders", "Impostor"), || {
                boxed(QueueWorker::new("email_senders", TimeoutProcessor))
            })
        });
        assert!(matches!(result, Err(WorkerError::DuplicateQueue(_))));
    }

    #[tokio::test]
    async fn test_registry_passes_per_recipient_windows_to_the_digest_worker() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(QueueSettings::builder().queue_error_dir(dir.path()).build());
        let start = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
        let store = Arc::new(InMemoryNotificationStore::new());

        let mut backends = backends();
        backends.notifications = store.clone();
        backends.clock = Arc::new(ManualClock::new(start));
        backends.missed_message_windows = Some(Arc::new(PerRecipientWindows {
            default: settings.email_batching_period,
            overrides: HashMap::from([(10, Duration::from_secs(30))]),
        }));

        let registry = default_registry(&backends, Arc::clone(&settings)).unwrap();
        let mut worker = registry.create(missed_message::QUEUE_NAME).unwrap();

        let queue = Arc::new(InMemoryQueue::new());
        for user_profile_id in [10, 12] {
            let event = MissedMessageEvent {
                user_profile_id,
                message_id: user_profile_id * 100,
                trigger: NotificationTrigger::PrivateMessage,
                mentioned_user_group_id: None,
            };
            queue
                .enqueue(missed_message::QUEUE_NAME, QueueItem::from_serialize(&event).unwrap())
                .await
                .unwrap();
        }
        worker.setup(queue, Arc::clone(&settings));
        assert_eq!(worker.start().await.unwrap().processed, 2);

        let overridden = store.rows_for(10);
        assert_eq!(overridden[0].scheduled_timestamp, start + chrono::Duration::seconds(30));
        let default = store.rows_for(12);
        assert_eq!(
            default[0].scheduled_timestamp,
            start + chrono::Duration::from_std(settings.email_batching_period).unwrap()
        );
    }
}
