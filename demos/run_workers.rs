use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queue_processors::clock::SystemClock;
use queue_processors::missed_message::{InMemoryNotificationStore, MissedMessageSender, ScheduledNotification};
use queue_processors::workers::{email, embed_links, mirror, push, user_activity};
use queue_processors::{
    default_registry, AmqpQueue, Backends, Dispatcher, QueueClient, QueueItem, QueueSettings,
    WorkerError,
};
use std::sync::Arc;

// Backends that only log what a real deployment would do.
struct LoggingBackend;

#[async_trait]
impl email::EmailBackend for LoggingBackend {
    async fn send_email(&self, request: &email::EmailRequest) -> Result<(), email::EmailError> {
        if request.to_emails.is_empty() && request.to_user_ids.is_empty() {
            return Err(email::EmailError::Invalid("no recipients".to_string()));
        }
        log::info!("Sending {} to {:?}", request.template_prefix, request.to_emails);
        Ok(())
    }
}

#[async_trait]
impl push::PushBackend for LoggingBackend {
    async fn send_notification(&self, user_profile_id: u64, event: &QueueItem) -> Result<(), push::PushError> {
        log::info!("Push to user {}: {:?}", user_profile_id, event.as_map());
        Ok(())
    }

    async fn remove_notifications(&self, user_profile_id: u64, message_ids: &[u64]) -> Result<(), push::PushError> {
        log::info!("Removing push notifications {:?} for user {}", message_ids, user_profile_id);
        Ok(())
    }
}

#[async_trait]
impl mirror::MirrorBackend for LoggingBackend {
    async fn realm_for_address(&self, rcpt_to: &str) -> Result<mirror::Realm, WorkerError> {
        let domain = rcpt_to.rsplit('@').next().unwrap_or(rcpt_to);
        Ok(mirror::Realm {
            string_id: domain.to_string(),
            name: domain.to_string(),
        })
    }

    async fn mirror_email(&self, message: &[u8], rcpt_to: &str) -> Result<(), WorkerError> {
        log::info!("Mirroring {} bytes sent to {}", message.len(), rcpt_to);
        Ok(())
    }
}

#[async_trait]
impl MissedMessageSender for LoggingBackend {
    async fn send_batch(
        &self,
        user_profile_id: u64,
        events: Vec<ScheduledNotification>,
        count: usize,
    ) -> Result<(), WorkerError> {
        let ids: Vec<u64> = events.iter().map(|e| e.message_id).collect();
        log::info!("Digest for user {}: {} message(s) {:?}", user_profile_id, count, ids);
        Ok(())
    }
}

#[async_trait]
impl embed_links::LinkPreviewer for LoggingBackend {
    async fn fetch_embed_data(&self, url: &str) -> Result<(), WorkerError> {
        log::info!("Fetching preview for {}", url);
        Ok(())
    }

    async fn render_message(&self, message_id: u64) -> Result<(), WorkerError> {
        log::info!("Re-rendering message {}", message_id);
        Ok(())
    }
}

#[async_trait]
impl user_activity::ActivityStore for LoggingBackend {
    async fn client_id(&self, name: &str) -> Result<u64, WorkerError> {
        Ok(name.bytes().map(u64::from).sum())
    }

    async fn update_user_activity(
        &self,
        user_profile_id: u64,
        client_id: u64,
        query: &str,
        count: u64,
        last_visit: DateTime<Utc>,
    ) -> Result<(), WorkerError> {
        log::info!(
            "User {} client {} {} x{} (last {})",
            user_profile_id,
            client_id,
            query,
            count,
            last_visit
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Arc::new(QueueSettings::from_env());
    log::info!("Using AMQP broker at {}", settings.amqp_url);

    let logging = Arc::new(LoggingBackend);
    let backends = Backends {
        email: logging.clone(),
        push: logging.clone(),
        mirror: logging.clone(),
        notifications: Arc::new(InMemoryNotificationStore::new()),
        missed_message_sender: logging.clone(),
        link_previewer: logging.clone(),
        activity: logging,
        clock: Arc::new(SystemClock),
        missed_message_windows: None,
    };

    let registry = match default_registry(&backends, Arc::clone(&settings)) {
        Ok(registry) => registry,
        Err(e) => {
            log::error!("Worker registry is incomplete: {}", e);
            return;
        }
    };

    let dispatcher = Dispatcher::new(registry, Arc::clone(&settings));
    let amqp_url = settings.amqp_url.clone();
    let running = dispatcher
        .spawn_all(false, |_| {
            let amqp_url = amqp_url.clone();
            async move {
                let client: Arc<dyn QueueClient> = Arc::new(AmqpQueue::connect(&amqp_url).await?);
                Ok::<_, WorkerError>(client)
            }
        })
        .await;

    let running = match running {
        Ok(running) => running,
        Err(e) => {
            log::error!("Failed to start workers: {}", e);
            return;
        }
    };

    log::info!("Started {} worker(s). Press Ctrl+C to stop.", running.len());
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl+C: {}", e);
    }

    log::info!("Ctrl+C received. Shutting down.");
    for worker in running {
        worker.handle.abort();
    }
    log::info!("Application has shut down.");
}
