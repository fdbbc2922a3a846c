//! RabbitMQ transport built on `lapin`.

use super::{BatchHandler, Disposition, QueueClient};
use crate::error::WorkerError;
use crate::item::QueueItem;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;

/// A queue client holding one broker connection.
///
/// Each worker should own its own `AmqpQueue`; connections are not shared across workers.
pub struct AmqpQueue {
    connection: Connection,
    channel: Channel,
    declared: Mutex<HashSet<String>>,
}

impl AmqpQueue {
    /// Connects to the broker and opens the publishing channel.
    pub async fn connect(amqp_url: &str) -> Result<Self, WorkerError> {
        log::info!("Connecting to AMQP broker...");
        let connection = Connection::connect(amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        Ok(Self {
            connection,
            channel,
            declared: Mutex::new(HashSet::new()),
        })
    }

    /// Declares the durable queue once per client.
    async fn ensure_queue(&self, channel: &Channel, queue_name: &str) -> Result<(), WorkerError> {
        if self.declared.lock().contains(queue_name) {
            return Ok(());
        }

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;

        self.declared.lock().insert(queue_name.to_string());
        log::info!("Queue '{}' is declared.", queue_name);
        Ok(())
    }

    /// Waits for the first delivery, then keeps collecting until the batch is full
    /// or `timeout` elapses. Returns `None` when the consumer stream has ended.
    async fn next_deliveries(
        consumer: &mut lapin::Consumer,
        batch_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<Delivery>>, WorkerError> {
        let first = match consumer.next().await {
            Some(delivery) => delivery?,
            None => return Ok(None),
        };

        let mut deliveries = vec![first];
        let deadline = tokio::time::Instant::now() + timeout.unwrap_or(Duration::ZERO);

        while deliveries.len() < batch_size {
            match tokio::time::timeout_at(deadline, consumer.next()).await {
                Ok(Some(delivery)) => deliveries.push(delivery?),
                Ok(None) | Err(_) => break,
            }
        }

        Ok(Some(deliveries))
    }
}

#[async_trait]
impl QueueClient for AmqpQueue {
    async fn enqueue(&self, queue_name: &str, item: QueueItem) -> Result<(), WorkerError> {
        self.ensure_queue(&self.channel, queue_name).await?;

        let payload = serde_json::to_vec(&item)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        self.channel
            .basic_publish("", queue_name, BasicPublishOptions::default(), &payload, properties)
            .await?;

        Ok(())
    }

    async fn consume(
        &self,
        queue_name: &str,
        batch_size: usize,
        timeout: Option<Duration>,
        handler: &mut (dyn BatchHandler + Send),
    ) -> Result<(), WorkerError> {
        let channel = self.connection.create_channel().await?;
        self.ensure_queue(&channel, queue_name).await?;

        let prefetch = u16::try_from(batch_size.max(1)).unwrap_or(u16::MAX);
        channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
        log::info!("QoS prefetch count set to {}", prefetch);

        let mut consumer = channel
            .basic_consume(
                queue_name,
                &format!("{}_consumer", queue_name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "Consumer started with tag '{}'. Waiting for messages...",
            consumer.tag().as_str()
        );

        while let Some(deliveries) =
            Self::next_deliveries(&mut consumer, batch_size.max(1), timeout).await?
        {
            let mut accepted = Vec::with_capacity(deliveries.len());
            let mut items = Vec::with_capacity(deliveries.len());

            for delivery in deliveries {
                match serde_json::from_slice::<QueueItem>(&delivery.data) {
                    Ok(item) => {
                        items.push(item);
                        accepted.push(delivery);
                    }
                    Err(e) => {
                        log::error!(
                            "Failed to parse message on queue {}, rejecting. Tag: {}, Error: {}",
                            queue_name,
                            delivery.delivery_tag,
                            e
                        );
                        handler.handle_unparsable(QueueItem::from_raw(&delivery.data)).await;
                        delivery
                            .nack(BasicNackOptions { requeue: false, ..Default::default() })
                            .await?;
                    }
                }
            }

            if items.is_empty() {
                continue;
            }

            match handler.handle_batch(items).await {
                Disposition::Ack => {
                    for delivery in accepted {
                        delivery.ack(BasicAckOptions::default()).await?;
                    }
                }
                Disposition::Redeliver => {
                    for delivery in accepted {
                        // Interrupted work gets one more chance; a second interruption drops it.
                        let requeue = !delivery.redelivered;
                        delivery
                            .nack(BasicNackOptions { requeue, ..Default::default() })
                            .await?;
                        log::info!(
                            "Message nacked after interruption. Tag: {}, requeued: {}",
                            delivery.delivery_tag,
                            requeue
                        );
                    }
                }
            }
        }

        log::warn!("Consumer for queue '{}' ended.", queue_name);
        Ok(())
    }
}
