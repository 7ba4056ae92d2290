use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use serde::Serialize;
use tracing::{debug, info};

use crate::{
    clients::queue::QueueProducer,
    config::RabbitMqConfig,
    models::{
        audit::AuditEvent,
        message::DlqMessage,
        request::{Channel as NotifyChannel, NotificationRequest},
    },
};

const PERSISTENT: u8 = 2;

pub struct RabbitMqClient {
    connection: Connection,
    channel: Channel,
    config: RabbitMqConfig,
}

impl RabbitMqClient {
    /// Connects and declares the topology for `channels`: each channel queue, its retry
    /// queue dead-lettering back into it, plus the failed and audit queues.
    pub async fn connect(config: &RabbitMqConfig, channels: &[NotifyChannel]) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        // retries and dead letters are acked upstream only once the broker has them
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        let client = Self {
            connection,
            channel,
            config: config.clone(),
        };

        for notify_channel in channels {
            let queue = config.queue_for(*notify_channel);
            client.declare(queue, FieldTable::default()).await?;

            let mut retry_args = FieldTable::default();
            retry_args.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from("")),
            );
            retry_args.insert(
                ShortString::from("x-dead-letter-routing-key"),
                AMQPValue::LongString(LongString::from(queue)),
            );
            client
                .declare(&config.retry_queue_for(*notify_channel), retry_args)
                .await?;
        }

        client.declare(&config.failed_queue, FieldTable::default()).await?;
        client.declare(&config.audit_queue, FieldTable::default()).await?;

        info!(channels = channels.len(), "RabbitMQ topology declared");
        Ok(client)
    }

    async fn declare(&self, queue: &str, arguments: FieldTable) -> Result<(), Error> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", queue, e))?;

        debug!(queue, "Queue declared");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn create_consumer(
        &self,
        notify_channel: NotifyChannel,
        consumer_tag: &str,
    ) -> Result<Consumer, Error> {
        let queue = self.config.queue_for(notify_channel);
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer on {}: {}", queue, e))?;

        info!(queue, consumer_tag, "Consumer created");
        Ok(consumer)
    }

    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| anyhow!("Failed to reject message: {}", e))?;

        Ok(())
    }

    /// Ready message count of a channel queue.
    pub async fn queue_depth(&self, notify_channel: NotifyChannel) -> Result<u32, Error> {
        let queue = self
            .channel
            .queue_declare(
                self.config.queue_for(notify_channel),
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to inspect queue: {}", e))?;

        Ok(queue.message_count())
    }

    async fn publish<T: Serialize>(
        &self,
        queue: &str,
        body: &T,
        properties: BasicProperties,
    ) -> Result<(), Error> {
        let payload = serde_json::to_vec(body)?;

        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                properties
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type(ShortString::from("application/json")),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish to {}: {}", queue, e))?
            .await
            .map_err(|e| anyhow!("Publish to {} was not confirmed: {}", queue, e))?;

        ensure_confirmed(queue, &confirmation)
    }
}

fn ensure_confirmed(queue: &str, confirmation: &Confirmation) -> Result<(), Error> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(anyhow!("Broker refused message for {}", queue)),
        Confirmation::NotRequested => Err(anyhow!(
            "Publish to {} was sent without publisher confirms",
            queue
        )),
    }
}

#[async_trait]
impl QueueProducer for RabbitMqClient {
    async fn publish_retry(
        &self,
        channel: NotifyChannel,
        request: &NotificationRequest,
        delay: Duration,
    ) -> Result<(), Error> {
        let queue = self.config.retry_queue_for(channel);
        let expiration = delay.as_millis().max(1).to_string();

        self.publish(
            &queue,
            request,
            BasicProperties::default()
                .with_expiration(ShortString::from(expiration))
                .with_message_id(ShortString::from(request.message_id.clone())),
        )
        .await?;

        debug!(message_id = %request.message_id, queue = %queue, delay_ms = delay.as_millis() as u64, "Retry published");
        Ok(())
    }

    async fn publish_dead_letter(&self, message: &DlqMessage) -> Result<(), Error> {
        self.publish(&self.config.failed_queue, message, BasicProperties::default())
            .await
    }

    async fn publish_audit(&self, event: &AuditEvent) -> Result<(), Error> {
        self.publish(&self.config.audit_queue, event, BasicProperties::default())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_acked_publishes_succeed() {
        assert!(ensure_confirmed("notifications.failed", &Confirmation::Ack(None)).is_ok());

        let nack = ensure_confirmed("notifications.failed", &Confirmation::Nack(None)).unwrap_err();
        assert!(nack.to_string().contains("refused"));

        assert!(ensure_confirmed("notifications.failed", &Confirmation::NotRequested).is_err());
    }
}
