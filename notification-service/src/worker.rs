//! Queue consumers: a fixed pool of workers per channel.

use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use futures_util::StreamExt;
use lapin::message::Delivery;
use tokio::{task::JoinSet, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    clients::rbmq::RabbitMqClient, config::WorkerConfig, handler::ChannelHandler,
    utils::ShutdownCoordinator,
};

const CONSUMER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    handlers: Vec<Arc<ChannelHandler>>,
    rabbitmq: Arc<RabbitMqClient>,
    config: WorkerConfig,
    shutdown: ShutdownCoordinator,
}

impl WorkerPool {
    pub fn new(
        handlers: Vec<Arc<ChannelHandler>>,
        rabbitmq: Arc<RabbitMqClient>,
        config: WorkerConfig,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            handlers,
            rabbitmq,
            config,
            shutdown,
        }
    }

    /// Spawns every worker and waits for them to exit after shutdown.
    pub async fn run(self) -> Result<(), Error> {
        let mut workers = JoinSet::new();

        for handler in &self.handlers {
            let channel = handler.channel();
            let count = self.config.workers_for(channel);

            for index in 0..count {
                let tag = format!("{}-worker-{}", channel, index);
                let consumer = self.rabbitmq.create_consumer(channel, &tag).await?;

                workers.spawn(run_worker(
                    tag,
                    consumer,
                    Arc::clone(handler),
                    Arc::clone(&self.rabbitmq),
                    self.shutdown.clone(),
                ));
            }

            info!(%channel, workers = count, "Channel workers started");
        }

        self.shutdown.wait().await;
        info!(
            grace_secs = self.config.shutdown_grace_secs,
            "Waiting for in-flight deliveries"
        );

        let drain = async { while workers.join_next().await.is_some() {} };
        if tokio::time::timeout(Duration::from_secs(self.config.shutdown_grace_secs), drain)
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed, aborting remaining workers");
            workers.abort_all();
        }

        info!("All workers stopped");
        Ok(())
    }
}

async fn run_worker(
    tag: String,
    mut consumer: lapin::Consumer,
    handler: Arc<ChannelHandler>,
    rabbitmq: Arc<RabbitMqClient>,
    shutdown: ShutdownCoordinator,
) {
    debug!(worker = %tag, "Worker started");

    loop {
        if shutdown.is_shutting_down() {
            break;
        }

        // do not pull work the provider cannot take
        if let Some(wait) = handler.breaker().retry_after() {
            debug!(worker = %tag, wait_ms = wait.as_millis() as u64, "Circuit open, backing off");
            tokio::select! {
                _ = sleep(wait) => continue,
                _ = shutdown.wait() => break,
            }
        }

        let next = tokio::select! {
            next = consumer.next() => next,
            _ = shutdown.wait() => break,
        };

        match next {
            Some(Ok(delivery)) => process(&tag, delivery, &handler, &rabbitmq).await,
            Some(Err(e)) => {
                error!(worker = %tag, error = %e, "Consumer error");
                sleep(CONSUMER_ERROR_BACKOFF).await;
            }
            None => {
                warn!(worker = %tag, "Consumer stream closed");
                break;
            }
        }
    }

    debug!(worker = %tag, "Worker stopped");
}

/// Acknowledges only after the handler has recorded the outcome; internal failures requeue.
async fn process(
    tag: &str,
    delivery: Delivery,
    handler: &ChannelHandler,
    rabbitmq: &RabbitMqClient,
) {
    let delivery_tag = delivery.delivery_tag;

    match handler.handle_delivery(&delivery.data).await {
        Ok(disposition) => {
            debug!(worker = %tag, ?disposition, "Delivery handled");
            if let Err(e) = rabbitmq.acknowledge(delivery_tag).await {
                error!(worker = %tag, error = %e, "Failed to acknowledge delivery");
            }
        }
        Err(e) => {
            error!(worker = %tag, error = %e, "Delivery failed internally, requeueing");
            if let Err(e) = rabbitmq.reject(delivery_tag, true).await {
                error!(worker = %tag, error = %e, "Failed to requeue delivery");
            }
        }
    }
}
