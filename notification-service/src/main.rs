use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use notification_service::{
    api::{AppState, run_api_server},
    clients::{
        health::HealthChecker, providers::build_providers, queue::QueueProducer,
        rbmq::RabbitMqClient, redis::RedisStatusStore, template::TemplateRenderer,
    },
    config::Config,
    handler::ChannelHandler,
    metrics::init_metrics,
    models::request::Channel,
    tracker::DeliveryTracker,
    utils::{ShutdownCoordinator, init_tracing},
    worker::WorkerPool,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(&config.log);
    init_metrics();

    info!("Starting notification service");

    let providers = build_providers(&config)?;
    for (channel, provider) in &providers {
        provider
            .initialize()
            .await
            .map_err(|e| anyhow!("Failed to initialize {} provider: {}", channel, e))?;
    }

    let store = RedisStatusStore::connect(&config.redis).await?;
    let tracker = DeliveryTracker::new(Arc::new(store));

    let channels: Vec<Channel> = providers.keys().copied().collect();
    let rabbitmq = Arc::new(RabbitMqClient::connect(&config.rabbitmq, &channels).await?);
    let producer: Arc<dyn QueueProducer> = rabbitmq.clone();

    let renderer = Arc::new(TemplateRenderer::new(config.templates.clone()));

    let handlers: Vec<Arc<ChannelHandler>> = Channel::ALL
        .into_iter()
        .filter_map(|channel| providers.get(&channel))
        .map(|provider| {
            Arc::new(ChannelHandler::new(
                Arc::clone(provider),
                Arc::clone(&renderer),
                tracker.clone(),
                Arc::clone(&producer),
                &config,
            ))
        })
        .collect();

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    let health_checker = HealthChecker::new(
        handlers.clone(),
        tracker.clone(),
        Some(Arc::clone(&rabbitmq)),
    );
    let state = Arc::new(AppState::new(
        health_checker,
        &handlers,
        tracker,
        &config.workers,
    ));

    let server = config.server.clone();
    let api_shutdown = shutdown.clone();
    let api = tokio::spawn(async move {
        if let Err(e) = run_api_server(&server, state, api_shutdown.clone()).await {
            error!(error = %e, "API server failed");
            api_shutdown.shutdown();
        }
    });

    let pool = WorkerPool::new(handlers, rabbitmq, config.workers.clone(), shutdown.clone());
    if let Err(e) = pool.run().await {
        error!(error = %e, "Worker pool failed");
        shutdown.shutdown();
    }

    if let Err(e) = api.await {
        error!(error = %e, "API task panicked");
    }

    info!("Notification service stopped");
    Ok(())
}
