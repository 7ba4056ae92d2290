//! In-process provider for tests and local runs.

use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::ProviderClient;
use crate::{
    error::ProviderError,
    models::{
        message::RenderedMessage,
        provider::{DeliveryReport, ProviderReceipt},
        request::Channel,
        status::DeliveryState,
    },
};

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: RenderedMessage,
    pub recipients: Vec<String>,
}

/// Provider that replays scripted results and records every call.
///
/// Scripted results are consumed in order; once exhausted, calls succeed unless the provider
/// was built with [`MockProvider::failing`].
pub struct MockProvider {
    channel: Channel,
    script: Mutex<VecDeque<Result<ProviderReceipt, ProviderError>>>,
    always_fail: Option<ProviderError>,
    sent: Mutex<Vec<SentMessage>>,
    reports: Mutex<HashMap<String, DeliveryReport>>,
    healthy: AtomicBool,
    calls: AtomicUsize,
    max_batch: Option<usize>,
    latency: Option<Duration>,
}

impl MockProvider {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            always_fail: None,
            sent: Mutex::new(Vec::new()),
            reports: Mutex::new(HashMap::new()),
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            max_batch: None,
            latency: None,
        }
    }

    /// Behaves like a provider that takes `size` recipients per request.
    pub fn with_max_batch(mut self, size: usize) -> Self {
        self.max_batch = Some(size);
        self
    }

    /// Delays every send, for exercising dispatch timeouts.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn failing(channel: Channel, error: ProviderError) -> Self {
        Self {
            always_fail: Some(error),
            ..Self::new(channel)
        }
    }

    pub async fn push_result(&self, result: Result<ProviderReceipt, ProviderError>) {
        self.script.lock().await.push_back(result);
    }

    pub async fn push_error(&self, error: ProviderError) {
        self.push_result(Err(error)).await;
    }

    pub async fn set_report(&self, report: DeliveryReport) {
        self.reports
            .lock()
            .await
            .insert(report.provider_message_id.clone(), report);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of `send` calls, failed ones included.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages that were accepted.
    pub async fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    fn max_batch(&self) -> Option<usize> {
        self.max_batch
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn send(
        &self,
        message: &RenderedMessage,
        recipients: &[String],
    ) -> Result<ProviderReceipt, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = match self.script.lock().await.pop_front() {
            Some(result) => result,
            None => match &self.always_fail {
                Some(error) => Err(error.clone()),
                None => Ok(ProviderReceipt::accepted(format!(
                    "mock-{}-{}",
                    message.message_id, call
                ))),
            },
        };

        if result.is_ok() {
            self.sent.lock().await.push(SentMessage {
                message: message.clone(),
                recipients: recipients.to_vec(),
            });
        }

        result
    }

    async fn get_delivery_status(
        &self,
        provider_message_id: &str,
    ) -> Result<DeliveryReport, ProviderError> {
        Ok(self
            .reports
            .lock()
            .await
            .get(provider_message_id)
            .cloned()
            .unwrap_or_else(|| DeliveryReport {
                provider_message_id: provider_message_id.to_string(),
                recipient: None,
                status: DeliveryState::Sent,
                error: None,
            }))
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}
