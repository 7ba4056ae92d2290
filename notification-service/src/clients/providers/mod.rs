//! Outbound channel providers.
//!
//! Each provider owns one channel and talks to exactly one external API.

mod chat;
mod email;
mod mock;
mod sms;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use crate::{
    config::Config,
    error::ProviderError,
    models::{
        message::RenderedMessage,
        provider::{DeliveryReport, ProviderReceipt},
        request::Channel,
    },
};

pub use chat::ChatProvider;
pub use email::EmailProvider;
pub use mock::{MockProvider, SentMessage};
pub use sms::SmsProvider;

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn channel(&self) -> Channel;

    /// Provider name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Most recipients one provider request carries. `None` sends the whole list at once.
    ///
    /// Callers split larger lists so rate limits and timeouts apply per request.
    fn max_batch(&self) -> Option<usize> {
        None
    }

    /// Validates credentials and reachability. Called once at startup.
    async fn initialize(&self) -> Result<(), ProviderError>;

    async fn send(
        &self,
        message: &RenderedMessage,
        recipients: &[String],
    ) -> Result<ProviderReceipt, ProviderError>;

    async fn get_delivery_status(
        &self,
        provider_message_id: &str,
    ) -> Result<DeliveryReport, ProviderError>;

    async fn health_check(&self) -> Result<bool, ProviderError>;
}

pub(crate) fn http_client(timeout_ms: u64) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|e| ProviderError::Config(e.to_string()))
}

/// Builds a provider for every enabled channel.
pub fn build_providers(
    config: &Config,
) -> Result<HashMap<Channel, Arc<dyn ProviderClient>>, ProviderError> {
    let mut providers: HashMap<Channel, Arc<dyn ProviderClient>> = HashMap::new();

    for channel in config.enabled_channels() {
        let provider: Arc<dyn ProviderClient> = match channel {
            Channel::Email => Arc::new(EmailProvider::new(config.email.clone())?),
            Channel::Sms => Arc::new(SmsProvider::new(config.sms.clone())?),
            Channel::Chat => Arc::new(ChatProvider::new(config.chat.clone())?),
        };

        info!(%channel, provider = provider.name(), "Provider configured");
        providers.insert(channel, provider);
    }

    Ok(providers)
}
