use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ProviderClient, http_client};
use crate::{
    config::ChatConfig,
    error::ProviderError,
    models::{
        message::RenderedMessage,
        provider::{DeliveryReport, ProviderOutcome, ProviderReceipt},
        request::Channel,
        status::DeliveryState,
    },
};

/// Chat over a Slack-style incoming webhook.
///
/// Webhooks confirm synchronously and return no message id, so receipts carry a locally
/// generated id and a `Delivered` outcome.
pub struct ChatProvider {
    config: ChatConfig,
    client: Client,
}

fn escape_markdown(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Webhook error bodies that mean the destination itself is unusable.
fn destination_error(body: &str) -> Option<&'static str> {
    match body {
        "channel_not_found" => Some("Invalid chat destination: channel not found"),
        "channel_is_archived" => Some("Invalid chat destination: channel is archived"),
        "user_not_found" => Some("Invalid chat destination: user not found"),
        _ => None,
    }
}

impl ChatProvider {
    pub fn new(config: ChatConfig) -> Result<Self, ProviderError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }

    fn format_message(&self, message: &RenderedMessage, destination: &str) -> Value {
        let mut body = json!({
            "username": self.config.username,
            "text": format!("{} {}", message.priority.icon(), message.subject),
            "attachments": [
                {
                    "color": message.priority.color(),
                    "title": escape_markdown(&message.subject),
                    "text": escape_markdown(message.text_body.trim()),
                    "footer": format!("{} | {}", message.event_type, message.message_id),
                }
            ]
        });

        // default destination is whatever the webhook is bound to
        if !destination.is_empty() {
            body["channel"] = json!(destination);
        }

        body
    }
}

#[async_trait]
impl ProviderClient for ChatProvider {
    fn channel(&self) -> Channel {
        Channel::Chat
    }

    fn name(&self) -> &'static str {
        "slack"
    }

    fn max_batch(&self) -> Option<usize> {
        Some(1)
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        let url = reqwest::Url::parse(&self.config.webhook_url)
            .map_err(|e| ProviderError::Config(format!("invalid chat webhook url: {}", e)))?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(ProviderError::Config(format!(
                "unsupported chat webhook scheme: {}",
                url.scheme()
            )));
        }

        if !self.health_check().await? {
            return Err(ProviderError::Config(
                "chat webhook is revoked or unavailable".to_string(),
            ));
        }

        info!(host = url.host_str().unwrap_or_default(), "Chat provider initialized");
        Ok(())
    }

    async fn send(
        &self,
        message: &RenderedMessage,
        recipients: &[String],
    ) -> Result<ProviderReceipt, ProviderError> {
        let mut delivered = 0usize;
        let mut rejections: Vec<(String, ProviderError)> = Vec::new();

        for destination in recipients {
            debug!(message_id = %message.message_id, destination = %destination, "Posting chat message");

            let response = self
                .client
                .post(&self.config.webhook_url)
                .json(&self.format_message(message, destination))
                .send()
                .await
                .map_err(|e| ProviderError::from_reqwest(e, self.config.timeout_ms))?;

            let status = response.status().as_u16();
            if response.status().is_success() {
                delivered += 1;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            let error = match destination_error(body.trim()) {
                Some(reason) => ProviderError::InvalidRecipient(reason.to_string()),
                None => ProviderError::from_status(status, body),
            };

            match error {
                ProviderError::InvalidRecipient(_) | ProviderError::Rejected { .. } => {
                    warn!(destination = %destination, error = %error, "Chat destination rejected");
                    rejections.push((destination.clone(), error));
                }
                other => return Err(other),
            }
        }

        if delivered == 0 {
            return Err(rejections
                .into_iter()
                .next()
                .map(|(_, error)| error)
                .unwrap_or_else(|| ProviderError::InvalidRecipient("no destinations".to_string())));
        }

        let receipt = ProviderReceipt::accepted(format!("chat-{}", Uuid::new_v4()))
            .with_outcome(ProviderOutcome::Delivered);

        info!(
            message_id = %message.message_id,
            provider_message_id = %receipt.provider_message_id,
            delivered,
            "Chat message posted"
        );

        Ok(rejections
            .into_iter()
            .fold(receipt, |r, (to, error)| r.with_rejection(to, error.to_string())))
    }

    async fn get_delivery_status(
        &self,
        provider_message_id: &str,
    ) -> Result<DeliveryReport, ProviderError> {
        Ok(DeliveryReport {
            provider_message_id: provider_message_id.to_string(),
            recipient: None,
            status: DeliveryState::Delivered,
            error: None,
        })
    }

    /// Webhooks only accept posts, so any answer short of a revoked hook or an outage is healthy.
    async fn health_check(&self) -> Result<bool, ProviderError> {
        let response = self
            .client
            .get(&self.config.webhook_url)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, self.config.timeout_ms))?;

        let status = response.status();
        Ok(!status.is_server_error() && !matches!(status.as_u16(), 401 | 403 | 404 | 410))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::{NotificationRequest, Priority};

    #[test]
    fn test_format_message_sets_channel_override() {
        let provider = ChatProvider::new(ChatConfig {
            webhook_url: "https://hooks.example.org/T000/B000".into(),
            ..ChatConfig::default()
        })
        .unwrap();

        let request = NotificationRequest::new("m1", "s1", "system-alert", vec!["#ops".into()])
            .with_priority(Priority::Urgent);
        let message = RenderedMessage::new(
            &request,
            "system-alert",
            "System Alert".into(),
            String::new(),
            "disk <90%>".into(),
        );

        let body = provider.format_message(&message, "#ops");
        assert_eq!(body["channel"], "#ops");
        assert_eq!(body["attachments"][0]["color"], Priority::Urgent.color());
        assert_eq!(body["attachments"][0]["text"], "disk &lt;90%&gt;");

        let body = provider.format_message(&message, "");
        assert!(body.get("channel").is_none());
    }

    #[test]
    fn test_destination_errors() {
        assert!(destination_error("channel_not_found").is_some());
        assert!(destination_error("invalid_payload").is_none());
    }
}
