use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ProviderClient, http_client};
use crate::{
    config::SmsConfig,
    error::ProviderError,
    models::{
        message::RenderedMessage,
        provider::{DeliveryReport, ProviderReceipt},
        request::Channel,
        status::DeliveryState,
        validation::validate_phone_number,
    },
};

const MAX_BODY_CHARS: usize = 1600;

/// Error codes the SMS API uses for unusable destination numbers.
const INVALID_NUMBER_CODES: &[u32] = &[21211, 21214, 21217, 21614];

/// SMS over a Twilio-style REST API: form-encoded, basic auth, one request per recipient.
pub struct SmsProvider {
    config: SmsConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct MessageResource {
    sid: String,
    status: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    error_code: Option<u32>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<u32>,
    message: String,
}

fn message_state(status: &str) -> DeliveryState {
    match status {
        "delivered" | "read" => DeliveryState::Delivered,
        "failed" | "undelivered" | "canceled" => DeliveryState::Failed,
        _ => DeliveryState::Sent,
    }
}

fn sms_body(message: &RenderedMessage) -> String {
    let body = if message.text_body.trim().is_empty() {
        message.subject.clone()
    } else {
        message.text_body.trim().to_string()
    };
    body.chars().take(MAX_BODY_CHARS).collect()
}

impl SmsProvider {
    pub fn new(config: SmsConfig) -> Result<Self, ProviderError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }

    fn account_url(&self, path: &str) -> String {
        format!(
            "{}/Accounts/{}{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.account_sid,
            path
        )
    }

    async fn error_from(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        match serde_json::from_str::<ApiError>(&body) {
            Ok(ApiError {
                code: Some(code),
                message,
            }) if INVALID_NUMBER_CODES.contains(&code) => ProviderError::InvalidRecipient(message),
            Ok(error) => ProviderError::from_status(status, error.message),
            Err(_) => ProviderError::from_status(status, body),
        }
    }

    async fn send_one(&self, to: &str, body: &str) -> Result<MessageResource, ProviderError> {
        let response = self
            .client
            .post(self.account_url("/Messages.json"))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("To", to), ("From", self.config.from_number.as_str()), ("Body", body)])
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, self.config.timeout_ms))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))
    }
}

#[async_trait]
impl ProviderClient for SmsProvider {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn name(&self) -> &'static str {
        "twilio"
    }

    fn max_batch(&self) -> Option<usize> {
        Some(1)
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        if self.config.account_sid.trim().is_empty() || self.config.auth_token.trim().is_empty() {
            return Err(ProviderError::Config("sms credentials are not set".to_string()));
        }
        validate_phone_number(&self.config.from_number)
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        if !self.health_check().await? {
            return Err(ProviderError::Config(
                "sms provider rejected the configured credentials".to_string(),
            ));
        }

        info!(from = %self.config.from_number, "SMS provider initialized");
        Ok(())
    }

    /// Sends to each recipient in turn. Every accepted number keeps its own message sid.
    ///
    /// Per-number rejections are collected on the receipt; the first transient error aborts the
    /// batch so the whole message is retried. If every number is rejected the first rejection is
    /// returned as the error.
    async fn send(
        &self,
        message: &RenderedMessage,
        recipients: &[String],
    ) -> Result<ProviderReceipt, ProviderError> {
        let body = sms_body(message);
        let mut accepted: Option<ProviderReceipt> = None;
        let mut rejections: Vec<(String, ProviderError)> = Vec::new();

        for recipient in recipients {
            debug!(message_id = %message.message_id, to = %recipient, "Sending SMS");

            match self.send_one(recipient, &body).await {
                Ok(resource) if message_state(&resource.status) == DeliveryState::Failed => {
                    let reason = resource
                        .error_message
                        .unwrap_or_else(|| format!("message {}", resource.status));
                    rejections.push((recipient.clone(), ProviderError::InvalidRecipient(reason)));
                }
                Ok(resource) => {
                    let receipt = accepted
                        .take()
                        .unwrap_or_else(|| ProviderReceipt::accepted(resource.sid.clone()));
                    accepted = Some(receipt.with_recipient_id(recipient.clone(), resource.sid));
                }
                Err(error @ (ProviderError::InvalidRecipient(_) | ProviderError::Rejected { .. })) => {
                    warn!(to = %recipient, error = %error, "SMS recipient rejected");
                    rejections.push((recipient.clone(), error));
                }
                Err(error) => return Err(error),
            }
        }

        let Some(receipt) = accepted else {
            return Err(rejections
                .into_iter()
                .next()
                .map(|(_, error)| error)
                .unwrap_or_else(|| ProviderError::InvalidRecipient("no recipients".to_string())));
        };

        info!(
            message_id = %message.message_id,
            provider_message_id = %receipt.provider_message_id,
            rejected = rejections.len(),
            "SMS accepted by provider"
        );

        Ok(rejections
            .into_iter()
            .fold(receipt, |r, (to, error)| r.with_rejection(to, error.to_string())))
    }

    async fn get_delivery_status(
        &self,
        provider_message_id: &str,
    ) -> Result<DeliveryReport, ProviderError> {
        let response = self
            .client
            .get(self.account_url(&format!("/Messages/{}.json", provider_message_id)))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, self.config.timeout_ms))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let resource: MessageResource = response
            .json()
            .await
            .map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))?;

        let status = message_state(&resource.status);
        let error = match (resource.error_code, resource.error_message) {
            (_, Some(message)) => Some(message),
            (Some(code), None) => Some(format!("provider error code {}", code)),
            (None, None) if status.is_failure() => Some(format!("message {}", resource.status)),
            _ => None,
        };

        Ok(DeliveryReport {
            provider_message_id: resource.sid,
            recipient: resource.to,
            status,
            error,
        })
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let response = self
            .client
            .get(self.account_url(".json"))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, self.config.timeout_ms))?;

        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::NotificationRequest;

    #[test]
    fn test_body_falls_back_to_subject_and_truncates() {
        let request = NotificationRequest::new("m1", "s1", "system-alert", vec![]);

        let message = RenderedMessage::new(&request, "t", "Subject".into(), String::new(), "  ".into());
        assert_eq!(sms_body(&message), "Subject");

        let message = RenderedMessage::new(&request, "t", "S".into(), String::new(), "x".repeat(2000));
        assert_eq!(sms_body(&message).chars().count(), MAX_BODY_CHARS);
    }

    #[test]
    fn test_message_state_mapping() {
        assert_eq!(message_state("queued"), DeliveryState::Sent);
        assert_eq!(message_state("delivered"), DeliveryState::Delivered);
        assert_eq!(message_state("undelivered"), DeliveryState::Failed);
    }
}
