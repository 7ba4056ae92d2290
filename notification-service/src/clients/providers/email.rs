use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ProviderClient, http_client};
use crate::{
    config::EmailConfig,
    error::ProviderError,
    models::{
        message::RenderedMessage,
        provider::{DeliveryReport, ProviderReceipt},
        request::Channel,
        status::DeliveryState,
        validation::validate_email_address,
    },
};

/// Email over a SendGrid-style v3 JSON API.
pub struct EmailProvider {
    config: EmailConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
    custom_args: CustomArgs<'a>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize)]
struct CustomArgs<'a> {
    message_id: &'a str,
    subscriber_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiErrors {
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(default)]
    field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageActivity {
    status: String,
    #[serde(default)]
    to_email: Option<String>,
}

impl EmailProvider {
    pub fn new(config: EmailConfig) -> Result<Self, ProviderError> {
        let client = http_client(config.timeout_ms)?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn error_from(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        let Ok(parsed) = serde_json::from_str::<ApiErrors>(&body) else {
            return ProviderError::from_status(status, body);
        };

        let message = parsed
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        let bad_recipient = parsed.errors.iter().any(|e| {
            e.field
                .as_deref()
                .is_some_and(|f| f.starts_with("personalizations"))
                && e.message.to_lowercase().contains("valid")
        });

        if bad_recipient {
            ProviderError::InvalidRecipient(message)
        } else {
            ProviderError::from_status(status, message)
        }
    }
}

fn activity_state(status: &str) -> DeliveryState {
    match status {
        "delivered" => DeliveryState::Delivered,
        "not_delivered" | "dropped" => DeliveryState::Failed,
        "bounced" => DeliveryState::Bounced,
        "spamreport" => DeliveryState::Spam,
        _ => DeliveryState::Sent,
    }
}

#[async_trait]
impl ProviderClient for EmailProvider {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn initialize(&self) -> Result<(), ProviderError> {
        if self.config.api_key.trim().is_empty() {
            return Err(ProviderError::Config("email api key is not set".to_string()));
        }
        validate_email_address(&self.config.from_address)
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        if !self.health_check().await? {
            return Err(ProviderError::Config(
                "email provider rejected the configured credentials".to_string(),
            ));
        }

        info!(from = %self.config.from_address, "Email provider initialized");
        Ok(())
    }

    async fn send(
        &self,
        message: &RenderedMessage,
        recipients: &[String],
    ) -> Result<ProviderReceipt, ProviderError> {
        let mut content = Vec::with_capacity(2);
        if !message.text_body.is_empty() {
            content.push(Content {
                content_type: "text/plain",
                value: &message.text_body,
            });
        }
        if !message.html_body.is_empty() {
            content.push(Content {
                content_type: "text/html",
                value: &message.html_body,
            });
        }

        let request = MailRequest {
            personalizations: recipients
                .iter()
                .map(|r| Personalization {
                    to: vec![Address {
                        email: r,
                        name: None,
                    }],
                })
                .collect(),
            from: Address {
                email: &self.config.from_address,
                name: Some(&self.config.from_name),
            },
            subject: &message.subject,
            content,
            custom_args: CustomArgs {
                message_id: &message.message_id,
                subscriber_id: &message.subscriber_id,
            },
        };

        debug!(
            message_id = %message.message_id,
            recipients = recipients.len(),
            subject = %message.subject,
            "Sending email"
        );

        let response = self
            .client
            .post(self.url("mail/send"))
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, self.config.timeout_ms))?;

        if !response.status().is_success() {
            let error = Self::error_from(response).await;
            warn!(message_id = %message.message_id, error = %error, "Email provider rejected request");
            return Err(error);
        }

        let provider_message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| message.message_id.clone());

        info!(
            message_id = %message.message_id,
            provider_message_id = %provider_message_id,
            "Email accepted by provider"
        );

        Ok(ProviderReceipt::accepted(provider_message_id))
    }

    async fn get_delivery_status(
        &self,
        provider_message_id: &str,
    ) -> Result<DeliveryReport, ProviderError> {
        let response = self
            .client
            .get(self.url(&format!("messages/{}", provider_message_id)))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, self.config.timeout_ms))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let activity: MessageActivity = response
            .json()
            .await
            .map_err(|e| ProviderError::UnexpectedResponse(e.to_string()))?;

        let status = activity_state(&activity.status);
        Ok(DeliveryReport {
            provider_message_id: provider_message_id.to_string(),
            recipient: activity.to_email,
            status,
            error: status
                .is_failure()
                .then(|| format!("provider reported {}", activity.status)),
        })
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let response = self
            .client
            .get(self.url("scopes"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, self.config.timeout_ms))?;

        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_state_mapping() {
        assert_eq!(activity_state("delivered"), DeliveryState::Delivered);
        assert_eq!(activity_state("not_delivered"), DeliveryState::Failed);
        assert_eq!(activity_state("bounced"), DeliveryState::Bounced);
        assert_eq!(activity_state("processing"), DeliveryState::Sent);
    }
}
