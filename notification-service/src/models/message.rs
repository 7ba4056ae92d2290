use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::request::{Channel, NotificationRequest, Priority};

/// Output of rendering a request against its template. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub message_id: String,
    pub subscriber_id: String,
    pub correlation_id: Option<String>,
    pub event_type: String,
    pub template_id: String,
    pub priority: Priority,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

impl RenderedMessage {
    pub fn new(
        request: &NotificationRequest,
        template_id: impl Into<String>,
        subject: String,
        html_body: String,
        text_body: String,
    ) -> Self {
        Self {
            message_id: request.message_id.clone(),
            subscriber_id: request.subscriber_id.clone(),
            correlation_id: request.correlation_id.clone(),
            event_type: request.event_type.clone(),
            template_id: template_id.into(),
            priority: request.priority,
            subject,
            html_body,
            text_body,
        }
    }
}

/// Payload routed to the dead-letter queue.
///
/// Either the decoded request or, when the payload could not be decoded, the raw body is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub channel: Channel,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message: Option<NotificationRequest>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,

    pub failure_reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DlqMessage {
    pub fn for_request(
        channel: Channel,
        request: &NotificationRequest,
        failure_reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            channel,
            original_message: Some(request.clone()),
            raw_payload: None,
            failure_reason: failure_reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }

    pub fn for_payload(channel: Channel, payload: &[u8], failure_reason: impl Into<String>) -> Self {
        Self {
            channel,
            original_message: None,
            raw_payload: Some(String::from_utf8_lossy(payload).into_owned()),
            failure_reason: failure_reason.into(),
            attempts: 0,
            failed_at: Utc::now(),
        }
    }
}
