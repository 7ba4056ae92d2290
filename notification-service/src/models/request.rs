use std::{
    collections::HashMap,
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Sms,
    Chat,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Email, Channel::Sms, Channel::Chat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Chat => "chat",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "chat" => Ok(Channel::Chat),
            other => Err(ValidationError::UnknownChannel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Accent color used by the rich templates.
    pub fn color(&self) -> &'static str {
        match self {
            Priority::Low => "#6b7280",
            Priority::Medium => "#2563eb",
            Priority::High => "#f59e0b",
            Priority::Urgent => "#dc2626",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Priority::Low => "ℹ️",
            Priority::Medium => "📋",
            Priority::High => "⚠️",
            Priority::Urgent => "🚨",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

fn default_schedule() -> String {
    "immediate".to_string()
}

/// A unit of work consumed from a channel queue.
///
/// `message_id` is assigned by the producer and stays stable across redeliveries,
/// so it doubles as the idempotency key for the delivery record. Every other field
/// deserializes leniently and is checked by [`NotificationRequest::validate`], so a
/// malformed request with an id still gets a failed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub message_id: String,

    #[serde(default)]
    pub subscriber_id: String,

    #[serde(default)]
    pub event_type: String,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default)]
    pub event_data: Option<HashMap<String, serde_json::Value>>,

    #[serde(default = "default_schedule")]
    pub schedule: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl NotificationRequest {
    pub fn new(
        message_id: impl Into<String>,
        subscriber_id: impl Into<String>,
        event_type: impl Into<String>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            subscriber_id: subscriber_id.into(),
            event_type: event_type.into(),
            priority: Priority::default(),
            recipients,
            event_data: Some(HashMap::new()),
            schedule: default_schedule(),
            created_at: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_event_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.event_data
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message_id.trim().is_empty() {
            return Err(ValidationError::MissingField("message_id"));
        }
        if self.subscriber_id.trim().is_empty() {
            return Err(ValidationError::MissingField("subscriber_id"));
        }
        if self.event_type.trim().is_empty() {
            return Err(ValidationError::MissingField("event_type"));
        }
        if self.recipients.iter().all(|r| r.trim().is_empty()) {
            return Err(ValidationError::NoRecipients);
        }
        if self.event_data.is_none() {
            return Err(ValidationError::MissingField("event_data"));
        }

        Ok(())
    }

    /// Correlation id used for tracing; falls back to the message id.
    pub fn trace_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> NotificationRequest {
        NotificationRequest::new(
            "msg-1",
            "sub-1",
            "inquiry-business",
            vec!["a@example.com".to_string()],
        )
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn test_missing_mandatory_fields_are_rejected() {
        let mut missing_subscriber = request();
        missing_subscriber.subscriber_id = String::new();
        assert_eq!(
            missing_subscriber.validate(),
            Err(ValidationError::MissingField("subscriber_id"))
        );

        let mut missing_event = request();
        missing_event.event_type = "  ".to_string();
        assert_eq!(
            missing_event.validate(),
            Err(ValidationError::MissingField("event_type"))
        );

        let mut no_recipients = request();
        no_recipients.recipients.clear();
        assert_eq!(no_recipients.validate(), Err(ValidationError::NoRecipients));

        let mut null_data = request();
        null_data.event_data = None;
        assert_eq!(
            null_data.validate(),
            Err(ValidationError::MissingField("event_data"))
        );
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let payload = json!({
            "message_id": "m",
            "subscriber_id": "s",
            "event_type": "news-published",
            "recipients": ["x@example.com"],
            "event_data": {"title": "Hello"},
            "created_at": "2025-01-01T00:00:00Z"
        });

        let request: NotificationRequest = serde_json::from_value(payload).unwrap();
        assert_eq!(request.priority, Priority::Medium);
        assert_eq!(request.schedule, "immediate");
        assert_eq!(request.trace_id(), "m");
    }

    #[test]
    fn test_missing_fields_deserialize_then_fail_validation() {
        let payload = json!({
            "message_id": "m",
            "recipients": ["x@example.com"],
            "event_data": {}
        });

        let request: NotificationRequest = serde_json::from_value(payload).unwrap();
        assert_eq!(
            request.validate(),
            Err(ValidationError::MissingField("subscriber_id"))
        );
    }

    #[test]
    fn test_unknown_priority_is_rejected() {
        let payload = json!({
            "message_id": "m",
            "subscriber_id": "s",
            "event_type": "news-published",
            "priority": "critical",
            "recipients": ["x@example.com"],
            "event_data": {},
            "created_at": "2025-01-01T00:00:00Z"
        });

        assert!(serde_json::from_value::<NotificationRequest>(payload).is_err());
    }
}
