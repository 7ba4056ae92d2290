use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::status::DeliveryState;

/// Record emitted for every terminal outcome; the sink lives outside the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub subscriber_id: String,
    pub trace_id: String,
    pub status: DeliveryState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<JsonValue>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<JsonValue>,

    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        entity_id: String,
        operation: &str,
        subscriber_id: String,
        trace_id: String,
        status: DeliveryState,
    ) -> Self {
        Self {
            entity_type: "notification".to_string(),
            entity_id,
            operation: operation.to_string(),
            subscriber_id,
            trace_id,
            status,
            error_message: None,
            before: None,
            after: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error_message = Some(error);
        self
    }

    pub fn with_snapshots(mut self, before: Option<JsonValue>, after: Option<JsonValue>) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}
