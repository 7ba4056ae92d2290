use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::request::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Failed,
    Bounced,
    Spam,
}

impl DeliveryState {
    /// Terminal states are never overwritten once recorded.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered
                | DeliveryState::Failed
                | DeliveryState::Bounced
                | DeliveryState::Spam
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DeliveryState::Failed | DeliveryState::Bounced | DeliveryState::Spam
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(DeliveryState::Pending),
            "sent" => Some(DeliveryState::Sent),
            "delivered" => Some(DeliveryState::Delivered),
            "failed" => Some(DeliveryState::Failed),
            "bounced" => Some(DeliveryState::Bounced),
            "spam" => Some(DeliveryState::Spam),
            _ => None,
        }
    }
}

impl Display for DeliveryState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            DeliveryState::Pending => write!(f, "pending"),
            DeliveryState::Sent => write!(f, "sent"),
            DeliveryState::Delivered => write!(f, "delivered"),
            DeliveryState::Failed => write!(f, "failed"),
            DeliveryState::Bounced => write!(f, "bounced"),
            DeliveryState::Spam => write!(f, "spam"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientStatus {
    pub recipient: String,
    pub status: DeliveryState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,

    /// Provider id of the request that carried this recipient, when it differs per recipient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
}

impl RecipientStatus {
    pub fn pending(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            status: DeliveryState::Pending,
            error: None,
            delivered_at: None,
            provider_message_id: None,
        }
    }

    /// Applies a state change unless this recipient already reached a terminal state.
    pub fn apply(&mut self, state: DeliveryState, error: Option<String>, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = state;
        if error.is_some() {
            self.error = error;
        }
        if state == DeliveryState::Delivered {
            self.delivered_at = Some(at);
        }
        true
    }
}

/// Lifecycle record of one message fanned out to its recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStatus {
    pub message_id: String,
    pub subscriber_id: String,
    pub channel: Channel,
    pub event_type: String,
    pub status: DeliveryState,
    pub recipients: Vec<RecipientStatus>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl DeliveryStatus {
    /// Creates a pending record. Repeated addresses collapse into one entry, first one wins.
    pub fn new(
        message_id: impl Into<String>,
        subscriber_id: impl Into<String>,
        channel: Channel,
        event_type: impl Into<String>,
        recipients: &[String],
    ) -> Self {
        Self {
            message_id: message_id.into(),
            subscriber_id: subscriber_id.into(),
            channel,
            event_type: event_type.into(),
            status: DeliveryState::Pending,
            recipients: unique_recipients(recipients)
                .into_iter()
                .map(RecipientStatus::pending)
                .collect(),
            attempt_count: 0,
            last_attempt_at: None,
            delivered_at: None,
            error: None,
            next_retry_at: None,
            provider_message_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn recipient_mut(&mut self, recipient: &str) -> Option<&mut RecipientStatus> {
        self.recipients.iter_mut().find(|r| r.recipient == recipient)
    }

    /// Recipients no provider has accepted yet.
    pub fn pending_recipients(&self) -> Vec<String> {
        self.recipients
            .iter()
            .filter(|r| r.status == DeliveryState::Pending)
            .map(|r| r.recipient.clone())
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.recipients
            .iter()
            .any(|r| r.status == DeliveryState::Pending)
    }

    /// Distinct provider ids of recipients still awaiting confirmation.
    pub fn awaiting_confirmation(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for recipient in self.recipients.iter().filter(|r| r.status == DeliveryState::Sent) {
            let id = recipient
                .provider_message_id
                .as_ref()
                .or(self.provider_message_id.as_ref());
            if let Some(id) = id {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }

    /// Moves the overall state to `state`, cascading to every non-terminal recipient.
    pub fn transition(&mut self, state: DeliveryState, error: Option<String>) -> bool {
        if self.is_terminal() {
            return false;
        }

        let now = Utc::now();
        for recipient in self.recipients.iter_mut() {
            recipient.apply(state, error.clone(), now);
        }

        self.status = state;
        if error.is_some() {
            self.error = error;
        }
        if state == DeliveryState::Delivered {
            self.delivered_at = Some(now);
        }
        if state.is_terminal() {
            self.next_retry_at = None;
        }
        self.updated_at = now;
        true
    }

    /// Recomputes the overall state from the recipient entries.
    ///
    /// The overall state only becomes terminal once every recipient is terminal;
    /// any delivered recipient makes the message delivered.
    pub fn roll_up(&mut self) {
        if self.is_terminal() || self.recipients.is_empty() {
            return;
        }
        if self.recipients.iter().any(|r| !r.status.is_terminal()) {
            if self
                .recipients
                .iter()
                .any(|r| r.status == DeliveryState::Sent)
            {
                self.status = DeliveryState::Sent;
            }
            return;
        }

        let now = Utc::now();
        if let Some(delivered) = self
            .recipients
            .iter()
            .filter_map(|r| r.delivered_at.filter(|_| r.status == DeliveryState::Delivered))
            .max()
        {
            self.status = DeliveryState::Delivered;
            self.delivered_at = Some(delivered);
        } else {
            self.status = self.recipients[0].status;
            if self.error.is_none() {
                self.error = self.recipients.iter().find_map(|r| r.error.clone());
            }
        }
        self.next_retry_at = None;
        self.updated_at = now;
    }
}

fn unique_recipients(recipients: &[String]) -> Vec<&String> {
    let mut seen = HashSet::new();
    recipients
        .iter()
        .filter(|r| seen.insert(r.as_str()))
        .collect()
}
