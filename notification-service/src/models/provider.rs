use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::status::DeliveryState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderOutcome {
    Accepted,
    /// The provider confirmed delivery synchronously.
    Delivered,
    Rejected,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientRejection {
    pub recipient: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderReceipt {
    pub provider_message_id: String,
    pub outcome: ProviderOutcome,

    #[serde(default)]
    pub rejected: Vec<RecipientRejection>,

    /// Per-recipient ids for providers that issue one id per destination.
    /// Recipients not listed share `provider_message_id`.
    #[serde(default)]
    pub recipient_ids: HashMap<String, String>,
}

impl ProviderReceipt {
    pub fn accepted(provider_message_id: impl Into<String>) -> Self {
        Self {
            provider_message_id: provider_message_id.into(),
            outcome: ProviderOutcome::Accepted,
            rejected: Vec::new(),
            recipient_ids: HashMap::new(),
        }
    }

    pub fn with_outcome(mut self, outcome: ProviderOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_recipient_id(
        mut self,
        recipient: impl Into<String>,
        provider_message_id: impl Into<String>,
    ) -> Self {
        self.recipient_ids
            .insert(recipient.into(), provider_message_id.into());
        self
    }

    pub fn provider_id_for(&self, recipient: &str) -> &str {
        self.recipient_ids
            .get(recipient)
            .map(String::as_str)
            .unwrap_or(&self.provider_message_id)
    }

    pub fn rejection_for(&self, recipient: &str) -> Option<&RecipientRejection> {
        self.rejected.iter().find(|r| r.recipient == recipient)
    }

    /// Folds a receipt for a later batch of the same message into this one.
    pub fn merge(mut self, other: ProviderReceipt, recipients: &[String]) -> Self {
        for recipient in recipients {
            if other.rejection_for(recipient).is_none() {
                let id = other.provider_id_for(recipient).to_string();
                self.recipient_ids.insert(recipient.clone(), id);
            }
        }
        if other.outcome != ProviderOutcome::Delivered {
            self.outcome = other.outcome;
        }
        self.rejected.extend(other.rejected);
        self
    }

    pub fn with_rejection(mut self, recipient: impl Into<String>, reason: impl Into<String>) -> Self {
        self.rejected.push(RecipientRejection {
            recipient: recipient.into(),
            reason: reason.into(),
        });
        self
    }
}

/// Asynchronous delivery confirmation, either polled or pushed by a provider callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub provider_message_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    pub status: DeliveryState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_every_provider_id() {
        let first = ProviderReceipt::accepted("SM1");
        let second = ProviderReceipt::accepted("SM2");
        let third = ProviderReceipt::accepted("SM3").with_rejection("+15550004444", "blocked");

        let merged = first
            .merge(second, &["+15550003333".to_string()])
            .merge(third, &["+15550004444".to_string()]);

        assert_eq!(merged.provider_message_id, "SM1");
        assert_eq!(merged.provider_id_for("+15550002222"), "SM1");
        assert_eq!(merged.provider_id_for("+15550003333"), "SM2");
        assert!(!merged.recipient_ids.contains_key("+15550004444"));
        assert_eq!(merged.rejected.len(), 1);
    }

    #[test]
    fn test_merge_downgrades_synchronous_outcome() {
        let delivered = ProviderReceipt::accepted("c1").with_outcome(ProviderOutcome::Delivered);
        let merged = delivered
            .clone()
            .merge(delivered.clone(), &["#dev".to_string()]);
        assert_eq!(merged.outcome, ProviderOutcome::Delivered);

        let merged = delivered.merge(ProviderReceipt::accepted("c2"), &["#ops".to_string()]);
        assert_eq!(merged.outcome, ProviderOutcome::Accepted);
    }
}
