//! Failure classification: decides whether a dispatch error is worth retrying.

use tracing::debug;

use crate::{
    error::{ErrorCategory, ProviderError},
    models::status::DeliveryState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Retry-eligible, subject to the retry budget and allow-list.
    Transient(ErrorCategory),
    /// Never retried; the message is finalised with the given terminal state.
    Permanent(DeliveryState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRule {
    pub pattern: String,
    pub outcome: DeliveryState,
}

/// Ordered table of error signatures that mark a failure as permanent.
///
/// Matching is a case-insensitive substring search; the first matching rule wins.
/// Anything unmatched is transient.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<FailureRule>,
}

const DEFAULT_RULES: &[(&str, DeliveryState)] = &[
    ("invalid email address", DeliveryState::Failed),
    ("invalid phone number", DeliveryState::Failed),
    ("invalid chat destination", DeliveryState::Failed),
    ("invalid address", DeliveryState::Failed),
    ("invalid recipient", DeliveryState::Failed),
    ("recipient blocked", DeliveryState::Failed),
    ("unsubscribed", DeliveryState::Failed),
    ("domain not found", DeliveryState::Bounced),
    ("mailbox does not exist", DeliveryState::Bounced),
    ("user unknown", DeliveryState::Bounced),
    ("hard bounce", DeliveryState::Bounced),
    ("marked as spam", DeliveryState::Spam),
    ("spam complaint", DeliveryState::Spam),
];

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES
                .iter()
                .map(|(pattern, outcome)| FailureRule {
                    pattern: pattern.to_string(),
                    outcome: *outcome,
                })
                .collect(),
        }
    }
}

impl FailureClassifier {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Default table extended with extra patterns, each finalising as `failed`.
    pub fn with_patterns(extra: &[String]) -> Self {
        extra
            .iter()
            .filter(|p| !p.trim().is_empty())
            .fold(Self::default(), |classifier, pattern| {
                classifier.with_rule(pattern.trim(), DeliveryState::Failed)
            })
    }

    pub fn with_rule(mut self, pattern: impl Into<String>, outcome: DeliveryState) -> Self {
        self.rules.push(FailureRule {
            pattern: pattern.into().to_lowercase(),
            outcome,
        });
        self
    }

    pub fn rules(&self) -> &[FailureRule] {
        &self.rules
    }

    /// Classifies a free-form provider error message.
    pub fn classify_message(&self, message: &str) -> Option<DeliveryState> {
        let message = message.to_lowercase();
        self.rules
            .iter()
            .find(|rule| message.contains(&rule.pattern))
            .map(|rule| rule.outcome)
    }

    pub fn classify(&self, error: &ProviderError) -> Failure {
        let failure = match error {
            ProviderError::InvalidRecipient(_) => Failure::Permanent(
                self.classify_message(&error.to_string())
                    .unwrap_or(DeliveryState::Failed),
            ),
            _ => match self.classify_message(&error.to_string()) {
                Some(state) => Failure::Permanent(state),
                None => Failure::Transient(error.category()),
            },
        };

        debug!(error = %error, ?failure, "Classified dispatch failure");
        failure
    }
}
