//! Per-channel delivery orchestration: validate, render, dispatch, classify, record.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::{Map, Value, json};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        providers::ProviderClient,
        queue::QueueProducer,
        rate_limiter::RateLimiter,
        template::{TemplateRenderer, resolve_route},
    },
    config::Config,
    error::{ErrorCategory, PipelineError, ProviderError, ValidationError},
    metrics::PipelineMetrics,
    models::{
        audit::AuditEvent,
        message::{DlqMessage, RenderedMessage},
        provider::{DeliveryReport, ProviderOutcome, ProviderReceipt, RecipientRejection},
        request::{Channel, NotificationRequest},
        retry::RetryConfig,
        status::{DeliveryState, DeliveryStatus},
        validation::validate_recipient,
    },
    policy::{Failure, FailureClassifier},
    tracker::{AttemptStart, DeliveryTracker, RecipientUpdate, StatusChange},
};

/// What happened to a delivery. Every variant means the queue message can be acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Provider accepted the message; carries the rolled-up record state.
    Dispatched(DeliveryState),
    RetryScheduled { attempt: u32, delay: Duration },
    DeadLettered(DeliveryState),
    /// Already sent or finalised by an earlier delivery of the same message.
    Duplicate(DeliveryState),
}

/// What reached the provider before a dispatch stopped.
#[derive(Debug, Default)]
struct Progress {
    receipt: Option<ProviderReceipt>,
    rejected: Vec<RecipientRejection>,
    covered: Vec<String>,
}

struct DispatchFailure {
    error: ProviderError,
    progress: Progress,
}

pub struct ChannelHandler {
    channel: Channel,
    provider: Arc<dyn ProviderClient>,
    renderer: Arc<TemplateRenderer>,
    tracker: DeliveryTracker,
    producer: Arc<dyn QueueProducer>,
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    classifier: FailureClassifier,
    retry: RetryConfig,
    dispatch_timeout: Duration,
    metrics: PipelineMetrics,
}

impl ChannelHandler {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        renderer: Arc<TemplateRenderer>,
        tracker: DeliveryTracker,
        producer: Arc<dyn QueueProducer>,
        config: &Config,
    ) -> Self {
        let channel = provider.channel();

        Self {
            channel,
            breaker: Arc::new(CircuitBreaker::new(
                channel.as_str(),
                config.circuit_breaker.clone(),
            )),
            limiter: RateLimiter::new(channel, &config.rate_limit),
            classifier: FailureClassifier::with_patterns(&config.failure_policy.permanent_patterns),
            retry: config.retry.clone(),
            dispatch_timeout: config.workers.dispatch_timeout(),
            metrics: PipelineMetrics::new(channel),
            provider,
            renderer,
            tracker,
            producer,
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    /// Decodes a raw queue payload and handles it. Undecodable payloads are dead-lettered as-is.
    pub async fn handle_delivery(&self, payload: &[u8]) -> Result<Disposition, PipelineError> {
        match serde_json::from_slice::<NotificationRequest>(payload) {
            Ok(request) => self.handle(&request).await,
            Err(e) => {
                let reason = ValidationError::MalformedPayload(e.to_string()).to_string();
                warn!(channel = %self.channel, error = %reason, "Dead-lettering undecodable payload");

                self.producer
                    .publish_dead_letter(&DlqMessage::for_payload(self.channel, payload, &reason))
                    .await
                    .map_err(|e| PipelineError::Queue(e.to_string()))?;

                self.metrics.dead_lettered();
                Ok(Disposition::DeadLettered(DeliveryState::Failed))
            }
        }
    }

    #[instrument(skip_all, fields(channel = %self.channel, message_id = %request.message_id, trace_id = %request.trace_id()))]
    pub async fn handle(&self, request: &NotificationRequest) -> Result<Disposition, PipelineError> {
        self.metrics.received();

        if let Err(e) = request.validate() {
            return self.reject_invalid(request, e).await;
        }

        let status = match self.tracker.start_attempt(request, self.channel).await? {
            AttemptStart::Skip(existing) => {
                info!(status = %existing.status, "Message already handled, skipping");
                self.metrics.duplicate_skipped();
                return Ok(Disposition::Duplicate(existing.status));
            }
            AttemptStart::Proceed(status) => status,
        };
        let attempt = status.attempt_count;
        debug!(attempt, "Processing notification");

        let recipients = match self.partition_recipients(&status).await? {
            Ok(recipients) => recipients,
            Err(reason) => {
                return self
                    .dead_letter(request, attempt, DeliveryState::Failed, reason)
                    .await;
            }
        };

        let message = match self.render(request) {
            Ok(message) => message,
            Err(e) if e.is_permanent() => {
                error!(error = %e, "Template rendering failed");
                return self
                    .dead_letter(request, attempt, DeliveryState::Failed, e.to_string())
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "Template rendering temporarily unavailable");
                return self
                    .retry_or_dead_letter(request, attempt, ErrorCategory::Internal, e.to_string())
                    .await;
            }
        };

        let started = Instant::now();
        match self.dispatch(&message, &recipients).await {
            Ok(receipt) => {
                self.metrics.dispatched(self.provider.name(), started.elapsed());
                self.record_receipt(request, attempt, &recipients, receipt).await
            }
            Err(DispatchFailure { error: e, progress }) => {
                if !progress.covered.is_empty() {
                    // recipients already accepted must not be sent again on retry
                    self.record_dispatch(
                        request,
                        &progress.covered,
                        progress.receipt.as_ref(),
                        &progress.rejected,
                    )
                    .await?;
                }

                let category = e.category();
                self.metrics.dispatch_failed(category.as_str());

                match self.classifier.classify(&e) {
                    Failure::Permanent(state) => {
                        warn!(error = %e, %state, "Permanent dispatch failure");
                        self.dead_letter(request, attempt, state, e.to_string())
                            .await
                    }
                    Failure::Transient(category) => {
                        warn!(error = %e, category = category.as_str(), attempt, "Transient dispatch failure");
                        self.retry_or_dead_letter(request, attempt, category, e.to_string())
                            .await
                    }
                }
            }
        }
    }

    /// Polls the provider for every request of a record still awaiting confirmation.
    pub async fn poll_delivery_status(
        &self,
        message_id: &str,
    ) -> Result<Option<StatusChange>, PipelineError> {
        let Some(status) = self.tracker.get_delivery_status(message_id).await? else {
            return Ok(None);
        };
        if status.is_terminal() {
            return Ok(None);
        }

        let mut latest = None;
        for provider_message_id in status.awaiting_confirmation() {
            let report = self
                .provider
                .get_delivery_status(&provider_message_id)
                .await?;
            debug!(message_id, %provider_message_id, status = %report.status, "Polled delivery status");

            if let Some(change) = self.apply_report(&report).await? {
                latest = Some(change);
            }
        }

        Ok(latest)
    }

    /// Applies a provider report, pushed or polled, and audits terminal outcomes.
    pub async fn apply_report(
        &self,
        report: &DeliveryReport,
    ) -> Result<Option<StatusChange>, PipelineError> {
        let change = self.tracker.apply_report(self.channel, report).await?;

        if let Some(change) = &change {
            if change.reached_terminal() {
                self.metrics.terminal(change.after.status);
                self.audit(change, &change.after.message_id).await;
            }
        }

        Ok(change)
    }

    /// Marks invalid addresses failed. Returns the deliverable remainder, or the reason none is left.
    async fn partition_recipients(
        &self,
        status: &DeliveryStatus,
    ) -> Result<Result<Vec<String>, String>, PipelineError> {
        let mut valid = Vec::new();
        let mut rejected = Vec::new();

        for recipient in status.pending_recipients() {
            match validate_recipient(self.channel, &recipient) {
                Ok(()) => valid.push(recipient),
                Err(e) => {
                    warn!(recipient = %recipient, error = %e, "Skipping invalid recipient");
                    rejected.push(RecipientUpdate::new(
                        recipient,
                        DeliveryState::Failed,
                        Some(e.to_string()),
                    ));
                }
            }
        }

        if valid.is_empty() {
            let reason = rejected
                .first()
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| ValidationError::NoRecipients.to_string());
            return Ok(Err(reason));
        }

        if !rejected.is_empty() {
            self.tracker
                .update_recipients(&status.message_id, &rejected, None)
                .await?;
        }

        Ok(Ok(valid))
    }

    fn render(&self, request: &NotificationRequest) -> Result<RenderedMessage, crate::error::RenderError> {
        let route = resolve_route(&request.event_type);
        let rendered = self
            .renderer
            .render(route.template_id, &template_context(request))?;

        Ok(RenderedMessage::new(
            request,
            route.template_id,
            rendered.subject,
            rendered.html,
            rendered.text,
        ))
    }

    /// Sends in provider-sized batches. Each batch takes its own rate-limit permit and timeout.
    ///
    /// A batch refused outright is recorded against its recipients when the list was split;
    /// any other error stops the dispatch and reports what was already accepted.
    async fn dispatch(
        &self,
        message: &RenderedMessage,
        recipients: &[String],
    ) -> Result<ProviderReceipt, DispatchFailure> {
        let batch = self
            .provider
            .max_batch()
            .unwrap_or(recipients.len())
            .max(1);
        let split = batch < recipients.len();

        let mut progress = Progress::default();
        let mut first_rejection = None;

        for chunk in recipients.chunks(batch) {
            match self.send_batch(message, chunk).await {
                Ok(receipt) => {
                    progress.receipt = Some(match progress.receipt.take() {
                        Some(merged) => merged.merge(receipt, chunk),
                        None => receipt,
                    });
                }
                Err(error @ (ProviderError::InvalidRecipient(_) | ProviderError::Rejected { .. }))
                    if split =>
                {
                    warn!(recipients = ?chunk, error = %error, "Provider refused batch");
                    progress
                        .rejected
                        .extend(chunk.iter().map(|recipient| RecipientRejection {
                            recipient: recipient.clone(),
                            reason: error.to_string(),
                        }));
                    if first_rejection.is_none() {
                        first_rejection = Some(error);
                    }
                }
                Err(error) => return Err(DispatchFailure { error, progress }),
            }
            progress.covered.extend_from_slice(chunk);
        }

        match progress.receipt {
            Some(receipt) => Ok(progress
                .rejected
                .into_iter()
                .fold(receipt, |r, rejection| {
                    r.with_rejection(rejection.recipient, rejection.reason)
                })),
            None => Err(DispatchFailure {
                error: first_rejection
                    .unwrap_or_else(|| ProviderError::InvalidRecipient("no recipients".to_string())),
                progress: Progress::default(),
            }),
        }
    }

    async fn send_batch(
        &self,
        message: &RenderedMessage,
        recipients: &[String],
    ) -> Result<ProviderReceipt, ProviderError> {
        self.limiter.acquire().await;

        let timeout_ms = self.dispatch_timeout.as_millis() as u64;
        let result = self
            .breaker
            .call(|| async {
                timeout(self.dispatch_timeout, self.provider.send(message, recipients))
                    .await
                    .unwrap_or(Err(ProviderError::Timeout(timeout_ms)))
            })
            .await;

        self.metrics.circuit_state(self.breaker.state());
        result
    }

    /// Maps a dispatch onto recipient updates.
    ///
    /// Rejections with a known permanent cause finalise their recipient. Others stay pending
    /// and their first reason is returned, so the retry budget decides them.
    fn recipient_updates(
        &self,
        recipients: &[String],
        receipt: Option<&ProviderReceipt>,
        rejected: &[RecipientRejection],
    ) -> (Vec<RecipientUpdate>, Option<String>) {
        let accepted_state = match receipt.map(|r| r.outcome) {
            Some(ProviderOutcome::Delivered) => DeliveryState::Delivered,
            _ => DeliveryState::Sent,
        };
        let mut retryable = None;

        let updates = recipients
            .iter()
            .filter_map(|recipient| {
                let rejection = rejected
                    .iter()
                    .find(|r| &r.recipient == recipient)
                    .or_else(|| receipt.and_then(|r| r.rejection_for(recipient)));

                match (rejection, receipt) {
                    (Some(rejection), _) => {
                        let reason = Some(rejection.reason.clone());
                        match self.classifier.classify_message(&rejection.reason) {
                            Some(state) => Some(RecipientUpdate::new(recipient, state, reason)),
                            None => {
                                if retryable.is_none() {
                                    retryable = Some(rejection.reason.clone());
                                }
                                Some(RecipientUpdate::new(recipient, DeliveryState::Pending, reason))
                            }
                        }
                    }
                    (None, Some(receipt)) => Some(
                        RecipientUpdate::new(recipient, accepted_state, None)
                            .with_provider_id(receipt.provider_id_for(recipient)),
                    ),
                    (None, None) => None,
                }
            })
            .collect();

        (updates, retryable)
    }

    /// Writes what the provider did with `recipients` and audits the change.
    async fn record_dispatch(
        &self,
        request: &NotificationRequest,
        recipients: &[String],
        receipt: Option<&ProviderReceipt>,
        rejected: &[RecipientRejection],
    ) -> Result<(Option<StatusChange>, Option<String>), PipelineError> {
        let (updates, retryable) = self.recipient_updates(recipients, receipt, rejected);
        if updates.is_empty() {
            return Ok((None, retryable));
        }

        let change = self
            .tracker
            .update_recipients(
                &request.message_id,
                &updates,
                receipt.map(|r| r.provider_message_id.as_str()),
            )
            .await?;

        if let Some(change) = &change {
            if change.reached_terminal() {
                self.metrics.terminal(change.after.status);
            }
            self.audit(change, request.trace_id()).await;
        }

        Ok((change, retryable))
    }

    async fn record_receipt(
        &self,
        request: &NotificationRequest,
        attempt: u32,
        recipients: &[String],
        receipt: ProviderReceipt,
    ) -> Result<Disposition, PipelineError> {
        let (change, retryable) = self
            .record_dispatch(request, recipients, Some(&receipt), &[])
            .await?;

        let Some(change) = change else {
            let current = self
                .tracker
                .get_delivery_status(&request.message_id)
                .await?
                .map(|s| s.status)
                .unwrap_or(DeliveryState::Sent);
            return Ok(Disposition::Duplicate(current));
        };

        info!(
            provider_message_id = %receipt.provider_message_id,
            status = %change.after.status,
            rejected = receipt.rejected.len(),
            "Notification dispatched"
        );

        if let Some(reason) = retryable {
            warn!(reason = %reason, "Provider refused some recipients without a permanent cause");
            return self
                .retry_or_dead_letter(request, attempt, ErrorCategory::Rejected, reason)
                .await;
        }

        Ok(Disposition::Dispatched(change.after.status))
    }

    async fn retry_or_dead_letter(
        &self,
        request: &NotificationRequest,
        attempt: u32,
        category: ErrorCategory,
        reason: String,
    ) -> Result<Disposition, PipelineError> {
        if !self.retry.should_retry(category, attempt) {
            let reason = if self.retry.is_retryable(category) {
                format!("Retries exhausted after {} attempts: {}", attempt, reason)
            } else {
                reason
            };
            return self
                .dead_letter(request, attempt, DeliveryState::Failed, reason)
                .await;
        }

        let delay = self.retry.delay_for_retry(attempt.saturating_sub(1));
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        if !self
            .tracker
            .schedule_retry(&request.message_id, retry_at, Some(reason))
            .await?
        {
            let current = self
                .tracker
                .get_delivery_status(&request.message_id)
                .await?
                .map(|s| s.status)
                .unwrap_or(DeliveryState::Failed);
            return Ok(Disposition::Duplicate(current));
        }

        self.producer
            .publish_retry(self.channel, request, delay)
            .await
            .map_err(|e| PipelineError::Queue(e.to_string()))?;

        self.metrics.retried();
        info!(attempt, delay_ms = delay.as_millis() as u64, "Retry scheduled");

        Ok(Disposition::RetryScheduled { attempt, delay })
    }

    /// Dead-letter first, then finalise the pending recipients, so a crash in between only
    /// causes a redelivery and never a terminal record without its dead letter. Recipients
    /// the provider already accepted keep waiting for their reports.
    async fn dead_letter(
        &self,
        request: &NotificationRequest,
        attempts: u32,
        state: DeliveryState,
        reason: String,
    ) -> Result<Disposition, PipelineError> {
        self.producer
            .publish_dead_letter(&DlqMessage::for_request(self.channel, request, &reason, attempts))
            .await
            .map_err(|e| PipelineError::Queue(e.to_string()))?;

        let change = self
            .tracker
            .fail_pending(&request.message_id, state, Some(reason.clone()))
            .await?;

        self.metrics.dead_lettered();
        warn!(%state, attempts, reason = %reason, "Notification dead-lettered");

        if let Some(change) = change {
            if change.reached_terminal() {
                self.metrics.terminal(change.after.status);
            }
            self.audit(&change, request.trace_id()).await;
        }

        Ok(Disposition::DeadLettered(state))
    }

    /// Requests that fail validation never reach the provider.
    async fn reject_invalid(
        &self,
        request: &NotificationRequest,
        error: ValidationError,
    ) -> Result<Disposition, PipelineError> {
        let reason = error.to_string();
        warn!(error = %reason, "Dead-lettering invalid request");

        self.producer
            .publish_dead_letter(&DlqMessage::for_request(self.channel, request, &reason, 0))
            .await
            .map_err(|e| PipelineError::Queue(e.to_string()))?;
        self.metrics.dead_lettered();

        // without a message id there is no record to key on
        if request.message_id.trim().is_empty() {
            return Ok(Disposition::DeadLettered(DeliveryState::Failed));
        }

        let mut status = DeliveryStatus::new(
            &request.message_id,
            &request.subscriber_id,
            self.channel,
            &request.event_type,
            &request.recipients,
        );
        let before = status.clone();
        status.transition(DeliveryState::Failed, Some(reason));

        let saved = self.tracker.save_delivery_status(status).await?;
        if saved.status == DeliveryState::Failed && before.status != saved.status {
            self.metrics.terminal(DeliveryState::Failed);
            self.audit(
                &StatusChange {
                    before,
                    after: saved,
                },
                request.trace_id(),
            )
            .await;
        }

        Ok(Disposition::DeadLettered(DeliveryState::Failed))
    }

    /// Audit emission is best-effort; the tracker already holds the outcome.
    async fn audit(&self, change: &StatusChange, trace_id: &str) {
        let after = &change.after;
        let mut event = AuditEvent::new(
            after.message_id.clone(),
            &format!("notification.{}", after.status),
            after.subscriber_id.clone(),
            trace_id.to_string(),
            after.status,
        )
        .with_snapshots(
            serde_json::to_value(&change.before).ok(),
            serde_json::to_value(after).ok(),
        );
        if let Some(error) = &after.error {
            event = event.with_error(error.clone());
        }

        if let Err(e) = self.producer.publish_audit(&event).await {
            warn!(error = %e, message_id = %after.message_id, "Failed to publish audit event");
        }
    }
}

fn humanize(key: &str) -> String {
    let words = key.replace(['_', '-'], " ");
    let mut chars = words.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Template data: event data plus request identifiers. Keys are ordered so output is stable.
pub fn template_context(request: &NotificationRequest) -> Map<String, Value> {
    let mut context = Map::new();
    let mut details = Vec::new();

    if let Some(event_data) = &request.event_data {
        let mut entries: Vec<(&String, &Value)> = event_data.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        for (key, value) in entries {
            let display = match value {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            };
            if let Some(display) = display {
                details.push(json!({ "label": humanize(key), "value": display }));
            }
            context.insert(key.clone(), value.clone());
        }
    }

    context.insert("message_id".into(), json!(request.message_id));
    context.insert("user_id".into(), json!(request.subscriber_id));
    context.insert("correlation_id".into(), json!(request.trace_id()));
    context.insert("event_type".into(), json!(request.event_type));
    context.insert("priority".into(), json!(request.priority.as_str()));
    context.insert("timestamp".into(), json!(request.created_at.to_rfc3339()));
    context.insert("details".into(), Value::Array(details));

    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_ordered_and_keeps_identifiers() {
        let request = NotificationRequest::new("m1", "s1", "inquiry-business", vec![])
            .with_event_data("entity_id", json!("biz-1"))
            .with_event_data("company_name", json!("Acme"))
            .with_event_data("priority", json!("low"))
            .with_event_data("nested", json!({"a": 1}))
            .with_correlation_id("corr-1");

        let context = template_context(&request);
        assert_eq!(context["entity_id"], "biz-1");
        assert_eq!(context["user_id"], "s1");
        assert_eq!(context["correlation_id"], "corr-1");
        assert_eq!(context["priority"], "medium");

        let labels: Vec<&str> = context["details"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["label"].as_str().unwrap())
            .collect();
        assert_eq!(labels, vec!["Company name", "Entity id", "Priority"]);
    }

    #[test]
    fn test_humanize() {
        assert_eq!(humanize("event_date"), "Event date");
        assert_eq!(humanize("capacity-pct"), "Capacity pct");
        assert_eq!(humanize(""), "");
    }
}
