//! Delivery status tracking.
//!
//! Every write goes through an optimistic compare-and-swap on a per-record version, so
//! concurrent workers touching the same message are serialized. Terminal records are never
//! superseded.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::TrackerError,
    models::{
        provider::DeliveryReport,
        request::{Channel, NotificationRequest},
        status::{DeliveryState, DeliveryStatus},
    },
};

const MAX_CAS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct VersionedStatus {
    pub version: u64,
    pub status: DeliveryStatus,
}

/// Storage primitives behind the tracker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load(&self, message_id: &str) -> Result<Option<VersionedStatus>, TrackerError>;

    /// Writes `status` only if the stored version equals `expected` (0 means absent).
    /// Returns `false` when another writer got there first.
    async fn compare_and_swap(
        &self,
        status: &DeliveryStatus,
        expected: u64,
    ) -> Result<bool, TrackerError>;

    async fn index_failed(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError>;

    /// Most recently failed first.
    async fn failed_ids(&self, limit: usize) -> Result<Vec<String>, TrackerError>;

    async fn index_retry(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError>;

    async fn remove_retry(&self, message_id: &str) -> Result<(), TrackerError>;

    async fn due_retry_ids(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, TrackerError>;

    async fn map_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
        message_id: &str,
    ) -> Result<(), TrackerError>;

    async fn resolve_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<String>, TrackerError>;

    async fn ping(&self) -> Result<(), TrackerError>;
}

/// Snapshot pair produced by an accepted update.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub before: DeliveryStatus,
    pub after: DeliveryStatus,
}

impl StatusChange {
    pub fn reached_terminal(&self) -> bool {
        !self.before.is_terminal() && self.after.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptStart {
    /// Record is new or still has pending recipients; attempt count already incremented.
    Proceed(DeliveryStatus),
    /// Terminal, or every recipient was already handed to the provider.
    Skip(DeliveryStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecipientUpdate {
    pub recipient: String,
    pub state: DeliveryState,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
}

impl RecipientUpdate {
    pub fn new(recipient: impl Into<String>, state: DeliveryState, error: Option<String>) -> Self {
        Self {
            recipient: recipient.into(),
            state,
            error,
            provider_message_id: None,
        }
    }

    pub fn with_provider_id(mut self, provider_message_id: impl Into<String>) -> Self {
        self.provider_message_id = Some(provider_message_id.into());
        self
    }
}

#[derive(Clone)]
pub struct DeliveryTracker {
    store: Arc<dyn StatusStore>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStatusStore::default()))
    }

    pub async fn ping(&self) -> Result<(), TrackerError> {
        self.store.ping().await
    }

    /// Upserts a record. An existing terminal record wins and is returned unchanged.
    pub async fn save_delivery_status(
        &self,
        status: DeliveryStatus,
    ) -> Result<DeliveryStatus, TrackerError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let expected = match self.store.load(&status.message_id).await? {
                Some(current) if current.status.is_terminal() => {
                    debug!(message_id = %status.message_id, "Save ignored, record is terminal");
                    return Ok(current.status);
                }
                Some(current) => current.version,
                None => 0,
            };

            if self.store.compare_and_swap(&status, expected).await? {
                self.after_write(&status).await?;
                return Ok(status);
            }
        }

        Err(TrackerError::Conflict(status.message_id))
    }

    pub async fn get_delivery_status(
        &self,
        message_id: &str,
    ) -> Result<Option<DeliveryStatus>, TrackerError> {
        Ok(self.store.load(message_id).await?.map(|v| v.status))
    }

    /// Moves the whole record to `state`. Returns `None` when the record is terminal.
    pub async fn update_delivery_status(
        &self,
        message_id: &str,
        state: DeliveryState,
        error: Option<String>,
    ) -> Result<Option<StatusChange>, TrackerError> {
        self.modify(message_id, |status| status.transition(state, error.clone()))
            .await
    }

    pub async fn update_recipient_status(
        &self,
        message_id: &str,
        recipient: &str,
        state: DeliveryState,
        error: Option<String>,
    ) -> Result<Option<StatusChange>, TrackerError> {
        self.update_recipients(message_id, &[RecipientUpdate::new(recipient, state, error)], None)
            .await
    }

    /// Applies per-recipient outcomes in one write and rolls the record status up.
    ///
    /// `provider_message_id` becomes the record-level id; per-recipient ids on the updates
    /// are kept on their entries. Every id is mapped back to the message for reports.
    pub async fn update_recipients(
        &self,
        message_id: &str,
        updates: &[RecipientUpdate],
        provider_message_id: Option<&str>,
    ) -> Result<Option<StatusChange>, TrackerError> {
        let change = self
            .modify(message_id, |status| {
                let now = Utc::now();
                let mut changed = false;

                for update in updates {
                    if let Some(recipient) = status.recipient_mut(&update.recipient) {
                        if recipient.apply(update.state, update.error.clone(), now) {
                            if update.provider_message_id.is_some() {
                                recipient.provider_message_id = update.provider_message_id.clone();
                            }
                            changed = true;
                        }
                    }
                }
                if let Some(pid) = provider_message_id {
                    status.provider_message_id = Some(pid.to_string());
                    changed = true;
                }
                if changed {
                    status.roll_up();
                    status.updated_at = now;
                }
                changed
            })
            .await?;

        if let Some(change) = &change {
            let mut mapped: Vec<&str> = Vec::new();
            let ids = provider_message_id
                .into_iter()
                .chain(updates.iter().filter_map(|u| u.provider_message_id.as_deref()));
            for pid in ids {
                if !mapped.contains(&pid) {
                    self.store
                        .map_provider_id(change.after.channel, pid, message_id)
                        .await?;
                    mapped.push(pid);
                }
            }
        }

        Ok(change)
    }

    /// Finalises recipients that were never accepted, leaving accepted ones to their
    /// provider reports. A record with nothing accepted becomes `state` as a whole.
    pub async fn fail_pending(
        &self,
        message_id: &str,
        state: DeliveryState,
        error: Option<String>,
    ) -> Result<Option<StatusChange>, TrackerError> {
        let change = self
            .modify(message_id, |status| {
                let accepted = status
                    .recipients
                    .iter()
                    .any(|r| r.status == DeliveryState::Sent);
                if !accepted {
                    return status.transition(state, error.clone());
                }

                let now = Utc::now();
                let mut changed = false;
                for recipient in status
                    .recipients
                    .iter_mut()
                    .filter(|r| r.status == DeliveryState::Pending)
                {
                    changed |= recipient.apply(state, error.clone(), now);
                }
                if changed {
                    if error.is_some() {
                        status.error = error.clone();
                    }
                    status.next_retry_at = None;
                    status.roll_up();
                    status.updated_at = now;
                }
                changed
            })
            .await?;

        if change.is_some() {
            self.store.remove_retry(message_id).await?;
        }

        Ok(change)
    }

    /// Begins a dispatch attempt, creating the record on first sight.
    pub async fn start_attempt(
        &self,
        request: &NotificationRequest,
        channel: Channel,
    ) -> Result<AttemptStart, TrackerError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (mut status, expected) = match self.store.load(&request.message_id).await? {
                Some(current) if current.status.is_terminal() || !current.status.has_pending() => {
                    return Ok(AttemptStart::Skip(current.status));
                }
                Some(current) => (current.status, current.version),
                None => (
                    DeliveryStatus::new(
                        &request.message_id,
                        &request.subscriber_id,
                        channel,
                        &request.event_type,
                        &request.recipients,
                    ),
                    0,
                ),
            };

            let now = Utc::now();
            status.attempt_count += 1;
            status.last_attempt_at = Some(now);
            status.next_retry_at = None;
            status.updated_at = now;

            if self.store.compare_and_swap(&status, expected).await? {
                self.store.remove_retry(&status.message_id).await?;
                return Ok(AttemptStart::Proceed(status));
            }
        }

        Err(TrackerError::Conflict(request.message_id.clone()))
    }

    pub async fn get_failed_deliveries(
        &self,
        limit: usize,
    ) -> Result<Vec<DeliveryStatus>, TrackerError> {
        let mut failed = Vec::with_capacity(limit);

        for message_id in self.store.failed_ids(limit).await? {
            match self.store.load(&message_id).await? {
                Some(current) if current.status.status.is_failure() => failed.push(current.status),
                Some(_) => {}
                None => warn!(message_id = %message_id, "Failed index points at a missing record"),
            }
        }

        Ok(failed)
    }

    /// Records when the next attempt is due. Returns `false` if the record is terminal.
    pub async fn schedule_retry(
        &self,
        message_id: &str,
        retry_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<bool, TrackerError> {
        let change = self
            .modify(message_id, |status| {
                status.next_retry_at = Some(retry_at);
                if error.is_some() {
                    status.error = error.clone();
                }
                status.updated_at = Utc::now();
                true
            })
            .await?;

        if change.is_some() {
            self.store.index_retry(message_id, retry_at).await?;
            info!(message_id, %retry_at, "Retry scheduled");
        }

        Ok(change.is_some())
    }

    pub async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, TrackerError> {
        self.store.due_retry_ids(now, limit).await
    }

    pub async fn resolve_provider_message(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<String>, TrackerError> {
        self.store
            .resolve_provider_id(channel, provider_message_id)
            .await
    }

    /// Applies an asynchronous delivery report. Unknown provider ids are ignored.
    ///
    /// A report without a recipient applies to the accepted recipients that carry its
    /// provider id, or to every accepted recipient when none carries one.
    pub async fn apply_report(
        &self,
        channel: Channel,
        report: &DeliveryReport,
    ) -> Result<Option<StatusChange>, TrackerError> {
        let Some(message_id) = self
            .resolve_provider_message(channel, &report.provider_message_id)
            .await?
        else {
            warn!(
                %channel,
                provider_message_id = %report.provider_message_id,
                "Delivery report for unknown provider message"
            );
            return Ok(None);
        };

        match &report.recipient {
            Some(recipient) => {
                self.update_recipient_status(&message_id, recipient, report.status, report.error.clone())
                    .await
            }
            None => {
                let pid = report.provider_message_id.as_str();
                self.modify(&message_id, |status| {
                    let now = Utc::now();
                    let by_id = status
                        .recipients
                        .iter()
                        .any(|r| r.provider_message_id.as_deref() == Some(pid));

                    let mut changed = false;
                    for recipient in status.recipients.iter_mut() {
                        let matches = !by_id || recipient.provider_message_id.as_deref() == Some(pid);
                        if matches && recipient.status == DeliveryState::Sent {
                            changed |= recipient.apply(report.status, report.error.clone(), now);
                        }
                    }
                    if changed {
                        status.roll_up();
                        status.updated_at = now;
                        changed
                    } else {
                        status.transition(report.status, report.error.clone())
                    }
                })
                .await
            }
        }
    }

    /// Read-modify-CAS loop. `apply` returns `false` to abandon the write.
    async fn modify<F>(
        &self,
        message_id: &str,
        mut apply: F,
    ) -> Result<Option<StatusChange>, TrackerError>
    where
        F: FnMut(&mut DeliveryStatus) -> bool + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .load(message_id)
                .await?
                .ok_or_else(|| TrackerError::NotFound(message_id.to_string()))?;

            if current.status.is_terminal() {
                debug!(message_id, status = %current.status.status, "Update ignored, record is terminal");
                return Ok(None);
            }

            let mut updated = current.status.clone();
            if !apply(&mut updated) {
                return Ok(None);
            }

            if self
                .store
                .compare_and_swap(&updated, current.version)
                .await?
            {
                self.after_write(&updated).await?;
                return Ok(Some(StatusChange {
                    before: current.status,
                    after: updated,
                }));
            }

            debug!(message_id, "Concurrent update detected, retrying");
        }

        Err(TrackerError::Conflict(message_id.to_string()))
    }

    async fn after_write(&self, status: &DeliveryStatus) -> Result<(), TrackerError> {
        if status.status.is_failure() {
            self.store
                .index_failed(&status.message_id, status.updated_at)
                .await?;
        }
        if status.is_terminal() {
            self.store.remove_retry(&status.message_id).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, VersionedStatus>,
    failed: HashMap<String, DateTime<Utc>>,
    retries: HashMap<String, DateTime<Utc>>,
    provider_ids: HashMap<(Channel, String), String>,
}

/// Process-local store for tests and single-node runs.
#[derive(Default)]
pub struct InMemoryStatusStore {
    state: RwLock<MemoryState>,
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn load(&self, message_id: &str) -> Result<Option<VersionedStatus>, TrackerError> {
        Ok(self.state.read().await.records.get(message_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        status: &DeliveryStatus,
        expected: u64,
    ) -> Result<bool, TrackerError> {
        let mut state = self.state.write().await;
        let current = state
            .records
            .get(&status.message_id)
            .map(|v| v.version)
            .unwrap_or(0);

        if current != expected {
            return Ok(false);
        }

        state.records.insert(
            status.message_id.clone(),
            VersionedStatus {
                version: expected + 1,
                status: status.clone(),
            },
        );
        Ok(true)
    }

    async fn index_failed(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError> {
        self.state
            .write()
            .await
            .failed
            .insert(message_id.to_string(), at);
        Ok(())
    }

    async fn failed_ids(&self, limit: usize) -> Result<Vec<String>, TrackerError> {
        let state = self.state.read().await;
        let mut entries: Vec<(&String, &DateTime<Utc>)> = state.failed.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

        Ok(entries
            .into_iter()
            .take(limit)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn index_retry(&self, message_id: &str, at: DateTime<Utc>) -> Result<(), TrackerError> {
        self.state
            .write()
            .await
            .retries
            .insert(message_id.to_string(), at);
        Ok(())
    }

    async fn remove_retry(&self, message_id: &str) -> Result<(), TrackerError> {
        self.state.write().await.retries.remove(message_id);
        Ok(())
    }

    async fn due_retry_ids(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, TrackerError> {
        let state = self.state.read().await;
        let mut due: Vec<(&String, &DateTime<Utc>)> =
            state.retries.iter().filter(|(_, at)| **at <= now).collect();
        due.sort_by(|a, b| a.1.cmp(b.1));

        Ok(due.into_iter().take(limit).map(|(id, _)| id.clone()).collect())
    }

    async fn map_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
        message_id: &str,
    ) -> Result<(), TrackerError> {
        self.state
            .write()
            .await
            .provider_ids
            .insert((channel, provider_message_id.to_string()), message_id.to_string());
        Ok(())
    }

    async fn resolve_provider_id(
        &self,
        channel: Channel,
        provider_message_id: &str,
    ) -> Result<Option<String>, TrackerError> {
        Ok(self
            .state
            .read()
            .await
            .provider_ids
            .get(&(channel, provider_message_id.to_string()))
            .cloned())
    }

    async fn ping(&self) -> Result<(), TrackerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;

    use super::*;

    fn request() -> NotificationRequest {
        NotificationRequest::new(
            "msg-1",
            "sub-1",
            "inquiry-business",
            vec!["a@example.org".into(), "b@example.org".into()],
        )
    }

    fn record() -> DeliveryStatus {
        let r = request();
        DeliveryStatus::new(&r.message_id, &r.subscriber_id, Channel::Email, &r.event_type, &r.recipients)
    }

    #[tokio::test]
    async fn test_terminal_record_is_never_superseded() {
        let tracker = DeliveryTracker::in_memory();
        tracker.save_delivery_status(record()).await.unwrap();

        let change = tracker
            .update_delivery_status("msg-1", DeliveryState::Delivered, None)
            .await
            .unwrap();
        assert!(change.unwrap().reached_terminal());

        let late = tracker
            .update_delivery_status("msg-1", DeliveryState::Failed, Some("late".into()))
            .await
            .unwrap();
        assert!(late.is_none());

        let saved = tracker.save_delivery_status(record()).await.unwrap();
        assert_eq!(saved.status, DeliveryState::Delivered);

        let current = tracker.get_delivery_status("msg-1").await.unwrap().unwrap();
        assert_eq!(current.status, DeliveryState::Delivered);
        assert!(current.error.is_none());
    }

    #[tokio::test]
    async fn test_start_attempt_counts_and_skips() {
        let tracker = DeliveryTracker::in_memory();

        let AttemptStart::Proceed(first) = tracker.start_attempt(&request(), Channel::Email).await.unwrap() else {
            panic!("expected proceed");
        };
        assert_eq!(first.attempt_count, 1);

        let AttemptStart::Proceed(second) = tracker.start_attempt(&request(), Channel::Email).await.unwrap() else {
            panic!("expected proceed");
        };
        assert_eq!(second.attempt_count, 2);

        tracker
            .update_delivery_status("msg-1", DeliveryState::Sent, None)
            .await
            .unwrap();
        assert!(matches!(
            tracker.start_attempt(&request(), Channel::Email).await.unwrap(),
            AttemptStart::Skip(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_deliveries_and_retries() {
        let tracker = DeliveryTracker::in_memory();
        tracker.save_delivery_status(record()).await.unwrap();

        let retry_at = Utc::now() - Duration::seconds(1);
        assert!(tracker.schedule_retry("msg-1", retry_at, Some("timeout".into())).await.unwrap());
        assert_eq!(tracker.due_retries(Utc::now(), 10).await.unwrap(), vec!["msg-1"]);

        tracker
            .update_delivery_status("msg-1", DeliveryState::Failed, Some("timeout".into()))
            .await
            .unwrap();

        assert!(tracker.due_retries(Utc::now(), 10).await.unwrap().is_empty());
        assert!(!tracker.schedule_retry("msg-1", Utc::now(), None).await.unwrap());

        let failed = tracker.get_failed_deliveries(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].message_id, "msg-1");
        assert!(tracker.get_failed_deliveries(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_resolves_through_provider_id() {
        let tracker = DeliveryTracker::in_memory();
        tracker.save_delivery_status(record()).await.unwrap();

        let updates = [
            RecipientUpdate::new("a@example.org", DeliveryState::Sent, None),
            RecipientUpdate::new("b@example.org", DeliveryState::Sent, None),
        ];
        tracker
            .update_recipients("msg-1", &updates, Some("pm-1"))
            .await
            .unwrap();

        let report = DeliveryReport {
            provider_message_id: "pm-1".into(),
            recipient: Some("a@example.org".into()),
            status: DeliveryState::Delivered,
            error: None,
        };
        let change = tracker.apply_report(Channel::Email, &report).await.unwrap().unwrap();
        assert_eq!(change.after.status, DeliveryState::Sent);

        let report = DeliveryReport {
            provider_message_id: "pm-1".into(),
            recipient: None,
            status: DeliveryState::Delivered,
            error: None,
        };
        let change = tracker.apply_report(Channel::Email, &report).await.unwrap().unwrap();
        assert!(change.reached_terminal());
        assert_eq!(change.after.status, DeliveryState::Delivered);

        let unknown = DeliveryReport {
            provider_message_id: "pm-x".into(),
            ..report.clone()
        };
        assert!(tracker.apply_report(Channel::Email, &unknown).await.unwrap().is_none());
        assert!(tracker.apply_report(Channel::Sms, &report).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reports_resolve_per_recipient_provider_ids() {
        let tracker = DeliveryTracker::in_memory();
        tracker.save_delivery_status(record()).await.unwrap();

        let updates = [
            RecipientUpdate::new("a@example.org", DeliveryState::Sent, None).with_provider_id("SM1"),
            RecipientUpdate::new("b@example.org", DeliveryState::Sent, None).with_provider_id("SM2"),
        ];
        tracker
            .update_recipients("msg-1", &updates, Some("SM1"))
            .await
            .unwrap();

        let report = |pid: &str| DeliveryReport {
            provider_message_id: pid.into(),
            recipient: None,
            status: DeliveryState::Delivered,
            error: None,
        };

        let change = tracker.apply_report(Channel::Email, &report("SM1")).await.unwrap().unwrap();
        assert_eq!(change.after.status, DeliveryState::Sent);
        assert_eq!(change.after.recipients[1].status, DeliveryState::Sent);

        let change = tracker.apply_report(Channel::Email, &report("SM2")).await.unwrap().unwrap();
        assert!(change.reached_terminal());
        assert!(change.after.recipients.iter().all(|r| r.status == DeliveryState::Delivered));
    }

    #[tokio::test]
    async fn test_fail_pending_keeps_accepted_recipients() {
        let tracker = DeliveryTracker::in_memory();
        tracker.save_delivery_status(record()).await.unwrap();
        tracker
            .update_recipient_status("msg-1", "a@example.org", DeliveryState::Sent, None)
            .await
            .unwrap();

        let change = tracker
            .fail_pending("msg-1", DeliveryState::Failed, Some("gave up".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.after.status, DeliveryState::Sent);
        assert_eq!(change.after.recipients[0].status, DeliveryState::Sent);
        assert_eq!(change.after.recipients[1].status, DeliveryState::Failed);
        assert_eq!(change.after.error.as_deref(), Some("gave up"));

        // nothing pending any more, so redelivery is a no-op
        assert!(matches!(
            tracker.start_attempt(&request(), Channel::Email).await.unwrap(),
            AttemptStart::Skip(_)
        ));
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let tracker = DeliveryTracker::in_memory();
        let err = tracker
            .update_delivery_status("nope", DeliveryState::Sent, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_conflicting_write_is_retried() {
        let mut store = MockStatusStore::new();
        let stored = VersionedStatus {
            version: 3,
            status: record(),
        };

        store
            .expect_load()
            .returning(move |_| Ok(Some(stored.clone())));

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        store.expect_compare_and_swap().returning(move |_, expected| {
            assert_eq!(expected, 3);
            Ok(seen.fetch_add(1, Ordering::SeqCst) > 0)
        });

        let tracker = DeliveryTracker::new(Arc::new(store));
        let change = tracker
            .update_delivery_status("msg-1", DeliveryState::Sent, None)
            .await
            .unwrap();

        assert!(change.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_conflict_gives_up() {
        let mut store = MockStatusStore::new();
        store.expect_load().returning(|_| {
            Ok(Some(VersionedStatus {
                version: 1,
                status: record(),
            }))
        });
        store
            .expect_compare_and_swap()
            .times(MAX_CAS_ATTEMPTS)
            .returning(|_, _| Ok(false));

        let tracker = DeliveryTracker::new(Arc::new(store));
        let err = tracker
            .update_delivery_status("msg-1", DeliveryState::Sent, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Conflict(_)));
    }
}
