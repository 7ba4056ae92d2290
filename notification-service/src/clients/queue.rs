use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::models::{
    audit::AuditEvent,
    message::DlqMessage,
    request::{Channel, NotificationRequest},
};

/// Outbound side of the broker as seen by the channel handler.
#[async_trait]
pub trait QueueProducer: Send + Sync {
    /// Re-enqueues `request` on its channel after `delay`.
    async fn publish_retry(
        &self,
        channel: Channel,
        request: &NotificationRequest,
        delay: Duration,
    ) -> Result<(), Error>;

    async fn publish_dead_letter(&self, message: &DlqMessage) -> Result<(), Error>;

    async fn publish_audit(&self, event: &AuditEvent) -> Result<(), Error>;
}

#[derive(Debug, Clone)]
pub struct ScheduledRetry {
    pub channel: Channel,
    pub request: NotificationRequest,
    pub delay: Duration,
}

/// Producer that keeps everything in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryQueue {
    retries: Mutex<Vec<ScheduledRetry>>,
    dead_letters: Mutex<Vec<DlqMessage>>,
    audits: Mutex<Vec<AuditEvent>>,
    fail_dead_letters: AtomicBool,
    fail_audits: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent dead-letter publishes fail.
    pub fn fail_dead_letters(&self, fail: bool) {
        self.fail_dead_letters.store(fail, Ordering::SeqCst);
    }

    pub fn fail_audits(&self, fail: bool) {
        self.fail_audits.store(fail, Ordering::SeqCst);
    }

    pub async fn retries(&self) -> Vec<ScheduledRetry> {
        self.retries.lock().await.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DlqMessage> {
        self.dead_letters.lock().await.clone()
    }

    pub async fn audits(&self) -> Vec<AuditEvent> {
        self.audits.lock().await.clone()
    }
}

#[async_trait]
impl QueueProducer for MemoryQueue {
    async fn publish_retry(
        &self,
        channel: Channel,
        request: &NotificationRequest,
        delay: Duration,
    ) -> Result<(), Error> {
        self.retries.lock().await.push(ScheduledRetry {
            channel,
            request: request.clone(),
            delay,
        });
        Ok(())
    }

    async fn publish_dead_letter(&self, message: &DlqMessage) -> Result<(), Error> {
        if self.fail_dead_letters.load(Ordering::SeqCst) {
            return Err(anyhow!("dead-letter queue unavailable"));
        }
        self.dead_letters.lock().await.push(message.clone());
        Ok(())
    }

    async fn publish_audit(&self, event: &AuditEvent) -> Result<(), Error> {
        if self.fail_audits.load(Ordering::SeqCst) {
            return Err(anyhow!("audit queue unavailable"));
        }
        self.audits.lock().await.push(event.clone());
        Ok(())
    }
}
