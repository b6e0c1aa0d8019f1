use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::events::AuditLogRecord;

// ============================================================================
// Outbound Ports
// ============================================================================
//
// Seams to the two external collaborators of the pipeline: the email
// notification capability and the audit store. Their internal delivery
// mechanism and schema are owned elsewhere; the pipeline only invokes them.
//
// ============================================================================

#[async_trait]
pub trait EmailNotifier: Send + Sync {
    async fn send_enrollment_confirmation(
        &self,
        email: &str,
        name: &str,
        career: &str,
        enrollment_date: &str,
    ) -> anyhow::Result<()>;

    async fn send_enrollment_cancellation(
        &self,
        email: &str,
        name: &str,
        career: &str,
        enrollment_date: &str,
    ) -> anyhow::Result<()>;
}

/// Notifier adapter that records the send in the log stream. Stands in for
/// the SMTP transport, which lives outside this pipeline.
pub struct LoggingEmailNotifier;

#[async_trait]
impl EmailNotifier for LoggingEmailNotifier {
    async fn send_enrollment_confirmation(
        &self,
        email: &str,
        name: &str,
        career: &str,
        enrollment_date: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(
            email = %email,
            name = %name,
            career = %career,
            enrollment_date = %enrollment_date,
            "sending enrollment confirmation email"
        );
        Ok(())
    }

    async fn send_enrollment_cancellation(
        &self,
        email: &str,
        name: &str,
        career: &str,
        enrollment_date: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(
            email = %email,
            name = %name,
            career = %career,
            enrollment_date = %enrollment_date,
            "sending enrollment cancellation email"
        );
        Ok(())
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Single-entry append into the durable audit trail.
    async fn add_entry(&self, record: AuditLogRecord) -> anyhow::Result<()>;
}

/// Append-only in-memory store, used by tests and as the default adapter
/// when no durable store is wired in.
#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditLogRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditLogRecord> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn add_entry(&self, record: AuditLogRecord) -> anyhow::Result<()> {
        self.entries.lock().await.push(record);
        Ok(())
    }
}
