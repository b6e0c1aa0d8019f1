use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use tokio::sync::watch;

use crate::config::KafkaSettings;
use crate::events::{AuditEvent, AuditLogRecord};
use crate::messaging::ConsumeError;
use crate::metrics::Metrics;
use crate::ports::AuditStore;
use crate::workers::Worker;

// ============================================================================
// Audit Consumer
// ============================================================================
//
// Tails the audit topic under the configured consumer group with manual
// offset commits: an offset is committed only after the record has been
// persisted, so a crash between persist and commit re-delivers (accepted
// at-least-once behavior). A malformed payload is logged and skipped; a
// broker error backs off briefly; a store failure is re-raised so the
// supervisor observes the crash and restarts the loop.
//
// ============================================================================

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const IDLE_SLEEP: Duration = Duration::from_millis(50);
const CONSUME_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const PROCESSING_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Persistence step, separated from the poll loop so the at-least-once
/// semantics are testable without a broker.
pub(crate) struct AuditEventProcessor {
    store: Arc<dyn AuditStore>,
    metrics: Arc<Metrics>,
}

impl AuditEventProcessor {
    pub(crate) async fn process(&self, payload: &[u8]) -> Result<(), ConsumeError> {
        let event: AuditEvent = serde_json::from_slice(payload)?;
        let record = AuditLogRecord::from_event(&event);

        self.store
            .add_entry(record)
            .await
            .map_err(ConsumeError::Store)?;

        self.metrics.audit_events_persisted.inc();
        tracing::info!(
            event_type = %event.event_type,
            entity = %event.partition_key(),
            action = %event.action,
            "audit event persisted"
        );
        Ok(())
    }
}

pub struct AuditConsumerWorker {
    settings: KafkaSettings,
    processor: AuditEventProcessor,
}

impl AuditConsumerWorker {
    pub fn new(settings: KafkaSettings, store: Arc<dyn AuditStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            settings,
            processor: AuditEventProcessor { store, metrics },
        }
    }

    async fn poll_loop(
        &self,
        consumer: &StreamConsumer,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                polled = tokio::time::timeout(POLL_TIMEOUT, consumer.recv()) => {
                    match polled {
                        // Nothing available; idle briefly instead of
                        // spinning on the broker.
                        Err(_) => {
                            tokio::time::sleep(IDLE_SLEEP).await;
                        }
                        Ok(Err(e)) => {
                            tracing::error!(error = %e, "kafka consume error");
                            self.processor
                                .metrics
                                .consumer_errors
                                .with_label_values(&["audit-consumer"])
                                .inc();
                            tokio::time::sleep(CONSUME_ERROR_BACKOFF).await;
                        }
                        Ok(Ok(message)) => {
                            let key = message
                                .key()
                                .map(|k| String::from_utf8_lossy(k).into_owned())
                                .unwrap_or_default();
                            tracing::debug!(
                                key = %key,
                                partition = message.partition(),
                                offset = message.offset(),
                                correlation_id = header_value(&message, "correlationId").as_deref().unwrap_or(""),
                                source = header_value(&message, "source").as_deref().unwrap_or(""),
                                "processing audit message"
                            );

                            let payload = message.payload().unwrap_or_default();
                            match self.processor.process(payload).await {
                                Ok(()) => {
                                    if !self.settings.enable_auto_commit {
                                        if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                            tracing::warn!(error = %e, "failed to commit audit offset");
                                        }
                                    }
                                }
                                Err(ConsumeError::Malformed(e)) => {
                                    // Skipped without committing this
                                    // offset; redelivery on restart is
                                    // accepted under at-least-once.
                                    tracing::error!(
                                        key = %key,
                                        error = %e,
                                        "malformed audit message, skipping"
                                    );
                                }
                                Err(e) => {
                                    tracing::error!(key = %key, error = %e, "failed to process audit event");
                                    tokio::time::sleep(PROCESSING_ERROR_BACKOFF).await;
                                    return Err(e.into());
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Worker for AuditConsumerWorker {
    fn name(&self) -> &str {
        "audit-consumer"
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let consumer: StreamConsumer = self.settings.consumer_config().create()?;
        consumer.subscribe(&[self.settings.audit_topic.as_str()])?;
        tracing::info!(
            topic = %self.settings.audit_topic,
            group = %self.settings.group_id,
            "audit consumer subscribed"
        );

        let result = self.poll_loop(&consumer, &mut shutdown).await;

        // Release the group membership on every exit path: cancellation,
        // fatal error or normal loop exit.
        consumer.unsubscribe();
        tracing::info!("audit consumer stopped");
        result
    }
}

fn header_value<M: Message>(message: &M, name: &str) -> Option<String> {
    let headers = message.headers()?;
    for i in 0..headers.count() {
        let header = headers.get(i);
        if header.key == name {
            return header
                .value
                .map(|value| String::from_utf8_lossy(value).into_owned());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AuditAction;
    use crate::ports::InMemoryAuditStore;

    fn processor(store: Arc<InMemoryAuditStore>) -> AuditEventProcessor {
        AuditEventProcessor {
            store,
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn payload(event: &AuditEvent) -> Vec<u8> {
        serde_json::to_vec(event).unwrap()
    }

    #[tokio::test]
    async fn persists_one_record_per_message() {
        let store = Arc::new(InMemoryAuditStore::new());
        let processor = processor(store.clone());

        let event = AuditEvent::new("Student", "Student", "42", AuditAction::Create);
        processor.process(&payload(&event)).await.unwrap();

        let entries = store.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entity_id, "42");
        assert_eq!(entries[0].action, AuditAction::Create);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_tolerated_not_deduplicated() {
        let store = Arc::new(InMemoryAuditStore::new());
        let processor = processor(store.clone());

        let event = AuditEvent::new("Student", "Student", "42", AuditAction::Create);
        let bytes = payload(&event);
        processor.process(&bytes).await.unwrap();
        processor.process(&bytes).await.unwrap();

        // At-least-once: a duplicate publish lands twice in the store.
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn events_for_one_entity_persist_in_publish_order() {
        let store = Arc::new(InMemoryAuditStore::new());
        let processor = processor(store.clone());

        let first = AuditEvent::student("42", AuditAction::Create);
        let second = AuditEvent::student("42", AuditAction::Update);
        processor.process(&payload(&first)).await.unwrap();
        processor.process(&payload(&second)).await.unwrap();

        let entries = store.entries().await;
        assert_eq!(entries[0].action, AuditAction::Create);
        assert_eq!(entries[1].action, AuditAction::Update);
    }

    #[tokio::test]
    async fn malformed_payload_is_reported_and_not_persisted() {
        let store = Arc::new(InMemoryAuditStore::new());
        let processor = processor(store.clone());

        let result = processor.process(b"{\"broken\":").await;

        assert!(matches!(result, Err(ConsumeError::Malformed(_))));
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_store_error() {
        struct FailingStore;

        #[async_trait]
        impl AuditStore for FailingStore {
            async fn add_entry(&self, _record: AuditLogRecord) -> anyhow::Result<()> {
                anyhow::bail!("audit database unavailable")
            }
        }

        let processor = AuditEventProcessor {
            store: Arc::new(FailingStore),
            metrics: Arc::new(Metrics::new().unwrap()),
        };

        let event = AuditEvent::student("42", AuditAction::Create);
        let result = processor.process(&payload(&event)).await;

        assert!(matches!(result, Err(ConsumeError::Store(_))));
    }
}
