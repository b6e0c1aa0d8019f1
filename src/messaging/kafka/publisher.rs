use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;

use crate::config::KafkaSettings;
use crate::events::{AuditAction, AuditEvent};
use crate::messaging::PublishError;
use crate::metrics::Metrics;
use crate::utils::{retry_with_backoff, RetryConfig, RetryOutcome};

// ============================================================================
// Audit Publisher
// ============================================================================
//
// Appends audit events to the durable log keyed by `entityName:entityId`.
// The producer is idempotent with acks=all: duplicate delivery from retries
// of one publish is acceptable, data loss is not. When the bounded retry
// budget is spent, the event is escalated to the dead-letter topic with the
// failure annotated; the original error still surfaces to the caller either
// way.
//
// ============================================================================

pub struct AuditPublisher {
    producer: FutureProducer,
    settings: KafkaSettings,
    retry_config: RetryConfig,
    metrics: Arc<Metrics>,
}

impl AuditPublisher {
    pub fn new(settings: KafkaSettings, metrics: Arc<Metrics>) -> Result<Self, KafkaError> {
        let producer: FutureProducer = settings.producer_config().create()?;
        let retry_config = RetryConfig::new(
            settings.retries,
            Duration::from_millis(settings.retry_backoff_ms),
        );
        Ok(Self {
            producer,
            settings,
            retry_config,
            metrics,
        })
    }

    pub async fn publish_audit_event(&self, event: &AuditEvent) -> Result<(), PublishError> {
        let key = event.partition_key();
        let payload = serde_json::to_string(event)?;

        let outcome = retry_with_backoff(self.retry_config.clone(), |attempt| {
            let key = key.clone();
            let payload = payload.clone();
            let headers = audit_headers(event);
            async move {
                tracing::debug!(attempt, key = %key, "attempting audit publish");
                self.send(&self.settings.audit_topic, &key, &payload, headers)
                    .await
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success(()) => {
                self.metrics.audit_events_published.inc();
                tracing::info!(
                    topic = %self.settings.audit_topic,
                    key = %key,
                    action = %event.action,
                    "published audit event"
                );
                Ok(())
            }
            RetryOutcome::Exhausted(e) => {
                tracing::error!(
                    key = %key,
                    error = %e,
                    "failed to publish audit event after retries, escalating to dead letter topic"
                );
                self.try_send_to_dead_letter(event, &e).await;
                Err(e.into())
            }
        }
    }

    /// Enrollment audit over the composite `"<studentId>-<careerId>"` id,
    /// attributed to the system actor.
    pub async fn publish_enrollment_audit(
        &self,
        student_id: &str,
        career_id: &str,
        action: AuditAction,
        additional_data: Option<String>,
    ) -> Result<(), PublishError> {
        let mut event = AuditEvent::enrollment(student_id, career_id, action);
        if let Some(additional_data) = additional_data {
            event = event.with_additional_data(additional_data);
        }
        self.publish_audit_event(&event).await
    }

    pub async fn publish_student_audit(
        &self,
        student_id: &str,
        action: AuditAction,
        old_values: Option<String>,
        new_values: Option<String>,
    ) -> Result<(), PublishError> {
        let mut event = AuditEvent::student(student_id, action);
        if let Some(old_values) = old_values {
            event = event.with_old_values(old_values);
        }
        if let Some(new_values) = new_values {
            event = event.with_new_values(new_values);
        }
        self.publish_audit_event(&event).await
    }

    /// Fan out every publish concurrently; all of them are attempted, and
    /// the first failure surfaces once the whole batch has settled.
    pub async fn publish_bulk_audit_events(
        &self,
        events: &[AuditEvent],
    ) -> Result<(), PublishError> {
        let results = join_all(events.iter().map(|event| self.publish_audit_event(event))).await;
        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &str,
        headers: OwnedHeaders,
    ) -> Result<(), KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers);
        self.producer
            .send(
                record,
                Timeout::After(Duration::from_millis(self.settings.message_timeout_ms)),
            )
            .await
            .map(|_| ())
            .map_err(|(e, _)| e)
    }

    /// Re-emit the event, annotated with the failure, onto the dead-letter
    /// topic. A failure here is logged; the caller still receives the
    /// original publish error.
    async fn try_send_to_dead_letter(&self, event: &AuditEvent, error: &KafkaError) {
        let annotated = event.annotate_error(&error.to_string());
        let key = annotated.dead_letter_key();

        let payload = match serde_json::to_string(&annotated) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "could not serialize dead letter payload");
                return;
            }
        };

        let error_text = error.to_string();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "originalTopic",
                value: Some(&self.settings.audit_topic),
            })
            .insert(Header {
                key: "error",
                value: Some(&error_text),
            })
            .insert(Header {
                key: "timestamp",
                value: Some(&now),
            });

        match self
            .send(&self.settings.dead_letter_topic, &key, &payload, headers)
            .await
        {
            Ok(()) => {
                self.metrics.audit_events_dead_lettered.inc();
                tracing::warn!(
                    topic = %self.settings.dead_letter_topic,
                    key = %key,
                    "sent failed audit event to dead letter topic"
                );
            }
            Err(e) => {
                tracing::error!(
                    topic = %self.settings.dead_letter_topic,
                    key = %key,
                    error = %e,
                    "failed to send audit event to dead letter topic"
                );
            }
        }
    }
}

fn audit_headers(event: &AuditEvent) -> OwnedHeaders {
    let timestamp = event
        .timestamp
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    let correlation_id = event.correlation_id.to_string();
    OwnedHeaders::new()
        .insert(Header {
            key: "eventType",
            value: Some(&event.event_type),
        })
        .insert(Header {
            key: "timestamp",
            value: Some(&timestamp),
        })
        .insert(Header {
            key: "correlationId",
            value: Some(&correlation_id),
        })
        .insert(Header {
            key: "source",
            value: Some(&event.source),
        })
}
