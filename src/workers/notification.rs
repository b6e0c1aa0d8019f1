use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use tokio::sync::watch;

use crate::config::AmqpSettings;
use crate::events::{NotificationEvent, NotificationType};
use crate::messaging::amqp::AmqpConnectionManager;
use crate::metrics::Metrics;
use crate::ports::EmailNotifier;
use crate::workers::Worker;

// ============================================================================
// Notification Consumer
// ============================================================================
//
// One logical consumer per queue, bound with manual acknowledgment. Each
// delivery moves Received -> Processing -> Acked | Rejected(no-requeue):
// a message that fails to deserialize or to notify is rejected without
// requeue and dropped after this single attempt.
//
// ============================================================================

const CONSUME_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// What to do with a delivery once processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Ack,
    Reject,
}

/// Message handling, separated from the broker plumbing so the ack/reject
/// semantics are testable without a channel.
pub(crate) struct NotificationProcessor {
    queue: String,
    kind: NotificationType,
    notifier: Arc<dyn EmailNotifier>,
    metrics: Arc<Metrics>,
}

impl NotificationProcessor {
    pub(crate) async fn handle_delivery(&self, payload: &[u8]) -> Disposition {
        let event: NotificationEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(
                    queue = %self.queue,
                    error = %e,
                    "failed to deserialize notification message, rejecting without requeue"
                );
                self.metrics
                    .notifications_rejected
                    .with_label_values(&[&self.queue])
                    .inc();
                return Disposition::Reject;
            }
        };

        let enrollment_date = event.enrollment_date_display();
        let result = match self.kind {
            NotificationType::Enrollment => {
                self.notifier
                    .send_enrollment_confirmation(
                        &event.student_email,
                        &event.student_name,
                        &event.career_name,
                        &enrollment_date,
                    )
                    .await
            }
            NotificationType::Unenrollment => {
                self.notifier
                    .send_enrollment_cancellation(
                        &event.student_email,
                        &event.student_name,
                        &event.career_name,
                        &enrollment_date,
                    )
                    .await
            }
        };

        match result {
            Ok(()) => {
                self.metrics
                    .notifications_consumed
                    .with_label_values(&[&self.queue])
                    .inc();
                tracing::info!(
                    message_id = %event.message_id,
                    student_email = %event.student_email,
                    "notification sent"
                );
                Disposition::Ack
            }
            Err(e) => {
                // One attempt only; the message is dropped rather than
                // requeued into an endless redelivery loop.
                tracing::error!(
                    message_id = %event.message_id,
                    student_email = %event.student_email,
                    error = %e,
                    "notification send failed, rejecting without requeue"
                );
                self.metrics
                    .notifications_rejected
                    .with_label_values(&[&self.queue])
                    .inc();
                Disposition::Reject
            }
        }
    }
}

pub struct NotificationWorker {
    name: String,
    connection: Arc<AmqpConnectionManager>,
    processor: NotificationProcessor,
}

impl NotificationWorker {
    pub fn enrollment(
        connection: Arc<AmqpConnectionManager>,
        settings: &AmqpSettings,
        notifier: Arc<dyn EmailNotifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: "notification-enrollment".to_string(),
            connection,
            processor: NotificationProcessor {
                queue: settings.enrollment_queue.clone(),
                kind: NotificationType::Enrollment,
                notifier,
                metrics,
            },
        }
    }

    pub fn unenrollment(
        connection: Arc<AmqpConnectionManager>,
        settings: &AmqpSettings,
        notifier: Arc<dyn EmailNotifier>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: "notification-unenrollment".to_string(),
            connection,
            processor: NotificationProcessor {
                queue: settings.unenrollment_queue.clone(),
                kind: NotificationType::Unenrollment,
                notifier,
                metrics,
            },
        }
    }
}

#[async_trait]
impl Worker for NotificationWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let channel = self.connection.channel().await?;
        let mut consumer = channel
            .basic_consume(
                &self.processor.queue,
                &self.name,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::info!(queue = %self.processor.queue, "notification consumer listening");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            match self.processor.handle_delivery(&delivery.data).await {
                                Disposition::Ack => {
                                    delivery.acker.ack(BasicAckOptions::default()).await?;
                                }
                                Disposition::Reject => {
                                    delivery
                                        .acker
                                        .nack(BasicNackOptions {
                                            requeue: false,
                                            ..Default::default()
                                        })
                                        .await?;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(
                                queue = %self.processor.queue,
                                error = %e,
                                "notification consume error"
                            );
                            self.processor
                                .metrics
                                .consumer_errors
                                .with_label_values(&[&self.name])
                                .inc();
                            tokio::time::sleep(CONSUME_ERROR_BACKOFF).await;
                        }
                        None => {
                            // The consumer stream only ends when the channel
                            // died underneath it; let the supervisor restart
                            // us against a fresh channel.
                            anyhow::bail!("consumer stream closed for queue {}", self.processor.queue);
                        }
                    }
                }
            }
        }

        tracing::info!(queue = %self.processor.queue, "notification consumer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        confirmations: Mutex<Vec<(String, String, String, String)>>,
        cancellations: Mutex<Vec<(String, String, String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl EmailNotifier for RecordingNotifier {
        async fn send_enrollment_confirmation(
            &self,
            email: &str,
            name: &str,
            career: &str,
            enrollment_date: &str,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("smtp unavailable");
            }
            self.confirmations.lock().await.push((
                email.to_string(),
                name.to_string(),
                career.to_string(),
                enrollment_date.to_string(),
            ));
            Ok(())
        }

        async fn send_enrollment_cancellation(
            &self,
            email: &str,
            name: &str,
            career: &str,
            enrollment_date: &str,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("smtp unavailable");
            }
            self.cancellations.lock().await.push((
                email.to_string(),
                name.to_string(),
                career.to_string(),
                enrollment_date.to_string(),
            ));
            Ok(())
        }
    }

    fn processor(kind: NotificationType, notifier: Arc<RecordingNotifier>) -> NotificationProcessor {
        NotificationProcessor {
            queue: "enrollment.notifications".to_string(),
            kind,
            notifier,
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn sample_payload() -> Vec<u8> {
        let event = NotificationEvent::new(
            NotificationType::Enrollment,
            "a@b.com",
            "Ada Lovelace",
            "12345678",
            "CS",
            "Engineering",
            Utc::now(),
        );
        serde_json::to_vec(&event).unwrap()
    }

    #[tokio::test]
    async fn valid_enrollment_message_is_acked_and_notifies() {
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = processor(NotificationType::Enrollment, notifier.clone());

        let disposition = processor.handle_delivery(&sample_payload()).await;

        assert_eq!(disposition, Disposition::Ack);
        let confirmations = notifier.confirmations.lock().await;
        assert_eq!(confirmations.len(), 1);
        assert_eq!(confirmations[0].0, "a@b.com");
        assert_eq!(confirmations[0].2, "CS");
    }

    #[tokio::test]
    async fn unenrollment_message_triggers_cancellation() {
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = processor(NotificationType::Unenrollment, notifier.clone());

        let disposition = processor.handle_delivery(&sample_payload()).await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(notifier.cancellations.lock().await.len(), 1);
        assert!(notifier.confirmations.lock().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_message_is_rejected_without_notifying() {
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = processor(NotificationType::Enrollment, notifier.clone());

        let disposition = processor.handle_delivery(b"not json at all").await;

        assert_eq!(disposition, Disposition::Reject);
        assert!(notifier.confirmations.lock().await.is_empty());
    }

    #[tokio::test]
    async fn notifier_failure_rejects_after_single_attempt() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let processor = processor(NotificationType::Enrollment, notifier.clone());

        let disposition = processor.handle_delivery(&sample_payload()).await;

        assert_eq!(disposition, Disposition::Reject);
        assert!(notifier.confirmations.lock().await.is_empty());
    }
}
