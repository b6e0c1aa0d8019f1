use std::sync::Arc;

use lapin::{options::BasicPublishOptions, BasicProperties};

use crate::config::AmqpSettings;
use crate::events::{NotificationEvent, NotificationType};
use crate::messaging::PublishError;
use crate::metrics::Metrics;

use super::AmqpConnectionManager;

// ============================================================================
// Notification Publisher
// ============================================================================

pub struct NotificationPublisher {
    connection: Arc<AmqpConnectionManager>,
    settings: AmqpSettings,
    metrics: Arc<Metrics>,
}

impl NotificationPublisher {
    pub fn new(
        connection: Arc<AmqpConnectionManager>,
        settings: AmqpSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            connection,
            settings,
            metrics,
        }
    }

    pub async fn publish_enrollment_notification(
        &self,
        mut event: NotificationEvent,
    ) -> Result<(), PublishError> {
        event.notification_type = NotificationType::Enrollment;
        let routing_key = self.settings.enrollment_routing_key.clone();
        self.publish(&event, &routing_key).await
    }

    pub async fn publish_unenrollment_notification(
        &self,
        mut event: NotificationEvent,
    ) -> Result<(), PublishError> {
        event.notification_type = NotificationType::Unenrollment;
        let routing_key = self.settings.unenrollment_routing_key.clone();
        self.publish(&event, &routing_key).await
    }

    async fn publish(
        &self,
        event: &NotificationEvent,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(event)?;

        // Persistent delivery so the message survives a broker restart.
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_message_id(event.message_id.to_string().into())
            .with_timestamp(event.created_at.timestamp() as u64)
            .with_content_type("application/json".into());

        let result = async {
            let channel = self.connection.channel().await?;
            channel
                .basic_publish(
                    &self.settings.exchange_name,
                    routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await?
                .await?;
            Ok::<(), lapin::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.metrics
                    .notifications_published
                    .with_label_values(&[routing_key])
                    .inc();
                tracing::info!(
                    message_id = %event.message_id,
                    routing_key = %routing_key,
                    student_email = %event.student_email,
                    "published notification event"
                );
                Ok(())
            }
            Err(e) => {
                // The enclosing business transaction is already committed;
                // the caller decides whether the notification step failing
                // is reported on its own.
                tracing::error!(
                    message_id = %event.message_id,
                    routing_key = %routing_key,
                    student_email = %event.student_email,
                    error = %e,
                    "failed to publish notification event"
                );
                Err(e.into())
            }
        }
    }
}
