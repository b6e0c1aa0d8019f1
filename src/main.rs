use std::sync::Arc;

use chrono::Utc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod events;
mod messaging;
mod metrics;
mod ports;
mod utils;
mod workers;

use config::Settings;
use events::{AuditAction, NotificationEvent, NotificationType};
use messaging::amqp::{AmqpConnectionManager, NotificationPublisher};
use messaging::kafka::{AuditPublisher, TopicProvisioner};
use ports::{InMemoryAuditStore, LoggingEmailNotifier};
use workers::{AuditConsumerWorker, NotificationWorker, Supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Structured logging with environment-based filtering; override with
    // RUST_LOG, e.g. RUST_LOG=debug.
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,university_events=debug")),
        )
        .init();

    tracing::info!("starting university event pipeline");

    // Config errors are fatal: a typo in a security protocol must fail
    // startup, not a publish deep inside the broker client.
    let settings = Settings::from_env()?;

    let metrics = Arc::new(metrics::Metrics::new()?);

    // Metrics server on its own thread with its own actix system.
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = settings.metrics_port;
    std::thread::spawn(move || {
        actix_web::rt::System::new().block_on(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_registry, metrics_port).await {
                tracing::error!(error = %e, "metrics server error");
            }
        })
    });

    let mut supervisor = Supervisor::new();

    // Best-effort: topic provisioning never blocks startup.
    let provisioner = TopicProvisioner::new(settings.kafka.clone());
    provisioner.run(supervisor.shutdown_signal()).await;

    // The notification broker being unreachable at startup is fatal; the
    // service should fail fast rather than run degraded.
    let amqp = Arc::new(AmqpConnectionManager::connect(settings.amqp.clone()).await?);

    let notification_publisher = Arc::new(NotificationPublisher::new(
        amqp.clone(),
        settings.amqp.clone(),
        metrics.clone(),
    ));
    let audit_publisher = Arc::new(AuditPublisher::new(settings.kafka.clone(), metrics.clone())?);

    // External collaborators at their port boundaries; real SMTP and the
    // durable audit store live outside this pipeline.
    let notifier = Arc::new(LoggingEmailNotifier);
    let audit_store = Arc::new(InMemoryAuditStore::new());

    supervisor.spawn(Arc::new(NotificationWorker::enrollment(
        amqp.clone(),
        &settings.amqp,
        notifier.clone(),
        metrics.clone(),
    )));
    supervisor.spawn(Arc::new(NotificationWorker::unenrollment(
        amqp.clone(),
        &settings.amqp,
        notifier.clone(),
        metrics.clone(),
    )));
    supervisor.spawn(Arc::new(AuditConsumerWorker::new(
        settings.kafka.clone(),
        audit_store.clone(),
        metrics.clone(),
    )));

    tracing::info!("pipeline workers started");

    // Demonstrate one enrollment flowing through both pipelines.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    let notification = NotificationEvent::new(
        NotificationType::Enrollment,
        "ada.lovelace@university.edu",
        "Ada Lovelace",
        "12345678",
        "Computer Science",
        "Engineering",
        Utc::now(),
    );
    if let Err(e) = notification_publisher
        .publish_enrollment_notification(notification)
        .await
    {
        tracing::error!(error = %e, "demo notification publish failed");
    }

    if let Err(e) = audit_publisher
        .publish_enrollment_audit("1", "10", AuditAction::Enroll, Some("demo enrollment".into()))
        .await
    {
        tracing::error!(error = %e, "demo audit publish failed");
    }

    tracing::info!("pipeline running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    supervisor.shutdown().await;
    tracing::info!(
        audit_records = audit_store.len().await,
        "university event pipeline stopped"
    );

    Ok(())
}
