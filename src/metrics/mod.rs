mod server;

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

pub use server::start_metrics_server;

// ============================================================================
// Metrics - Prometheus counters for the event pipeline
// ============================================================================
//
// Pipeline failures never surface to the synchronous business caller, so
// these counters (plus the logs) are how the pipeline is observed:
// - notification publish/consume/reject volume per queue
// - audit publish/persist/dead-letter volume
// - consumer loop errors per worker
//
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Notification flow
    pub notifications_published: IntCounterVec,
    pub notifications_consumed: IntCounterVec,
    pub notifications_rejected: IntCounterVec,

    // Audit flow
    pub audit_events_published: IntCounter,
    pub audit_events_persisted: IntCounter,
    pub audit_events_dead_lettered: IntCounter,

    // Worker loops
    pub consumer_errors: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let notifications_published = IntCounterVec::new(
            Opts::new(
                "notifications_published_total",
                "Notification events published to the exchange",
            ),
            &["routing_key"],
        )?;
        registry.register(Box::new(notifications_published.clone()))?;

        let notifications_consumed = IntCounterVec::new(
            Opts::new(
                "notifications_consumed_total",
                "Notification events consumed and acknowledged",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(notifications_consumed.clone()))?;

        let notifications_rejected = IntCounterVec::new(
            Opts::new(
                "notifications_rejected_total",
                "Notification events rejected without requeue",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(notifications_rejected.clone()))?;

        let audit_events_published = IntCounter::new(
            "audit_events_published_total",
            "Audit events appended to the audit topic",
        )?;
        registry.register(Box::new(audit_events_published.clone()))?;

        let audit_events_persisted = IntCounter::new(
            "audit_events_persisted_total",
            "Audit events persisted to the audit store",
        )?;
        registry.register(Box::new(audit_events_persisted.clone()))?;

        let audit_events_dead_lettered = IntCounter::new(
            "audit_events_dead_lettered_total",
            "Audit events escalated to the dead letter topic",
        )?;
        registry.register(Box::new(audit_events_dead_lettered.clone()))?;

        let consumer_errors = IntCounterVec::new(
            Opts::new("consumer_errors_total", "Broker-level consumer errors"),
            &["worker"],
        )?;
        registry.register(Box::new(consumer_errors.clone()))?;

        Ok(Self {
            registry,
            notifications_published,
            notifications_consumed,
            notifications_rejected,
            audit_events_published,
            audit_events_persisted,
            audit_events_dead_lettered,
            consumer_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_pipeline_counters() {
        let metrics = Metrics::new().unwrap();
        metrics
            .notifications_published
            .with_label_values(&["enrollment.created"])
            .inc();
        metrics.audit_events_published.inc();

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"notifications_published_total".to_string()));
        assert!(names.contains(&"audit_events_published_total".to_string()));
    }
}
