use std::collections::HashSet;
use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::types::RDKafkaErrorCode;
use tokio::sync::watch;

use crate::config::KafkaSettings;

// ============================================================================
// Topic Provisioner
// ============================================================================
//
// Runs once at startup, before the audit consumer attaches. Creates the
// audit and dead-letter topics when missing; re-running against an existing
// topology is a logged no-op. Provisioning is best-effort: a broker outage
// here must not keep the rest of the process from serving, so every failure
// is logged and swallowed, and the whole pass is bounded by a timeout plus
// the shutdown signal.
//
// ============================================================================

const PROVISION_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub retention_ms: String,
    pub compression: &'static str,
    pub max_message_bytes: Option<String>,
}

/// The topics this pipeline requires, with their partitioning and retention.
pub fn required_topics(settings: &KafkaSettings) -> Vec<TopicSpec> {
    vec![
        // Multiple partitions for throughput; keyed per entity for ordering.
        TopicSpec {
            name: settings.audit_topic.clone(),
            partitions: settings.audit_topic_partitions,
            retention_ms: settings.audit_retention_ms.to_string(),
            compression: "snappy",
            max_message_bytes: Some("1048576".to_string()),
        },
        // Single partition, longer retention so failures can be inspected.
        TopicSpec {
            name: settings.dead_letter_topic.clone(),
            partitions: 1,
            retention_ms: settings.dead_letter_retention_ms.to_string(),
            compression: "snappy",
            max_message_bytes: None,
        },
    ]
}

/// Topics still to be created given what the broker already has.
pub fn plan_missing(required: Vec<TopicSpec>, existing: &HashSet<String>) -> Vec<TopicSpec> {
    required
        .into_iter()
        .filter(|spec| !existing.contains(&spec.name))
        .collect()
}

pub struct TopicProvisioner {
    settings: KafkaSettings,
}

impl TopicProvisioner {
    pub fn new(settings: KafkaSettings) -> Self {
        Self { settings }
    }

    /// Provision under the combined timeout + shutdown guard. Never fails
    /// the caller.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            outcome = tokio::time::timeout(PROVISION_TIMEOUT, self.provision()) => {
                match outcome {
                    Ok(Ok(())) => {
                        tracing::info!("Kafka topics provisioned");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Kafka topic provisioning failed, continuing without it");
                    }
                    Err(_) => {
                        tracing::warn!("Kafka topic provisioning timed out, continuing without blocking startup");
                    }
                }
            }
            _ = shutdown.changed() => {
                tracing::warn!("Kafka topic provisioning cancelled during shutdown");
            }
        }
    }

    async fn provision(&self) -> anyhow::Result<()> {
        let admin: AdminClient<DefaultClientContext> = self.settings.admin_config().create()?;

        let metadata = admin.inner().fetch_metadata(None, METADATA_TIMEOUT)?;
        let existing: HashSet<String> = metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect();

        let missing = plan_missing(required_topics(&self.settings), &existing);
        if missing.is_empty() {
            tracing::info!("all required Kafka topics already exist");
            return Ok(());
        }

        let new_topics: Vec<NewTopic<'_>> = missing
            .iter()
            .map(|spec| {
                let mut topic =
                    NewTopic::new(&spec.name, spec.partitions, TopicReplication::Fixed(1))
                        .set("retention.ms", &spec.retention_ms)
                        .set("compression.type", spec.compression);
                if let Some(max_bytes) = &spec.max_message_bytes {
                    topic = topic.set("max.message.bytes", max_bytes);
                }
                topic
            })
            .collect();

        let options = AdminOptions::new()
            .operation_timeout::<rdkafka::util::Timeout>(Some(METADATA_TIMEOUT.into()));
        let results = admin.create_topics(new_topics.iter(), &options).await?;

        for result in results {
            match result {
                Ok(topic) => {
                    tracing::info!(topic = %topic, "created Kafka topic");
                }
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    // Another instance won the race; still a success.
                    tracing::info!(topic = %topic, "Kafka topic already exists");
                }
                Err((topic, code)) => {
                    tracing::error!(topic = %topic, error = %code, "failed to create Kafka topic");
                }
            }
        }

        self.verify(&admin);
        Ok(())
    }

    /// Log the partition counts actually visible after creation.
    fn verify(&self, admin: &AdminClient<DefaultClientContext>) {
        let metadata = match admin.inner().fetch_metadata(None, METADATA_TIMEOUT) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, "could not verify Kafka topics after creation");
                return;
            }
        };

        for spec in required_topics(&self.settings) {
            match metadata.topics().iter().find(|t| t.name() == spec.name) {
                Some(topic) => {
                    tracing::info!(
                        topic = %spec.name,
                        partitions = topic.partitions().len(),
                        "verified Kafka topic"
                    );
                }
                None => {
                    tracing::warn!(topic = %spec.name, "Kafka topic not visible after creation");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SaslMechanism, SecurityProtocol};

    fn settings() -> KafkaSettings {
        KafkaSettings {
            bootstrap_servers: "localhost:9092".into(),
            security_protocol: SecurityProtocol::Plaintext,
            sasl_mechanism: SaslMechanism::Plain,
            sasl_username: None,
            sasl_password: String::new(),
            audit_topic: "university.audit.events".into(),
            dead_letter_topic: "university.audit.events.dlq".into(),
            audit_topic_partitions: 3,
            audit_retention_ms: 604_800_000,
            dead_letter_retention_ms: 2_592_000_000,
            message_timeout_ms: 5000,
            retry_backoff_ms: 1000,
            retries: 3,
            enable_idempotence: true,
            group_id: "university-audit-consumer".into(),
            auto_offset_reset: "earliest".into(),
            enable_auto_commit: false,
            session_timeout_ms: 30_000,
            max_poll_interval_ms: 300_000,
        }
    }

    #[test]
    fn required_topics_cover_audit_and_dead_letter() {
        let topics = required_topics(&settings());
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].name, "university.audit.events");
        assert_eq!(topics[0].partitions, 3);
        assert_eq!(topics[1].name, "university.audit.events.dlq");
        assert_eq!(topics[1].partitions, 1);
        // Dead letters are kept longer than the main log.
        let audit_retention: u64 = topics[0].retention_ms.parse().unwrap();
        let dlq_retention: u64 = topics[1].retention_ms.parse().unwrap();
        assert!(dlq_retention > audit_retention);
    }

    #[test]
    fn plan_creates_only_missing_topics() {
        let existing: HashSet<String> = ["university.audit.events".to_string()].into();
        let plan = plan_missing(required_topics(&settings()), &existing);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "university.audit.events.dlq");
    }

    #[test]
    fn plan_is_empty_once_everything_exists() {
        // Planning again after a full create pass is a no-op, which is what
        // makes re-running the provisioner idempotent.
        let existing: HashSet<String> = required_topics(&settings())
            .into_iter()
            .map(|spec| spec.name)
            .collect();
        assert!(plan_missing(required_topics(&settings()), &existing).is_empty());
    }
}
