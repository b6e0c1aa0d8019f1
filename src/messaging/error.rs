// ============================================================================
// Pipeline Error Taxonomy
// ============================================================================

/// Failure to hand an event to a broker.
///
/// Publish failures never abort the business transaction that produced the
/// event; callers log them and decide whether to surface the notification
/// step separately.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("amqp transport error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("kafka transport error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Failure while processing a consumed audit message.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// The payload did not deserialize; the message is skipped, never
    /// crashing the worker loop.
    #[error("malformed audit payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The audit store rejected the record; re-raised so the supervisor
    /// observes it.
    #[error("audit store rejected record: {0}")]
    Store(#[source] anyhow::Error),
}
