use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::default_schema_version;

// ============================================================================
// Audit Events
// ============================================================================
//
// One event per mutating business operation, appended to the partitioned
// audit log. `entityName:entityId` is the partition key, so all events for
// one entity are observed in publish order by any single consumer.
//
// ============================================================================

const SYSTEM_ACTOR: &str = "System";
const EVENT_SOURCE: &str = "university-management";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Enroll,
    Unenroll,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuditAction::Create => "Create",
            AuditAction::Update => "Update",
            AuditAction::Delete => "Delete",
            AuditAction::Enroll => "Enroll",
            AuditAction::Unenroll => "Unenroll",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub event_type: String,
    pub entity_name: String,
    /// String form of the domain id; composite ids are `"<a>-<b>"`.
    pub entity_id: String,
    pub action: AuditAction,
    pub user_id: String,
    pub user_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_values: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_values: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_data: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub source: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        action: AuditAction,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_name: entity_name.into(),
            entity_id: entity_id.into(),
            action,
            user_id: SYSTEM_ACTOR.to_string(),
            user_name: SYSTEM_ACTOR.to_string(),
            old_values: None,
            new_values: None,
            additional_data: None,
            ip_address: String::new(),
            user_agent: String::new(),
            timestamp: Utc::now(),
            correlation_id: Uuid::new_v4(),
            source: EVENT_SOURCE.to_string(),
            schema_version: super::SCHEMA_VERSION,
        }
    }

    /// Enrollment audit over the composite StudentCareer entity.
    pub fn enrollment(student_id: &str, career_id: &str, action: AuditAction) -> Self {
        Self::new(
            "Enrollment",
            "StudentCareer",
            format!("{student_id}-{career_id}"),
            action,
        )
    }

    pub fn student(student_id: &str, action: AuditAction) -> Self {
        Self::new("Student", "Student", student_id, action)
    }

    pub fn with_actor(mut self, user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.user_name = user_name.into();
        self
    }

    pub fn with_old_values(mut self, old_values: impl Into<String>) -> Self {
        self.old_values = Some(old_values.into());
        self
    }

    pub fn with_new_values(mut self, new_values: impl Into<String>) -> Self {
        self.new_values = Some(new_values.into());
        self
    }

    pub fn with_additional_data(mut self, additional_data: impl Into<String>) -> Self {
        self.additional_data = Some(additional_data.into());
        self
    }

    pub fn with_client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = ip_address.into();
        self.user_agent = user_agent.into();
        self
    }

    /// Partitioning/ordering key: events sharing it land on one partition.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.entity_name, self.entity_id)
    }

    pub fn dead_letter_key(&self) -> String {
        format!("dead-letter:{}:{}", self.entity_name, self.entity_id)
    }

    /// Copy of the event annotated with the failure reason, for the
    /// dead-letter topic. Every original field value is preserved.
    pub fn annotate_error(&self, error: &str) -> AuditEvent {
        let mut annotated = self.clone();
        let original = self.additional_data.clone().unwrap_or_default();
        annotated.additional_data = Some(format!("Error: {error}. Original Data: {original}"));
        annotated
    }
}

// ============================================================================
// Persisted audit record
// ============================================================================

/// The record handed to the audit store by the consumer.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogRecord {
    pub id: Uuid,
    pub event_type: String,
    pub entity_name: String,
    pub entity_id: String,
    pub action: AuditAction,
    pub user_id: String,
    pub user_name: String,
    pub old_values: Option<String>,
    pub new_values: Option<String>,
    pub additional_data: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub source: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditLogRecord {
    pub fn from_event(event: &AuditEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event.event_type.clone(),
            entity_name: event.entity_name.clone(),
            entity_id: event.entity_id.clone(),
            action: event.action,
            user_id: event.user_id.clone(),
            user_name: event.user_name.clone(),
            old_values: event.old_values.clone(),
            new_values: event.new_values.clone(),
            additional_data: event.additional_data.clone(),
            ip_address: event.ip_address.clone(),
            user_agent: event.user_agent.clone(),
            occurred_at: event.timestamp,
            correlation_id: event.correlation_id,
            source: event.source.clone(),
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key_joins_entity_name_and_id() {
        let event = AuditEvent::new("Student", "Student", "42", AuditAction::Create);
        assert_eq!(event.partition_key(), "Student:42");
        assert_eq!(event.dead_letter_key(), "dead-letter:Student:42");
    }

    #[test]
    fn enrollment_uses_composite_entity_id() {
        let event = AuditEvent::enrollment("7", "12", AuditAction::Enroll);
        assert_eq!(event.entity_id, "7-12");
        assert_eq!(event.entity_name, "StudentCareer");
        assert_eq!(event.event_type, "Enrollment");
        assert_eq!(event.user_id, "System");
    }

    #[test]
    fn serializes_with_camel_case_field_names() {
        let event = AuditEvent::student("42", AuditAction::Update)
            .with_old_values("{\"dni\":\"1\"}")
            .with_new_values("{\"dni\":\"2\"}");
        let json = serde_json::to_value(&event).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("eventType"));
        assert!(object.contains_key("entityName"));
        assert!(object.contains_key("entityId"));
        assert!(object.contains_key("oldValues"));
        assert!(object.contains_key("newValues"));
        assert!(object.contains_key("correlationId"));
        assert_eq!(object["action"], "Update");
        // Unset optional snapshots are omitted from the wire record.
        assert!(!object.contains_key("additionalData"));
    }

    #[test]
    fn annotated_copy_preserves_every_original_field() {
        let original = AuditEvent::enrollment("7", "12", AuditAction::Enroll)
            .with_additional_data("manual enrollment");
        let annotated = original.annotate_error("broker unreachable");

        assert_eq!(annotated.entity_id, original.entity_id);
        assert_eq!(annotated.action, original.action);
        assert_eq!(annotated.correlation_id, original.correlation_id);
        assert_eq!(annotated.timestamp, original.timestamp);
        let data = annotated.additional_data.unwrap();
        assert!(data.contains("broker unreachable"));
        assert!(data.contains("manual enrollment"));
    }

    #[test]
    fn builder_overrides_actor_and_client_context() {
        let event = AuditEvent::student("42", AuditAction::Delete)
            .with_actor("u-77", "Registrar")
            .with_client("10.0.0.9", "Mozilla/5.0");
        assert_eq!(event.user_id, "u-77");
        assert_eq!(event.user_name, "Registrar");
        assert_eq!(event.ip_address, "10.0.0.9");
        assert_eq!(event.user_agent, "Mozilla/5.0");
    }

    #[test]
    fn parses_unversioned_payload() {
        let mut json = serde_json::to_value(AuditEvent::student("42", AuditAction::Create)).unwrap();
        json.as_object_mut().unwrap().remove("schemaVersion");
        let parsed: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.schema_version, 1);
    }

    #[test]
    fn record_copies_event_fields() {
        let event = AuditEvent::student("42", AuditAction::Create);
        let record = AuditLogRecord::from_event(&event);
        assert_eq!(record.entity_id, "42");
        assert_eq!(record.action, AuditAction::Create);
        assert_eq!(record.occurred_at, event.timestamp);
        assert_eq!(record.correlation_id, event.correlation_id);
    }
}
