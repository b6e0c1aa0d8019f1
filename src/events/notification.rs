use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::default_schema_version;

// ============================================================================
// Notification Events
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationType {
    Enrollment,
    Unenrollment,
}

/// Message published when a student enrolls in or leaves a career.
///
/// `message_id` is unique per publish attempt and doubles as the broker
/// message identity; consumers must treat a redelivered id as a safe retry
/// (a duplicate email is accepted).
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub notification_type: NotificationType,
    pub student_email: String,
    pub student_name: String,
    pub student_dni: String,
    pub career_name: String,
    pub faculty_name: String,
    pub enrollment_date: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(
        notification_type: NotificationType,
        student_email: impl Into<String>,
        student_name: impl Into<String>,
        student_dni: impl Into<String>,
        career_name: impl Into<String>,
        faculty_name: impl Into<String>,
        enrollment_date: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            created_at: Utc::now(),
            schema_version: super::SCHEMA_VERSION,
            notification_type,
            student_email: student_email.into(),
            student_name: student_name.into(),
            student_dni: student_dni.into(),
            career_name: career_name.into(),
            faculty_name: faculty_name.into(),
            enrollment_date,
        }
    }

    /// Enrollment date as shown in outbound emails.
    pub fn enrollment_date_display(&self) -> String {
        self.enrollment_date.format("%d/%m/%Y").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NotificationEvent {
        NotificationEvent::new(
            NotificationType::Enrollment,
            "a@b.com",
            "Ada Lovelace",
            "12345678",
            "CS",
            "Engineering",
            Utc::now(),
        )
    }

    #[test]
    fn serializes_with_camel_case_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("messageId"));
        assert!(object.contains_key("createdAt"));
        assert!(object.contains_key("notificationType"));
        assert!(object.contains_key("studentEmail"));
        assert!(object.contains_key("studentDni"));
        assert!(object.contains_key("careerName"));
        assert!(object.contains_key("facultyName"));
        assert!(object.contains_key("enrollmentDate"));
        assert_eq!(object["schemaVersion"], 1);
        assert_eq!(object["notificationType"], "Enrollment");
    }

    #[test]
    fn message_id_is_unique_per_creation() {
        assert_ne!(sample().message_id, sample().message_id);
    }

    #[test]
    fn parses_unversioned_payload() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json.as_object_mut().unwrap().remove("schemaVersion");
        let parsed: NotificationEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.schema_version, 1);
    }

    #[test]
    fn enrollment_date_uses_day_month_year() {
        let mut event = sample();
        event.enrollment_date = "2025-03-09T12:00:00Z".parse().unwrap();
        assert_eq!(event.enrollment_date_display(), "09/03/2025");
    }
}
