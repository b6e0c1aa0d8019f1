// ============================================================================
// Event Schemas
// ============================================================================
//
// Wire contracts for the two pipeline flows. Both serialize as flat,
// camelCase JSON records; a schemaVersion field is carried for evolution and
// defaults to 1 so unversioned payloads still parse.
//
// ============================================================================

mod audit;
mod notification;

pub use audit::{AuditAction, AuditEvent, AuditLogRecord};
pub use notification::{NotificationEvent, NotificationType};

pub(crate) const SCHEMA_VERSION: u32 = 1;

pub(crate) fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}
