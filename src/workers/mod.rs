// ============================================================================
// Background Workers
// ============================================================================
//
// Long-running consumer loops, run as explicit tokio tasks under the
// supervisor. One worker per notification queue plus one audit consumer;
// all of them honor the shared shutdown signal and are restarted by the
// supervisor when they crash.
//
// ============================================================================

mod audit;
mod notification;
mod supervisor;

pub use audit::AuditConsumerWorker;
pub use notification::NotificationWorker;
pub use supervisor::{SupervisionStrategy, Supervisor, Worker};
