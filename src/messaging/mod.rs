// ============================================================================
// Messaging Infrastructure
// ============================================================================
//
// Broker-facing halves of both pipeline flows:
// - amqp/  - topic-routed notification exchange (connection manager,
//            notification publisher)
// - kafka/ - partitioned audit log (topic provisioner, audit publisher)
//
// The long-running consumer loops live in `workers`.
//
// ============================================================================

pub mod amqp;
pub mod kafka;

mod error;

pub use error::{ConsumeError, PublishError};
