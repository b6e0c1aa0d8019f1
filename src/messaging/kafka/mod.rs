mod provisioner;
mod publisher;

pub use provisioner::{TopicProvisioner, TopicSpec};
pub use publisher::AuditPublisher;
