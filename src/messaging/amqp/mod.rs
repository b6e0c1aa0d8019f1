mod connection;
mod publisher;

pub use connection::AmqpConnectionManager;
pub use publisher::NotificationPublisher;
