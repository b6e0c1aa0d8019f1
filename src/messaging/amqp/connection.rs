use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::Mutex;

use crate::config::AmqpSettings;

// ============================================================================
// AMQP Connection Manager
// ============================================================================
//
// Owns the single shared connection + channel for the notification flow.
// Callers borrow the channel for one operation at a time; any caller that
// observes a closed channel triggers reinitialization under the lock before
// use. Construction failure at startup is fatal and propagated.
//
// ============================================================================

pub struct AmqpConnectionManager {
    settings: AmqpSettings,
    inner: Mutex<AmqpState>,
}

struct AmqpState {
    // Held so the connection outlives the channel carved out of it.
    _connection: Connection,
    channel: Channel,
}

impl AmqpConnectionManager {
    /// Connect and declare the notification topology. Fails startup when
    /// the broker is unreachable.
    pub async fn connect(settings: AmqpSettings) -> Result<Self, lapin::Error> {
        let state = Self::initialize(&settings).await?;
        Ok(Self {
            settings,
            inner: Mutex::new(state),
        })
    }

    async fn initialize(settings: &AmqpSettings) -> Result<AmqpState, lapin::Error> {
        let connection =
            Connection::connect(&settings.url(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &settings.exchange_name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let bindings = [
            (&settings.enrollment_queue, &settings.enrollment_routing_key),
            (
                &settings.unenrollment_queue,
                &settings.unenrollment_routing_key,
            ),
        ];
        for (queue, routing_key) in bindings {
            channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            channel
                .queue_bind(
                    queue,
                    &settings.exchange_name,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        tracing::info!(
            exchange = %settings.exchange_name,
            host = %settings.host,
            "AMQP connection initialized"
        );

        Ok(AmqpState {
            _connection: connection,
            channel,
        })
    }

    /// Borrow a live channel, reinitializing the connection first if the
    /// shared one has closed. Safe for concurrent callers; the returned
    /// handle is used for a single operation and never closed by the caller.
    pub async fn channel(&self) -> Result<Channel, lapin::Error> {
        let mut state = self.inner.lock().await;
        if !state.channel.status().connected() {
            tracing::warn!("AMQP channel closed, reinitializing connection");
            *state = Self::initialize(&self.settings).await?;
        }
        Ok(state.channel.clone())
    }
}
