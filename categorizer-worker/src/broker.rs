//! The broker operations the worker relies on, independent of the AMQP client.
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to the broker: {0}")]
    Connect(String),
    #[error("failed to declare topology: {0}")]
    Topology(String),
    #[error("failed to start consuming: {0}")]
    Consume(String),
    #[error("failed to publish: {0}")]
    Publish(String),
    #[error("failed to settle delivery {tag}: {reason}")]
    Settle { tag: DeliveryTag, reason: String },
    #[error("delivery stream failed: {0}")]
    Stream(String),
    #[error("failed to close the session: {0}")]
    Close(String),
}

/// Broker-assigned tag correlating a delivery with its ack or reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// The exchange, queue and bindings shared with the producers of project events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Durable topic exchange, used both to consume and to publish.
    pub exchange: String,
    /// Durable work queue of this service.
    pub queue: String,
    pub binding_keys: Vec<String>,
    pub dead_letter_exchange: Option<String>,
}

impl Topology {
    /// Queue collecting rejected deliveries, if dead-lettering is enabled.
    pub fn dead_letter_queue(&self) -> Option<String> {
        self.dead_letter_exchange
            .as_ref()
            .map(|_| format!("{}.dead_letter", self.queue))
    }
}

/// Opens sessions with the broker. Called again after every lost session.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session, BrokerError>;
}

/// One connection and channel with the broker.
///
/// A session is driven by a single task, consuming and publishing on the same
/// channel. It is borrowed across await points while a delivery is processed,
/// hence `Sync`.
#[async_trait]
pub trait Session: Send + Sync {
    /// Declare exchange, queue and bindings. Must be idempotent.
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError>;

    /// Limit unacknowledged deliveries to `prefetch` and register as a consumer of `queue`.
    async fn consume(&mut self, queue: &str, prefetch: u16) -> Result<(), BrokerError>;

    /// Wait for the next delivery. `None` means the delivery stream has ended.
    /// Must be cancel safe: dropping the future must not lose a delivery.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Publish a persistent JSON message, returning once the broker accepted it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject without requeue.
    async fn reject(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}
