pub mod amqp;
pub mod client;
pub mod memory;
pub mod message;

pub use client::{CallState, CorrelationClient, CorrelationToken};
pub use message::{JobReply, JobRequest};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker channel error: {0}")]
    Channel(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("acknowledge failed: {0}")]
    Ack(String),

    #[error("invalid message payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("reply wait cancelled")]
    Cancelled,

    #[error("reply queue closed before a reply arrived")]
    ReplyQueueClosed,
}

/// Transport-level properties carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl BrokerMessage {
    pub fn json<T: serde::Serialize>(
        payload: &T,
        properties: MessageProperties,
    ) -> Result<Self, BrokerError> {
        Ok(Self {
            body: serde_json::to_vec(payload)?,
            properties: MessageProperties {
                content_type: Some("application/json".to_string()),
                ..properties
            },
        })
    }
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
}

/// A work-queue message awaiting manual acknowledgment.
pub struct Delivery {
    pub message: BrokerMessage,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: BrokerMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A consuming, server-named, exclusive, auto-delete queue owned by one caller.
#[async_trait]
pub trait ReplySubscription: Send {
    fn queue_name(&self) -> &str;

    /// Next message on the queue; `None` once the consumer is gone.
    async fn next_message(&mut self) -> Option<Result<BrokerMessage, BrokerError>>;

    /// Cancels the consumer and closes its channel, which deletes the queue.
    async fn close(self: Box<Self>) -> Result<(), BrokerError>;
}

/// The broker operations the gateway and the worker rely on.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Declares the durable fan-out exchange. Redeclaring is a no-op.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Declares a private reply queue on a fresh channel and attaches a consumer
    /// before returning, so nothing published to it afterwards can be missed.
    async fn open_reply_queue(&self) -> Result<Box<dyn ReplySubscription>, BrokerError>;

    /// Publishes to `exchange`; the empty name is the default exchange, which
    /// routes by queue name.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<(), BrokerError>;

    /// Declares the durable work queue, binds it to `exchange` and consumes it
    /// with manual acknowledgment and the given prefetch.
    async fn consume_work_queue(
        &self,
        exchange: &str,
        queue: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Closes the underlying connection, if there is one.
    async fn shutdown(&self) {}
}
