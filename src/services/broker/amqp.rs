use super::{
    Acknowledger, BrokerError, BrokerMessage, BrokerTransport, Delivery, DeliveryStream,
    MessageProperties, ReplySubscription,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};
use tracing::{debug, info};
use uuid::Uuid;

const PERSISTENT: u8 = 2;

fn channel_err(e: lapin::Error) -> BrokerError {
    BrokerError::Channel(e.to_string())
}

fn properties_from(props: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: props.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: props.reply_to().as_ref().map(|s| s.as_str().to_string()),
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
    }
}

fn properties_into(props: MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default().with_delivery_mode(PERSISTENT);
    if let Some(content_type) = props.content_type {
        out = out.with_content_type(content_type.into());
    }
    if let Some(correlation_id) = props.correlation_id {
        out = out.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = props.reply_to {
        out = out.with_reply_to(reply_to.into());
    }
    out
}

/// AMQP 0-9-1 transport over one connection. Publishes go through a shared
/// confirm-mode channel; every reply queue and the work consumer get their own.
pub struct AmqpTransport {
    connection: Connection,
    publisher: Channel,
}

impl AmqpTransport {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let publisher = connection.create_channel().await.map_err(channel_err)?;
        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(channel_err)?;

        Ok(Self {
            connection,
            publisher,
        })
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

struct AmqpReplySubscription {
    channel: Channel,
    consumer: Consumer,
    queue: String,
    consumer_tag: String,
}

#[async_trait]
impl ReplySubscription for AmqpReplySubscription {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn next_message(&mut self) -> Option<Result<BrokerMessage, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| BrokerMessage {
                properties: properties_from(&delivery.properties),
                body: delivery.data,
            })
            .map_err(|e| BrokerError::Consume(e.to_string())),
        )
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        let cancelled = self
            .channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await;
        // Closing the channel also drops the consumer, so the auto-delete queue
        // goes away even when the cancel above failed.
        self.channel.close(200, "reply received").await.map_err(channel_err)?;
        cancelled.map_err(channel_err)
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.publisher
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)
    }

    async fn open_reply_queue(&self) -> Result<Box<dyn ReplySubscription>, BrokerError> {
        let channel = self.connection.create_channel().await.map_err(channel_err)?;

        let attached = async {
            let queue = channel
                .queue_declare(
                    "",
                    QueueDeclareOptions {
                        durable: false,
                        exclusive: true,
                        auto_delete: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            let queue = queue.name().as_str().to_string();
            let consumer_tag = format!("reply-{}", Uuid::new_v4().simple());
            let consumer = channel
                .basic_consume(
                    &queue,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_ack: true,
                        exclusive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            Ok::<_, lapin::Error>((queue, consumer_tag, consumer))
        }
        .await;

        match attached {
            Ok((queue, consumer_tag, consumer)) => {
                debug!("Reply queue {} consuming as {}", queue, consumer_tag);
                Ok(Box::new(AmqpReplySubscription {
                    channel,
                    consumer,
                    queue,
                    consumer_tag,
                }))
            }
            Err(e) => {
                let _ = channel.close(200, "reply queue setup failed").await;
                Err(BrokerError::Consume(e.to_string()))
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: BrokerMessage,
    ) -> Result<(), BrokerError> {
        let publish_err = |e: lapin::Error| BrokerError::Publish(e.to_string());

        let confirmation = self
            .publisher
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties_into(message.properties),
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "broker rejected message for exchange '{}'",
                exchange
            )));
        }
        Ok(())
    }

    async fn consume_work_queue(
        &self,
        exchange: &str,
        queue: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        let channel = self.connection.create_channel().await.map_err(channel_err)?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(channel_err)?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)?;
        channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_err)?;

        let consumer = channel
            .basic_consume(
                queue,
                "pcd-gateway-worker",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        info!("🐇 Consuming '{}' bound to '{}'", queue, exchange);

        // The channel travels with the stream so it stays open while deliveries
        // are still being acknowledged.
        let stream = futures::stream::unfold(
            (channel, consumer),
            |(channel, mut consumer)| async move {
                let next = consumer.next().await?;
                let item = next
                    .map(|delivery| {
                        let message = BrokerMessage {
                            properties: properties_from(&delivery.properties),
                            body: delivery.data,
                        };
                        Delivery::new(message, Box::new(AmqpAcker(delivery.acker)))
                    })
                    .map_err(|e| BrokerError::Consume(e.to_string()));
                Some((item, (channel, consumer)))
            },
        );
        Ok(stream.boxed())
    }

    async fn shutdown(&self) {
        if let Err(e) = self.connection.close(200, "shutdown").await {
            debug!("Broker connection close: {}", e);
        }
    }
}
