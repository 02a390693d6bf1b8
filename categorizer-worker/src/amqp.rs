//! RabbitMQ implementation of the broker operations, on top of lapin.
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tracing::{debug, info};

use crate::broker::{BrokerError, Connector, Delivery, DeliveryTag, Session, Topology};

/// AMQP delivery mode marking a message as persistent.
const PERSISTENT: u8 = 2;

const DURABLE_EXCHANGE: ExchangeDeclareOptions = ExchangeDeclareOptions {
    passive: false,
    durable: true,
    auto_delete: false,
    internal: false,
    nowait: false,
};

const DURABLE_QUEUE: QueueDeclareOptions = QueueDeclareOptions {
    passive: false,
    durable: true,
    exclusive: false,
    auto_delete: false,
    nowait: false,
};

pub struct AmqpConnector {
    uri: String,
    /// Broker address without credentials, for logging.
    address: String,
    consumer_tag: String,
}

impl AmqpConnector {
    pub fn new(uri: String, address: String, consumer_tag: &str) -> Self {
        Self {
            uri,
            address,
            consumer_tag: consumer_tag.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self) -> Result<AmqpSession, BrokerError> {
        info!("connecting to RabbitMQ at {}...", self.address);

        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        // Publisher confirms: a publish only succeeds once the broker has taken the message.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        info!("connected to RabbitMQ at {}", self.address);

        Ok(AmqpSession {
            connection,
            channel,
            consumer: None,
            consumer_tag: self.consumer_tag.clone(),
        })
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
    consumer_tag: String,
}

impl AmqpSession {
    async fn declare_dead_letter(&self, exchange: &str, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                DURABLE_EXCHANGE,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        self.channel
            .queue_declare(queue, DURABLE_QUEUE, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        self.channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut queue_arguments = FieldTable::default();

        if let (Some(exchange), Some(queue)) = (
            topology.dead_letter_exchange.as_ref(),
            topology.dead_letter_queue(),
        ) {
            self.declare_dead_letter(exchange, &queue).await?;
            queue_arguments.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(exchange.clone().into()),
            );
        }

        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Topic,
                DURABLE_EXCHANGE,
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        self.channel
            .queue_declare(&topology.queue, DURABLE_QUEUE, queue_arguments)
            .await
            .map_err(|e| BrokerError::Topology(e.to_string()))?;

        for key in &topology.binding_keys {
            self.channel
                .queue_bind(
                    &topology.queue,
                    &topology.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Topology(e.to_string()))?;
        }

        debug!(
            exchange = %topology.exchange,
            queue = %topology.queue,
            "declared topology"
        );

        Ok(())
    }

    async fn consume(&mut self, queue: &str, prefetch: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        self.consumer = Some(consumer);

        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let consumer = self.consumer.as_mut()?;

        match consumer.next().await? {
            Ok(mut delivery) => Some(Ok(Delivery {
                tag: DeliveryTag(delivery.delivery_tag),
                routing_key: delivery.routing_key.as_str().to_owned(),
                redelivered: delivery.redelivered,
                body: std::mem::take(&mut delivery.data),
            })),
            Err(e) => Some(Err(BrokerError::Stream(e.to_string()))),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish(
                "broker did not confirm the message".to_owned(),
            ));
        }

        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag.0, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle {
                tag,
                reason: e.to_string(),
            })
    }

    async fn reject(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(tag.0, BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| BrokerError::Settle {
                tag,
                reason: e.to_string(),
            })
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.consumer = None;

        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(200, "worker shutting down")
            .await
            .map_err(|e| BrokerError::Close(e.to_string()))
    }
}
