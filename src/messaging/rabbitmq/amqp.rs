use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, ExchangeConfig, ExchangeKind, QosConfig, QueueConfig};
use crate::messaging::protocol::{Delivery, MessageProperties};
use crate::messaging::rabbitmq::error::{BrokerError, BrokerResult};
use crate::messaging::rabbitmq::transport::{
    BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryStream, Transport,
};

/// 以 lapin 實現的 AMQP 0-9-1 傳輸
#[derive(Clone, Debug, Default)]
pub struct AmqpTransport {
    connection_name: Option<String>,
}

impl AmqpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設置在 RabbitMQ 管理介面中顯示的連接名稱
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, config: &BrokerConfig) -> BrokerResult<Arc<dyn BrokerConnection>> {
        info!(uri = %config.redacted_uri(), "Connecting to RabbitMQ");

        let mut properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current());
        if let Some(name) = &self.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let uri = config.amqp_uri();
        let connection = tokio::time::timeout(
            config.connection_timeout(),
            Connection::connect(&uri, properties),
        )
        .await
        .map_err(|_| {
            BrokerError::connection(format!(
                "connecting to {} timed out after {:?}",
                config.redacted_uri(),
                config.connection_timeout()
            ))
        })?
        .map_err(|e| BrokerError::from_lapin(&config.redacted_uri(), e))?;

        debug!("Successfully connected to RabbitMQ");
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::from_lapin("channel", e))?;
        debug!(channel_id = channel.id(), "Created channel");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| BrokerError::from_lapin("connection", e))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(content_type.clone().into());
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(delivery_mode);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(reply_to.clone().into());
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(message_id.clone().into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn message_properties(basic: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: basic.content_type().as_ref().map(|v| v.to_string()),
        delivery_mode: *basic.delivery_mode(),
        correlation_id: basic.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: basic.reply_to().as_ref().map(|v| v.to_string()),
        message_id: basic.message_id().as_ref().map(|v| v.to_string()),
        timestamp: *basic.timestamp(),
    }
}

fn delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: message_properties(&delivery.properties),
        data: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::from_lapin(&format!("exchange '{}'", exchange.name), e))
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> BrokerResult<String> {
        let declared = self
            .channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::from_lapin(&format!("queue '{}'", queue.name), e))?;
        Ok(declared.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::from_lapin(
                    &format!("binding '{}' -> '{}' ({})", exchange, queue, routing_key),
                    e,
                )
            })
    }

    async fn qos(&self, qos: &QosConfig) -> BrokerResult<()> {
        if qos.prefetch_size != 0 {
            warn!(
                prefetch_size = qos.prefetch_size,
                "prefetch_size is not supported by RabbitMQ, ignoring"
            );
        }
        self.channel
            .basic_qos(qos.prefetch_count, BasicQosOptions { global: qos.global })
            .await
            .map_err(|e| BrokerError::from_lapin("basic.qos", e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        // 不等待發佈確認
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| BrokerError::from_lapin(&format!("exchange '{}'", exchange), e))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::from_lapin(&format!("queue '{}'", queue), e))?;

        Ok(consumer
            .map(|result| result.map(delivery).map_err(BrokerError::from))
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::from_lapin("basic.cancel", e))
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::from_lapin("basic.ack", e))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| BrokerError::from_lapin("basic.nack", e))
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "closing")
            .await
            .map_err(|e| BrokerError::from_lapin("channel", e))
    }
}
