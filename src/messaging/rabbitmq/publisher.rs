use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::messaging::metrics::{MessagingMetrics, MetricType};
use crate::messaging::protocol::{DomainEvent, MessageProperties};
use crate::messaging::rabbitmq::connection::ConnectionManager;
use crate::messaging::rabbitmq::error::BrokerResult;

/// 單條消息的發佈選項
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// 未設置時自動生成
    pub message_id: Option<String>,
}

impl PublishOptions {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// 消息發布者
///
/// 所有消息以 JSON 編碼並設為持久化，發佈後不等待代理確認。
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    /// 創建新的消息發布者
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// 發佈消息到指定交換機
    pub async fn publish<T>(&self, exchange: &str, routing_key: &str, payload: &T) -> BrokerResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish_with(exchange, routing_key, payload, PublishOptions::default())
            .await
    }

    /// 以自訂屬性發佈消息
    pub async fn publish_with<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        options: PublishOptions,
    ) -> BrokerResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        // 序列化失敗屬於調用方錯誤，不需要連接代理
        let body = serde_json::to_vec(payload)?;

        let mut properties = MessageProperties::persistent_json().with_message_id(
            options
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        );
        if let Some(correlation_id) = options.correlation_id {
            properties = properties.with_correlation_id(correlation_id);
        }
        if let Some(reply_to) = options.reply_to {
            properties = properties.with_reply_to(reply_to);
        }

        self.send(exchange, routing_key, &body, &properties).await
    }

    /// 發佈領域事件到事件交換機，路由鍵為事件名稱
    pub async fn publish_event(&self, event: &DomainEvent) -> BrokerResult<()> {
        let exchange = self.connection.config().events_exchange.clone();
        self.publish(&exchange, event.routing_key(), event).await
    }

    /// 經由預設交換機把 RPC 回應送到請求方的回應佇列
    pub async fn publish_reply<T>(&self, reply_to: &str, correlation_id: &str, payload: &T) -> BrokerResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publish_with(
            "",
            reply_to,
            payload,
            PublishOptions::default().with_correlation_id(correlation_id),
        )
        .await
    }

    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        {
            let channel = self.connection.channel().await?;
            channel.publish(exchange, routing_key, body, properties).await?;
        }

        MessagingMetrics::record(MetricType::Published { exchange }, None);
        debug!(
            exchange,
            routing_key,
            bytes = body.len(),
            correlation_id = ?properties.correlation_id,
            "Published message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerConfig, QueueConfig};
    use crate::messaging::rabbitmq::error::BrokerError;
    use crate::messaging::rabbitmq::memory::InMemoryBroker;
    use crate::messaging::rabbitmq::transport::{ConsumeOptions, Transport};
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::HashMap;

    fn publisher(broker: &InMemoryBroker) -> (Publisher, Arc<ConnectionManager>) {
        let config = BrokerConfig::default().with_queue(QueueConfig::durable("orders").bind("order.*"));
        let connection = Arc::new(ConnectionManager::new(Arc::new(config), broker.transport()));
        (Publisher::new(connection.clone()), connection)
    }

    #[tokio::test]
    async fn test_publish_connects_lazily_and_marks_persistent() {
        let broker = InMemoryBroker::new();
        let (publisher, connection) = publisher(&broker);

        publisher
            .publish("events", "order.created", &json!({"order_id": 42}))
            .await
            .unwrap();
        assert!(connection.is_connected());
        assert_eq!(broker.message_count("orders"), 1);

        let transport = broker.transport();
        let consumer = transport.connect(connection.config()).await.unwrap();
        let channel = consumer.create_channel().await.unwrap();
        let mut stream = channel
            .consume("orders", "probe", &ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        assert!(delivery.properties.is_persistent());
        assert_eq!(delivery.properties.content_type.as_deref(), Some("application/json"));
        assert!(delivery.properties.message_id.is_some());
        assert_eq!(delivery.json_body().unwrap(), json!({"order_id": 42}));
    }

    #[tokio::test]
    async fn test_serialization_error_fails_before_connecting() {
        let broker = InMemoryBroker::new();
        let (publisher, connection) = publisher(&broker);
        let mut payload = HashMap::new();
        payload.insert((1, 2), "tuple keys are not valid JSON object keys");

        let result = publisher.publish("events", "order.created", &payload).await;

        assert_matches!(result, Err(BrokerError::Serialization(_)));
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_publish_event_uses_event_name_as_routing_key() {
        let broker = InMemoryBroker::new();
        let (publisher, _connection) = publisher(&broker);
        let event = DomainEvent::new("order.shipped", "orders").with_field("order_id", 7);

        publisher.publish_event(&event).await.unwrap();

        assert_eq!(broker.message_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let (publisher, _connection) = publisher(&broker);

        let result = publisher.publish("events", "order.created", &json!({})).await;

        assert_matches!(result, Err(BrokerError::Connection { .. }));
    }
}
