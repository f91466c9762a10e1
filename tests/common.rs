#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use service_broker::config::{BrokerConfig, ExchangeConfig, ExchangeKind, QueueConfig};
use service_broker::messaging::rabbitmq::InMemoryBroker;
use service_broker::messaging::{Broker, DeliveryMetadata, HandlerOutcome, MessageHandler};

/// 測試用的停止旗標輪詢間隔
pub const POLL: Duration = Duration::from_millis(50);

/// `events` 主題交換機、`rpc` 直連交換機，以及綁定 `order.*` 的 `orders` 佇列
pub fn broker_config() -> BrokerConfig {
    let mut config = BrokerConfig::default()
        .with_exchange(ExchangeConfig::topic("rpc").with_kind(ExchangeKind::Direct))
        .with_queue(QueueConfig::durable("orders").bind("order.*"));
    config.consumer.poll_interval_ms = POLL.as_millis() as u64;
    config
}

pub fn in_memory() -> (InMemoryBroker, Broker) {
    in_memory_with(broker_config())
}

pub fn in_memory_with(config: BrokerConfig) -> (InMemoryBroker, Broker) {
    let memory = InMemoryBroker::new();
    let broker = Broker::in_memory(config, &memory);
    (memory, broker)
}

/// 記錄每條消息後按 `outcome` 處置
pub fn recording(
    outcome: HandlerOutcome,
) -> (Arc<Mutex<Vec<(Value, DeliveryMetadata)>>>, Arc<dyn MessageHandler>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();
    let handler: Arc<dyn MessageHandler> = Arc::new(move |body: Value, metadata: DeliveryMetadata| {
        let log = log.clone();
        async move {
            log.lock().push((body, metadata));
            Ok::<_, anyhow::Error>(outcome)
        }
    });
    (received, handler)
}
