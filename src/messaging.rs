// 消息系統模組
// 提供基於 RabbitMQ 的消息代理抽象層：各服務以此宣告拓撲、發佈持久化事件、
// 在流量控制下消費佇列，並在非同步代理之上進行請求/回應調用

// 導出子模組
pub mod metrics;
pub mod protocol;
pub mod rabbitmq;
pub mod registry;

// 重新導出常用類型
pub use protocol::{Delivery, DeliveryMetadata, DomainEvent, MessageProperties};
pub use rabbitmq::{
    Broker, BrokerError, BrokerResult, ConsumeReport, HandlerOutcome, MessageHandler,
    QueueConsumer, RpcHandler, ShutdownSignal, StopReason,
};
pub use registry::{EventHandler, HandlerRegistry};
