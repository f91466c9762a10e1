// RabbitMQ 模組
// 提供連接管理、拓撲宣告、發佈、消費與 RPC 的基礎設施

// 導出子模組
pub mod amqp;
pub mod broker;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod rpc;
pub mod shutdown;
pub mod topology;
pub mod transport;

// 重新導出常用結構
pub use amqp::AmqpTransport;
pub use broker::Broker;
pub use connection::{ConnectionManager, SharedChannel};
pub use consumer::{
    ConsumeReport, ConsumerState, HandlerOutcome, MessageHandler, QueueConsumer, StopReason,
};
pub use error::{BrokerError, BrokerResult};
pub use memory::{topic_matches, InMemoryBroker, InMemoryTransport};
pub use publisher::{PublishOptions, Publisher};
pub use rpc::{RpcClient, RpcHandler, RpcResponder, RpcServer};
pub use shutdown::ShutdownSignal;
pub use topology::{TopologyDeclarer, TopologyReport};
pub use transport::{BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryStream, Transport};
