//! 代理傳輸層抽象
//!
//! 核心邏輯只依賴這裡的特徵。`amqp` 模組以 lapin 實現 AMQP 0-9-1，
//! `memory` 模組提供同語義的進程內代理。

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::{BrokerConfig, ExchangeConfig, QosConfig, QueueConfig};
use crate::messaging::protocol::{Delivery, MessageProperties};
use crate::messaging::rabbitmq::error::BrokerResult;

/// 消費者收到的投遞流
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// 消費選項
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// 代理在投遞時自動確認
    pub no_ack: bool,
    pub exclusive: bool,
}

/// 建立連接的工廠
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, config: &BrokerConfig) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// 一條代理連接
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> BrokerResult<()>;
}

/// 連接上的一個通道
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> BrokerResult<()>;

    /// 宣告佇列並返回實際名稱，空名稱由代理生成
    async fn declare_queue(&self, queue: &QueueConfig) -> BrokerResult<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    async fn qos(&self, qos: &QosConfig) -> BrokerResult<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> BrokerResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}
