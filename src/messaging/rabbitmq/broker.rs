use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{BrokerConfig, Validator};
use crate::messaging::protocol::DomainEvent;
use crate::messaging::rabbitmq::amqp::AmqpTransport;
use crate::messaging::rabbitmq::connection::ConnectionManager;
use crate::messaging::rabbitmq::consumer::{ConsumeReport, MessageHandler, QueueConsumer};
use crate::messaging::rabbitmq::error::BrokerResult;
use crate::messaging::rabbitmq::memory::InMemoryBroker;
use crate::messaging::rabbitmq::publisher::{PublishOptions, Publisher};
use crate::messaging::rabbitmq::rpc::{RpcClient, RpcHandler, RpcServer};
use crate::messaging::rabbitmq::shutdown::ShutdownSignal;
use crate::messaging::rabbitmq::topology::TopologyReport;
use crate::messaging::rabbitmq::transport::Transport;

/// 消息代理客戶端
///
/// 在啟動時創建一次，複製後傳給發布者、消費者與 RPC 調用方，所有副本共享同一條連接。
#[derive(Clone)]
pub struct Broker {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    rpc: RpcClient,
}

impl Broker {
    /// 以指定傳輸創建客戶端，不會立即連接
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let connection = Arc::new(ConnectionManager::new(Arc::new(config), transport));
        let publisher = Publisher::new(connection.clone());
        let rpc = RpcClient::new(connection.clone(), publisher.clone());
        Self {
            connection,
            publisher,
            rpc,
        }
    }

    /// 驗證配置後創建連接 RabbitMQ 的客戶端
    pub fn amqp(config: BrokerConfig) -> BrokerResult<Self> {
        config.validate()?;
        let transport = AmqpTransport::new().with_connection_name(config.consumer.tag_prefix.clone());
        Ok(Self::new(config, Arc::new(transport)))
    }

    /// 創建連接進程內代理的客戶端
    pub fn in_memory(config: BrokerConfig, broker: &InMemoryBroker) -> Self {
        Self::new(config, broker.transport())
    }

    pub fn config(&self) -> &BrokerConfig {
        self.connection.config()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// 建立連接並宣告拓撲，已連接時是無操作
    pub async fn connect(&self) -> BrokerResult<()> {
        self.connection.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// 停止 RPC 回應監聽器並關閉連接
    pub async fn disconnect(&self) -> BrokerResult<()> {
        self.rpc.shutdown().await;
        self.connection.disconnect().await
    }

    pub async fn declare_topology(&self) -> BrokerResult<TopologyReport> {
        self.connection.declare_topology().await
    }

    /// 發佈 JSON 消息
    pub async fn publish<T>(&self, exchange: &str, routing_key: &str, payload: &T) -> BrokerResult<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publisher.publish(exchange, routing_key, payload).await
    }

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
        self.publisher
            .publish_with(exchange, routing_key, payload, options)
            .await
    }

    pub async fn publish_event(&self, event: &DomainEvent) -> BrokerResult<()> {
        self.publisher.publish_event(event).await
    }

    /// 創建佇列消費者，尚未開始消費
    pub fn consumer(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> QueueConsumer {
        QueueConsumer::new(self.connection.clone(), queue, handler)
    }

    /// 消費佇列直到停止信號、總時限或處理器要求停止
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownSignal,
        timeout: Option<Duration>,
    ) -> BrokerResult<ConsumeReport> {
        self.consumer(queue, handler)
            .with_shutdown(shutdown)
            .with_timeout(timeout)
            .run()
            .await
    }

    /// 發送 RPC 請求並等待回應
    pub async fn request<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        timeout: Option<Duration>,
    ) -> BrokerResult<Value>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.rpc.request(exchange, routing_key, payload, timeout).await
    }

    pub async fn call<T, R>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
        timeout: Option<Duration>,
    ) -> BrokerResult<R>
    where
        T: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        self.rpc.call(exchange, routing_key, payload, timeout).await
    }

    /// 創建 RPC 服務
    pub fn rpc_server(&self, queue: &str, handler: Arc<dyn RpcHandler>) -> RpcServer {
        RpcServer::new(self.connection.clone(), self.publisher.clone(), queue, handler)
    }

    /// 連接、執行 `f`，並在所有退出路徑上關閉連接
    ///
    /// `f` 的錯誤優先於關閉時的錯誤。
    pub async fn run_scoped<F, Fut, R>(&self, f: F) -> BrokerResult<R>
    where
        F: FnOnce(Broker) -> Fut,
        Fut: Future<Output = BrokerResult<R>>,
    {
        if let Err(error) = self.connect().await {
            let _ = self.disconnect().await;
            return Err(error);
        }

        let result = f(self.clone()).await;
        let closed = self.disconnect().await;
        debug!(succeeded = result.is_ok(), "Scoped broker session finished");

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(error), closed) => {
                if let Err(close_error) = closed {
                    warn!(error = %close_error, "Failed to close broker connection after error");
                }
                Err(error)
            }
            (Ok(_), Err(close_error)) => Err(close_error),
        }
    }
}
