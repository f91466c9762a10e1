use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::messaging::metrics::MessagingMetrics;
use crate::messaging::protocol::DeliveryMetadata;
use crate::messaging::rabbitmq::connection::ConnectionManager;
use crate::messaging::rabbitmq::consumer::{
    ConsumeReport, HandlerOutcome, MessageHandler, QueueConsumer,
};
use crate::messaging::rabbitmq::error::{BrokerError, BrokerResult};
use crate::messaging::rabbitmq::publisher::{PublishOptions, Publisher};
use crate::messaging::rabbitmq::shutdown::ShutdownSignal;
use crate::messaging::rabbitmq::transport::ConsumeOptions;

/// 等待中的請求：關聯 ID -> 單次回應槽
type PendingRequests = DashMap<String, oneshot::Sender<Value>>;

/// 等待的 future 結束時移除對應的請求
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.correlation_id);
    }
}

/// 把回應分派給等待中的請求
struct ReplyRouter {
    pending: Arc<PendingRequests>,
}

#[async_trait]
impl MessageHandler for ReplyRouter {
    async fn handle(&self, body: Value, metadata: &DeliveryMetadata) -> anyhow::Result<HandlerOutcome> {
        let Some(correlation_id) = metadata.correlation_id.as_deref() else {
            warn!(queue = %metadata.queue, "Received RPC reply without correlation_id");
            MessagingMetrics::record_unmatched_reply();
            return Ok(HandlerOutcome::Ack);
        };

        match self.pending.remove(correlation_id) {
            Some((_, sender)) => {
                debug!(correlation_id, "Received RPC reply");
                if sender.send(body).is_err() {
                    warn!(correlation_id, "RPC caller stopped waiting before the reply arrived");
                    MessagingMetrics::record_unmatched_reply();
                }
            }
            None => {
                warn!(correlation_id, "Discarding RPC reply with no pending request");
                MessagingMetrics::record_unmatched_reply();
            }
        }
        Ok(HandlerOutcome::Ack)
    }
}

struct ReplyListener {
    queue: String,
    generation: u64,
    shutdown: ShutdownSignal,
    task: JoinHandle<BrokerResult<ConsumeReport>>,
}

/// RPC 客戶端
///
/// 每個客戶端擁有一個獨佔、自動刪除的回應佇列，多個並行請求只靠關聯 ID 區分。
/// 連接重建後回應佇列會在下一次請求時重新建立。
#[derive(Clone)]
pub struct RpcClient {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    pending: Arc<PendingRequests>,
    listener: Arc<Mutex<Option<ReplyListener>>>,
}

impl RpcClient {
    /// 創建新的 RPC 客戶端
    pub fn new(connection: Arc<ConnectionManager>, publisher: Publisher) -> Self {
        Self {
            connection,
            publisher,
            pending: Arc::new(DashMap::new()),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// 等待中的請求數
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// 發送請求並等待回應
    ///
    /// `timeout` 為 `None` 時使用 `rpc.default_timeout_ms`。逾時後到達的回應會被丟棄。
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
        let timeout = timeout.unwrap_or_else(|| self.connection.config().rpc.default_timeout());
        let reply_to = self.reply_queue().await?;

        let correlation_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), sender);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: &correlation_id,
        };

        let started = Instant::now();
        self.publisher
            .publish_with(
                exchange,
                routing_key,
                payload,
                PublishOptions::default()
                    .with_correlation_id(&correlation_id)
                    .with_reply_to(&reply_to),
            )
            .await?;
        debug!(
            exchange,
            routing_key,
            correlation_id = %correlation_id,
            reply_to = %reply_to,
            "Sent RPC request"
        );

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => {
                MessagingMetrics::record_rpc("ok", started.elapsed());
                debug!(
                    correlation_id = %correlation_id,
                    elapsed = ?started.elapsed(),
                    "RPC request completed"
                );
                Ok(reply)
            }
            Ok(Err(_)) => {
                MessagingMetrics::record_rpc("closed", started.elapsed());
                warn!(correlation_id = %correlation_id, "RPC reply channel closed");
                Err(BrokerError::ChannelClosed)
            }
            Err(_) => {
                MessagingMetrics::record_rpc("timeout", started.elapsed());
                warn!(
                    correlation_id = %correlation_id,
                    timeout = ?timeout,
                    routing_key,
                    "RPC request timed out"
                );
                Err(BrokerError::RequestTimeout {
                    correlation_id: correlation_id.clone(),
                    timeout,
                })
            }
        }
    }

    /// 發送請求並把回應反序列化為 `R`
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
        let reply = self.request(exchange, routing_key, payload, timeout).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// 取得可用的回應佇列，必要時重新建立
    async fn reply_queue(&self) -> BrokerResult<String> {
        let mut listener = self.listener.lock().await;
        self.connection.connect().await?;
        let generation = self.connection.generation();

        if let Some(current) = listener.as_ref() {
            if current.generation == generation && !current.task.is_finished() {
                return Ok(current.queue.clone());
            }
        }
        if let Some(stale) = listener.take() {
            debug!(queue = %stale.queue, "Replacing stale RPC reply listener");
            stale.shutdown.trigger();
        }

        let prefix = &self.connection.config().rpc.reply_queue_prefix;
        let queue = {
            let channel = self.connection.channel().await?;
            channel
                .declare_queue(&QueueConfig::temporary(format!("{}.{}", prefix, Uuid::new_v4().simple())))
                .await?
        };

        let shutdown = ShutdownSignal::new();
        let router = ReplyRouter {
            pending: self.pending.clone(),
        };
        let consumer = QueueConsumer::new(self.connection.clone(), &queue, Arc::new(router))
            .with_shutdown(shutdown.clone())
            .with_options(ConsumeOptions {
                no_ack: false,
                exclusive: true,
            });
        let task = tokio::spawn(async move { consumer.run().await });

        info!(queue = %queue, generation, "RPC reply listener started");
        *listener = Some(ReplyListener {
            queue: queue.clone(),
            generation,
            shutdown,
            task,
        });
        Ok(queue)
    }

    /// 停止回應監聽器
    pub async fn shutdown(&self) {
        let listener = self.listener.lock().await.take();
        if let Some(listener) = listener {
            listener.shutdown.trigger();
            match listener.task.await {
                Ok(Ok(_)) => debug!(queue = %listener.queue, "RPC reply listener stopped"),
                Ok(Err(error)) => debug!(queue = %listener.queue, error = %error, "RPC reply listener ended with error"),
                Err(error) => warn!(error = %error, "RPC reply listener task panicked"),
            }
        }
    }
}

/// RPC 業務處理器
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Value, metadata: &DeliveryMetadata) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Value, DeliveryMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, request: Value, metadata: &DeliveryMetadata) -> anyhow::Result<Value> {
        (self)(request, metadata.clone()).await
    }
}

/// 把 `RpcHandler` 的返回值發佈到請求的 `reply_to`
pub struct RpcResponder {
    publisher: Publisher,
    handler: Arc<dyn RpcHandler>,
}

impl RpcResponder {
    pub fn new(publisher: Publisher, handler: Arc<dyn RpcHandler>) -> Self {
        Self { publisher, handler }
    }
}

#[async_trait]
impl MessageHandler for RpcResponder {
    async fn handle(&self, body: Value, metadata: &DeliveryMetadata) -> anyhow::Result<HandlerOutcome> {
        let (Some(reply_to), Some(correlation_id)) =
            (metadata.reply_to.as_deref(), metadata.correlation_id.as_deref())
        else {
            warn!(
                queue = %metadata.queue,
                delivery_tag = metadata.delivery_tag,
                "Dropping RPC request without reply_to or correlation_id"
            );
            return Ok(HandlerOutcome::Ack);
        };

        let reply = self.handler.handle(body, metadata).await?;
        self.publisher
            .publish_reply(reply_to, correlation_id, &reply)
            .await?;
        debug!(correlation_id, reply_to, "Sent RPC reply");
        Ok(HandlerOutcome::Ack)
    }
}

/// RPC 服務端：消費請求佇列並回覆
pub struct RpcServer {
    consumer: QueueConsumer,
}

impl RpcServer {
    /// 創建 RPC 服務，`queue` 可以是配置鍵或佇列名稱
    pub fn new(
        connection: Arc<ConnectionManager>,
        publisher: Publisher,
        queue: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> Self {
        let responder = RpcResponder::new(publisher, handler);
        Self {
            consumer: QueueConsumer::new(connection, queue, Arc::new(responder)),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.consumer = self.consumer.with_shutdown(shutdown);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.consumer = self.consumer.with_timeout(timeout);
        self
    }

    pub fn consumer(&self) -> &QueueConsumer {
        &self.consumer
    }

    /// 服務請求直到停止
    pub async fn run(&self) -> BrokerResult<ConsumeReport> {
        self.consumer.run().await
    }
}
