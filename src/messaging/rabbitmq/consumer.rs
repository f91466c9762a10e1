use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QosConfig;
use crate::messaging::metrics::{MessagingMetrics, MetricType};
use crate::messaging::protocol::{Delivery, DeliveryMetadata};
use crate::messaging::rabbitmq::connection::ConnectionManager;
use crate::messaging::rabbitmq::error::{BrokerError, BrokerResult};
use crate::messaging::rabbitmq::shutdown::ShutdownSignal;
use crate::messaging::rabbitmq::transport::{BrokerChannel, ConsumeOptions, DeliveryStream};

/// 處理器對一條消息的處置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// 確認並移除消息
    Ack,
    /// 否定確認且不重新入列
    Reject,
    /// 確認消息後停止消費
    Stop,
}

/// 消息處理器特徵
///
/// 返回錯誤時消息會重新入列。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: Value, metadata: &DeliveryMetadata) -> anyhow::Result<HandlerOutcome>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Value, DeliveryMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<HandlerOutcome>> + Send,
{
    async fn handle(&self, body: Value, metadata: &DeliveryMetadata) -> anyhow::Result<HandlerOutcome> {
        (self)(body, metadata.clone()).await
    }
}

/// 消費者狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Declaring,
    Consuming,
    Cancelling,
    Faulted,
}

/// 消費結束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 外部停止信號
    Shutdown,
    /// 超過總時限
    Timeout,
    /// 處理器返回 `HandlerOutcome::Stop`
    HandlerStop,
}

/// 一次消費的統計
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeReport {
    pub queue: String,
    pub consumer_tag: String,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub stop_reason: StopReason,
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Requeue,
    Reject,
}

enum Step {
    Continue,
    Stop,
}

/// 單一佇列的消費者
///
/// 在獨立通道上訂閱佇列，逐條調用處理器。每個輪詢間隔至少檢查一次停止信號與總時限。
pub struct QueueConsumer {
    connection: Arc<ConnectionManager>,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    qos: QosConfig,
    options: ConsumeOptions,
    consumer_tag: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
    shutdown: ShutdownSignal,
    state: watch::Sender<ConsumerState>,
}

impl QueueConsumer {
    /// 創建消費者，`queue` 可以是配置鍵或佇列名稱
    pub fn new(connection: Arc<ConnectionManager>, queue: &str, handler: Arc<dyn MessageHandler>) -> Self {
        let config = connection.config();
        let queue = config.queue_name(queue).to_string();
        let consumer_tag = format!("{}-{}", config.consumer.tag_prefix, Uuid::new_v4().simple());
        let options = ConsumeOptions {
            no_ack: config.consumer.no_ack,
            exclusive: config.consumer.exclusive,
        };
        let qos = config.qos.clone();
        let poll_interval = config.consumer.poll_interval();
        let (state, _) = watch::channel(ConsumerState::Idle);

        Self {
            connection,
            queue,
            handler,
            qos,
            options,
            consumer_tag,
            poll_interval,
            timeout: None,
            shutdown: ShutdownSignal::new(),
            state,
        }
    }

    /// 設置總時限，到期後自行取消
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// 使用外部的停止信號
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_qos(mut self, qos: QosConfig) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// 取得停止信號的副本
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// 訂閱狀態變化
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(queue = %self.queue, from = ?previous, to = ?state, "Consumer state changed");
        }
    }

    /// 消費直到停止信號、總時限或處理器要求停止
    ///
    /// 連接失敗返回 `Connection` 並回到 `Idle`；代理拒絕（佇列不存在、被鎖定）
    /// 返回 `Channel` 並進入 `Faulted`；消費途中通道失效返回 `ConsumerFaulted`。
    pub async fn run(&self) -> BrokerResult<ConsumeReport> {
        self.set_state(ConsumerState::Declaring);
        let (channel, mut stream) = match self.subscribe().await {
            Ok(subscription) => subscription,
            Err(error) => {
                error!(queue = %self.queue, error = %error, "Failed to start consumer");
                self.set_state(if error.is_retryable() {
                    ConsumerState::Idle
                } else {
                    ConsumerState::Faulted
                });
                return Err(error);
            }
        };

        self.set_state(ConsumerState::Consuming);
        info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            prefetch = self.qos.prefetch_count,
            timeout = ?self.timeout,
            "Consumer started"
        );

        let mut report = ConsumeReport {
            queue: self.queue.clone(),
            consumer_tag: self.consumer_tag.clone(),
            delivered: 0,
            acked: 0,
            requeued: 0,
            rejected: 0,
            stop_reason: StopReason::Shutdown,
        };
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        let stop_reason = loop {
            if self.shutdown.is_triggered() {
                break StopReason::Shutdown;
            }
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break StopReason::Timeout;
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };

            let next = match tokio::time::timeout(wait, stream.next()).await {
                Ok(next) => next,
                Err(_) => continue,
            };
            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(error)) => return self.fault(channel.as_ref(), error.to_string()).await,
                None => {
                    return self
                        .fault(channel.as_ref(), "consumer was cancelled by the broker".to_string())
                        .await
                }
            };

            match self.process(channel.as_ref(), delivery, &mut report).await {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break StopReason::HandlerStop,
                Err(error) => return self.fault(channel.as_ref(), error.to_string()).await,
            }
        };

        self.cancel(channel.as_ref(), stream).await;
        report.stop_reason = stop_reason;
        info!(
            queue = %report.queue,
            delivered = report.delivered,
            acked = report.acked,
            requeued = report.requeued,
            rejected = report.rejected,
            reason = ?report.stop_reason,
            "Consumer stopped"
        );
        Ok(report)
    }

    async fn subscribe(&self) -> BrokerResult<(Arc<dyn BrokerChannel>, DeliveryStream)> {
        let channel = self.connection.open_channel().await?;
        let subscription = async {
            channel.qos(&self.qos).await?;
            channel
                .consume(&self.queue, &self.consumer_tag, &self.options)
                .await
        }
        .await;

        match subscription {
            Ok(stream) => Ok((channel, stream)),
            Err(error) => {
                let _ = channel.close().await;
                Err(error)
            }
        }
    }

    async fn process(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
        report: &mut ConsumeReport,
    ) -> BrokerResult<Step> {
        report.delivered += 1;
        MessagingMetrics::record(MetricType::Delivered { queue: &self.queue }, None);
        let metadata = delivery.metadata(&self.queue, &self.consumer_tag);
        debug!(
            queue = %self.queue,
            delivery_tag = metadata.delivery_tag,
            routing_key = %metadata.routing_key,
            redelivered = metadata.redelivered,
            "Received message"
        );

        let body = match delivery.json_body() {
            Ok(body) => body,
            Err(error) => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = metadata.delivery_tag,
                    error = %error,
                    "Rejecting message with a body that is not valid JSON"
                );
                self.settle(channel, metadata.delivery_tag, Settlement::Reject, report)
                    .await?;
                return Ok(Step::Continue);
            }
        };

        let started = std::time::Instant::now();
        let outcome = self.handler.handle(body, &metadata).await;
        MessagingMetrics::record(
            MetricType::HandlerLatency { queue: &self.queue },
            Some(started.elapsed()),
        );

        match outcome {
            Ok(HandlerOutcome::Ack) => {
                self.settle(channel, metadata.delivery_tag, Settlement::Ack, report)
                    .await?;
                Ok(Step::Continue)
            }
            Ok(HandlerOutcome::Reject) => {
                self.settle(channel, metadata.delivery_tag, Settlement::Reject, report)
                    .await?;
                Ok(Step::Continue)
            }
            Ok(HandlerOutcome::Stop) => {
                self.settle(channel, metadata.delivery_tag, Settlement::Ack, report)
                    .await?;
                info!(queue = %self.queue, "Handler requested consumer stop");
                Ok(Step::Stop)
            }
            Err(error) => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = metadata.delivery_tag,
                    routing_key = %metadata.routing_key,
                    error = %format!("{:#}", error),
                    "Handler failed, requeueing message"
                );
                self.settle(channel, metadata.delivery_tag, Settlement::Requeue, report)
                    .await?;
                Ok(Step::Continue)
            }
        }
    }

    async fn settle(
        &self,
        channel: &dyn BrokerChannel,
        delivery_tag: u64,
        settlement: Settlement,
        report: &mut ConsumeReport,
    ) -> BrokerResult<()> {
        // 自動確認模式下代理已在投遞時確認
        if self.options.no_ack {
            return Ok(());
        }

        match settlement {
            Settlement::Ack => {
                channel.ack(delivery_tag).await?;
                report.acked += 1;
                MessagingMetrics::record(MetricType::Acked { queue: &self.queue }, None);
            }
            Settlement::Requeue => {
                channel.nack(delivery_tag, true).await?;
                report.requeued += 1;
                MessagingMetrics::record(MetricType::Requeued { queue: &self.queue }, None);
            }
            Settlement::Reject => {
                channel.nack(delivery_tag, false).await?;
                report.rejected += 1;
                MessagingMetrics::record(MetricType::Rejected { queue: &self.queue }, None);
            }
        }
        Ok(())
    }

    /// 取消訂閱並關閉通道，未確認的消息由代理重新入列
    async fn cancel(&self, channel: &dyn BrokerChannel, stream: DeliveryStream) {
        self.set_state(ConsumerState::Cancelling);
        if let Err(error) = channel.cancel(&self.consumer_tag).await {
            warn!(queue = %self.queue, error = %error, "basic.cancel failed");
        }
        drop(stream);
        if let Err(error) = channel.close().await {
            warn!(queue = %self.queue, error = %error, "Failed to close consumer channel");
        }
        self.set_state(ConsumerState::Idle);
    }

    async fn fault(&self, channel: &dyn BrokerChannel, message: String) -> BrokerResult<ConsumeReport> {
        error!(queue = %self.queue, consumer_tag = %self.consumer_tag, error = %message, "Consumer faulted");
        let _ = channel.close().await;
        self.set_state(ConsumerState::Faulted);
        Err(BrokerError::ConsumerFaulted {
            queue: self.queue.clone(),
            message,
        })
    }
}
