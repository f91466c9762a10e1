use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::messaging::protocol::DeliveryMetadata;
use crate::messaging::rabbitmq::consumer::{HandlerOutcome, MessageHandler};
use crate::messaging::rabbitmq::error::{BrokerError, BrokerResult};

/// 事件處理器特徵
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, data: &Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, data: &Value) -> anyhow::Result<()> {
        (self)(data.clone()).await
    }
}

/// 事件處理器註冊表
///
/// 事件類型對應有序的處理器列表，註冊順序即分派順序。
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 註冊事件處理器，追加在已有處理器之後
    pub fn register<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.register_arc(event_type, Arc::new(handler));
    }

    pub fn register_arc(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        let event_type = event_type.into();
        let mut handlers = self.handlers.write();
        let list = handlers.entry(event_type.clone()).or_default();
        list.push(handler);
        debug!(event_type = %event_type, handlers = list.len(), "Registered event handler");
    }

    /// 依註冊順序調用事件的所有處理器
    ///
    /// 返回調用的處理器數。任一處理器失敗即停止並返回 `BrokerError::Handler`；
    /// 沒有處理器只記錄警告。
    pub async fn dispatch(&self, event_type: &str, data: &Value) -> BrokerResult<usize> {
        let handlers = self
            .handlers
            .read()
            .get(event_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            warn!(event_type, "No handler registered for event");
            return Ok(0);
        }

        for (index, handler) in handlers.iter().enumerate() {
            if let Err(source) = handler.handle(data).await {
                error!(
                    event_type,
                    handler_index = index,
                    error = %format!("{:#}", source),
                    "Event handler failed"
                );
                return Err(BrokerError::Handler {
                    event_type: event_type.to_string(),
                    source,
                });
            }
        }

        debug!(event_type, handlers = handlers.len(), "Dispatched event");
        Ok(handlers.len())
    }

    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers
            .read()
            .get(event_type)
            .map(|list| !list.is_empty())
            .unwrap_or(false)
    }

    /// 移除某事件類型的所有處理器，返回移除數量
    pub fn clear_handlers(&self, event_type: &str) -> usize {
        self.handlers
            .write()
            .remove(event_type)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn clear_all(&self) {
        self.handlers.write().clear();
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// 已註冊的事件類型，按名稱排序
    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

/// 作為消費者處理器時，事件類型取消息體的 `event` 欄位，缺少時使用路由鍵
#[async_trait]
impl MessageHandler for HandlerRegistry {
    async fn handle(&self, body: Value, metadata: &DeliveryMetadata) -> anyhow::Result<HandlerOutcome> {
        let event_type = body
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or(&metadata.routing_key)
            .to_string();
        self.dispatch(&event_type, &body).await?;
        Ok(HandlerOutcome::Ack)
    }
}
