use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::messaging::rabbitmq::RpcResponder;
use crate::messaging::{Broker, BrokerResult, ConsumeReport, MessageHandler, RpcHandler, ShutdownSignal};
use crate::worker::signal;
use crate::worker::{WorkerError, WorkerResult, WorkerState};

/// 佇列與其處理器
enum Route {
    Messages(Arc<dyn MessageHandler>),
    Rpc(Arc<dyn RpcHandler>),
}

/// 工作進程實例
///
/// 每個佇列運行一個消費者任務，所有任務共享同一個停止信號與同一條連接。
pub struct Worker {
    /// 工作進程狀態
    state: Arc<RwLock<WorkerState>>,
    broker: Broker,
    routes: Vec<(String, Arc<dyn MessageHandler>)>,
    timeout: Option<Duration>,
    shutdown: ShutdownSignal,
    handle_signals: bool,
}

impl Worker {
    /// 運行所有消費者直到它們結束，然後關閉連接
    ///
    /// 任一消費者失敗時觸發停止信號讓其他消費者一併退出，返回第一個錯誤。
    /// 連接在所有退出路徑上都會關閉。
    pub async fn run(&self) -> WorkerResult<Vec<ConsumeReport>> {
        info!(queues = self.routes.len(), "Starting worker");
        self.set_state(WorkerState::Initializing).await;

        if let Err(e) = self.broker.connect().await {
            error!(error = %e, "Worker failed to connect");
            if let Err(close_error) = self.stop().await {
                debug!(error = %close_error, "Close after failed connect also failed");
            }
            return Err(WorkerError::Initialization(format!("無法連接消息代理: {}", e)));
        }

        let listener = self
            .handle_signals
            .then(|| signal::spawn_listener(self.shutdown.clone()));

        let mut tasks = JoinSet::new();
        for (queue, handler) in &self.routes {
            let consumer = self
                .broker
                .consumer(queue, handler.clone())
                .with_shutdown(self.shutdown.clone())
                .with_timeout(self.timeout);
            let queue = queue.clone();
            tasks.spawn(async move {
                let result: BrokerResult<ConsumeReport> = consumer.run().await;
                (queue, result)
            });
        }

        self.set_state(WorkerState::Running).await;
        info!("Worker running");

        let mut reports = Vec::with_capacity(self.routes.len());
        let mut failure: Option<WorkerError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((queue, Ok(report))) => {
                    debug!(
                        queue = %queue,
                        delivered = report.delivered,
                        stop_reason = ?report.stop_reason,
                        "Consumer finished"
                    );
                    reports.push(report);
                }
                Ok((queue, Err(source))) => {
                    error!(queue = %queue, error = %source, "Consumer failed, stopping worker");
                    self.shutdown.trigger();
                    failure.get_or_insert(WorkerError::Consumer { queue, source });
                }
                Err(e) => {
                    error!(error = %e, "Consumer task aborted, stopping worker");
                    self.shutdown.trigger();
                    failure.get_or_insert(WorkerError::Runtime(format!("消費者任務異常結束: {}", e)));
                }
            }
        }

        if let Some(listener) = listener {
            listener.abort();
        }

        let closed = self.stop().await;
        match (failure, closed) {
            (Some(failure), _) => Err(failure),
            (None, Err(e)) => Err(WorkerError::Broker(e)),
            (None, Ok(())) => {
                info!(consumers = reports.len(), "Worker stopped");
                Ok(reports)
            }
        }
    }

    /// 要求所有消費者停止
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// 獲取工作進程狀態
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// 消費中的佇列名稱
    pub fn queues(&self) -> Vec<&str> {
        self.routes.iter().map(|(queue, _)| queue.as_str()).collect()
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
    }

    async fn stop(&self) -> BrokerResult<()> {
        self.set_state(WorkerState::ShuttingDown).await;
        let closed = self.broker.disconnect().await;
        if let Err(e) = &closed {
            warn!(error = %e, "Failed to close broker connection");
        }
        self.set_state(WorkerState::Stopped).await;
        closed
    }
}

/// 工作進程構建器
pub struct WorkerBuilder {
    broker: Option<Broker>,
    routes: Vec<(String, Route)>,
    timeout: Option<Duration>,
    shutdown: Option<ShutdownSignal>,
    handle_signals: bool,
}

impl WorkerBuilder {
    /// 創建新的工作進程構建器，預設監聽終止信號
    pub fn new() -> Self {
        Self {
            broker: None,
            routes: Vec::new(),
            timeout: None,
            shutdown: None,
            handle_signals: true,
        }
    }

    pub fn with_broker(mut self, broker: Broker) -> Self {
        self.broker = Some(broker);
        self
    }

    /// 以消息處理器消費佇列，`queue` 可以是配置鍵或佇列名稱
    pub fn route(mut self, queue: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.routes.push((queue.into(), Route::Messages(handler)));
        self
    }

    /// 以 RPC 處理器服務請求佇列
    pub fn route_rpc(mut self, queue: impl Into<String>, handler: Arc<dyn RpcHandler>) -> Self {
        self.routes.push((queue.into(), Route::Rpc(handler)));
        self
    }

    /// 每個消費者的總時限
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// 是否安裝 SIGTERM / SIGINT / SIGQUIT 監聽
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// 構建並返回工作進程實例
    pub fn build(self) -> WorkerResult<Worker> {
        let broker = self
            .broker
            .ok_or_else(|| WorkerError::Config("未提供消息代理客戶端".to_string()))?;

        if self.routes.is_empty() {
            return Err(WorkerError::Config("至少需要一個消費佇列".to_string()));
        }

        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(self.routes.len());
        for (queue, route) in self.routes {
            let name = broker.config().queue_name(&queue).to_string();
            if !seen.insert(name.clone()) {
                return Err(WorkerError::Config(format!("佇列重複: {}", name)));
            }

            let handler: Arc<dyn MessageHandler> = match route {
                Route::Messages(handler) => handler,
                Route::Rpc(handler) => Arc::new(RpcResponder::new(broker.publisher().clone(), handler)),
            };
            routes.push((name, handler));
        }

        debug!(queues = routes.len(), "Worker built");

        Ok(Worker {
            state: Arc::new(RwLock::new(WorkerState::Initializing)),
            broker,
            routes,
            timeout: self.timeout,
            shutdown: self.shutdown.unwrap_or_default(),
            handle_signals: self.handle_signals,
        })
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
