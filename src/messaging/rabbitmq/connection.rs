use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::messaging::metrics::MessagingMetrics;
use crate::messaging::rabbitmq::error::{BrokerError, BrokerResult};
use crate::messaging::rabbitmq::topology::{TopologyDeclarer, TopologyReport};
use crate::messaging::rabbitmq::transport::{BrokerChannel, BrokerConnection, Transport};

/// 一條連接加上共享通道
struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// 共享通道的獨佔使用權，持有期間其他調用方等待
pub struct SharedChannel<'a> {
    _guard: MutexGuard<'a, ()>,
    channel: Arc<dyn BrokerChannel>,
}

impl Deref for SharedChannel<'_> {
    type Target = dyn BrokerChannel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

/// 連接管理器
///
/// 持有進程唯一的代理連接。首次使用時才連接，之後任何操作發現連接失效都會先重新連接，
/// 沒有背景重連任務。
pub struct ConnectionManager {
    config: Arc<BrokerConfig>,
    transport: Arc<dyn Transport>,
    session: RwLock<Option<Session>>,
    connect_lock: Mutex<()>,
    channel_lock: Mutex<()>,
    generation: AtomicU64,
}

impl ConnectionManager {
    /// 創建新的連接管理器，不會立即連接
    pub fn new(config: Arc<BrokerConfig>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            session: RwLock::new(None),
            connect_lock: Mutex::new(()),
            channel_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// 當前連接是否存活，不會觸發連接
    pub fn is_connected(&self) -> bool {
        self.session
            .read()
            .as_ref()
            .map(|session| session.connection.is_connected())
            .unwrap_or(false)
    }

    /// 每次成功連接遞增，0 表示尚未連接過
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// 建立連接與共享通道，並宣告拓撲
    ///
    /// 已連接時是無操作。多個調用方同時發現連接失效時只會重連一次。
    pub async fn connect(&self) -> BrokerResult<()> {
        self.live_channel().await.map(|_| ())
    }

    fn current_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.session
            .read()
            .as_ref()
            .filter(|session| session.connection.is_connected() && session.channel.is_open())
            .map(|session| session.channel.clone())
    }

    fn current_connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.session
            .read()
            .as_ref()
            .filter(|session| session.connection.is_connected())
            .map(|session| session.connection.clone())
    }

    async fn live_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }

        let _lock = self.connect_lock.lock().await;
        // 等鎖期間可能已被其他調用方重連
        if let Some(channel) = self.current_channel() {
            return Ok(channel);
        }

        if let Some(connection) = self.current_connection() {
            warn!("Shared channel was closed by the broker, reopening");
            let channel = connection.create_channel().await?;
            if let Some(session) = self.session.write().as_mut() {
                session.channel = channel.clone();
            }
            return Ok(channel);
        }

        let previous = self.session.write().take();
        if let Some(previous) = previous {
            // 舊連接已失效，關閉只是釋放資源
            let _ = previous.connection.close().await;
        }

        let connection = self.transport.connect(&self.config).await?;
        let channel = connection.create_channel().await?;
        if let Err(error) = TopologyDeclarer::declare(channel.as_ref(), &self.config).await {
            let _ = connection.close().await;
            return Err(error);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.session.write() = Some(Session {
            connection,
            channel: channel.clone(),
        });

        if generation > 1 {
            MessagingMetrics::record_reconnect();
            warn!(generation, uri = %self.config.redacted_uri(), "Reconnected to broker");
        } else {
            info!(uri = %self.config.redacted_uri(), "Connected to broker");
        }
        Ok(channel)
    }

    /// 取得共享通道，必要時先連接
    ///
    /// 返回值持有期間其他共享通道操作會等待。
    pub async fn channel(&self) -> BrokerResult<SharedChannel<'_>> {
        let guard = self.channel_lock.lock().await;
        let channel = self.live_channel().await?;
        Ok(SharedChannel {
            _guard: guard,
            channel,
        })
    }

    /// 為消費者等長期使用者打開獨立通道
    pub async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        self.live_channel().await?;
        match self.current_connection() {
            Some(connection) => {
                let channel = connection.create_channel().await?;
                debug!(generation = self.generation(), "Opened dedicated channel");
                Ok(channel)
            }
            None => Err(BrokerError::connection("connection dropped while opening a channel")),
        }
    }

    /// 在共享通道上重新宣告拓撲
    pub async fn declare_topology(&self) -> BrokerResult<TopologyReport> {
        let channel = self.channel().await?;
        TopologyDeclarer::declare(&*channel, &self.config).await
    }

    /// 關閉通道與連接，可重複調用
    pub async fn disconnect(&self) -> BrokerResult<()> {
        let _lock = self.connect_lock.lock().await;
        let session = self.session.write().take();
        let Some(session) = session else {
            return Ok(());
        };

        let channel_result = session.channel.close().await;
        let connection_result = session.connection.close().await;
        info!(uri = %self.config.redacted_uri(), "Disconnected from broker");
        channel_result.and(connection_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::messaging::rabbitmq::memory::InMemoryBroker;
    use crate::messaging::rabbitmq::transport::MockTransport;
    use assert_matches::assert_matches;

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        let config = BrokerConfig::default().with_queue(QueueConfig::durable("orders").bind("order.*"));
        ConnectionManager::new(Arc::new(config), broker.transport())
    }

    #[tokio::test]
    async fn test_connect_is_lazy_and_declares_topology() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        assert!(!manager.is_connected());
        assert_eq!(broker.connection_count(), 0);

        manager.channel().await.unwrap();

        assert!(manager.is_connected());
        assert_eq!(manager.generation(), 1);
        assert!(broker.has_queue("orders"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connection() {
        let broker = InMemoryBroker::new();
        let manager = Arc::new(manager(&broker));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(broker.connection_count(), 1);
        assert_eq!(manager.generation(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_drop() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        broker.drop_connections();
        assert!(!manager.is_connected());

        manager.channel().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(manager.generation(), 2);
    }

    #[tokio::test]
    async fn test_reopens_only_the_channel_after_channel_error() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        {
            let channel = manager.channel().await.unwrap();
            let result = channel
                .publish("missing", "x", b"{}", &Default::default())
                .await;
            assert!(result.is_err());
        }

        manager.channel().await.unwrap();
        assert_eq!(manager.generation(), 1);
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_as_connection_error() {
        let mut transport = MockTransport::new();
        transport
            .expect_connect()
            .times(1)
            .returning(|_| Err(BrokerError::connection("connection refused")));
        let manager = ConnectionManager::new(Arc::new(BrokerConfig::default()), Arc::new(transport));

        let result = manager.connect().await;

        assert_matches!(result, Err(BrokerError::Connection { message }) if message.contains("refused"));
        assert!(!manager.is_connected());
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.connect().await.unwrap();

        manager.disconnect().await.unwrap();
        manager.disconnect().await.unwrap();

        assert!(!manager.is_connected());
        assert_eq!(broker.connection_count(), 0);
    }
}
