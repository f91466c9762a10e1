//! 進程內消息代理
//!
//! 以與 RabbitMQ 相同的語義模擬本層依賴的 AMQP 行為：路由、宣告衝突、
//! 獨佔/自動刪除佇列、預取計數、確認與重新入列。測試與無 RabbitMQ 的本地開發使用。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BrokerConfig, ExchangeConfig, ExchangeKind, QosConfig, QueueConfig};
use crate::messaging::protocol::{Delivery, MessageProperties};
use crate::messaging::rabbitmq::error::{BrokerError, BrokerResult};
use crate::messaging::rabbitmq::transport::{
    BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryStream, Transport,
};

type ConnectionId = u64;
type ChannelId = u64;

/// 主題交換機的路由鍵匹配
///
/// `*` 匹配恰好一個單詞，`#` 匹配零個或多個單詞，單詞以 `.` 分隔。
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn words(value: &str) -> Vec<&str> {
        if value.is_empty() {
            Vec::new()
        } else {
            value.split('.').collect()
        }
    }

    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    matches(&words(pattern), &words(routing_key))
}

#[derive(Clone, Debug)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    data: Vec<u8>,
    redelivered: bool,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

struct ConnectionState {
    open: bool,
    channels: Vec<ChannelId>,
}

/// 只保存開啟中的通道，關閉即移除
struct ChannelState {
    connection: ConnectionId,
    next_delivery_tag: u64,
    /// 非全局 qos，作用於之後建立的消費者
    consumer_prefetch: u16,
    /// 全局 qos，整個通道共享
    channel_prefetch: u16,
    unacked: BTreeMap<u64, Unacked>,
}

struct ExchangeState {
    config: ExchangeConfig,
    /// (佇列, 綁定鍵)
    bindings: BTreeSet<(String, String)>,
}

struct ConsumerEntry {
    tag: String,
    channel: ChannelId,
    no_ack: bool,
    exclusive: bool,
    prefetch: u16,
    sender: UnboundedSender<BrokerResult<Delivery>>,
}

struct QueueState {
    config: QueueConfig,
    owner: Option<ConnectionId>,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    had_consumer: bool,
}

#[derive(Default)]
struct State {
    unreachable: bool,
    next_id: u64,
    connections: HashMap<ConnectionId, ConnectionState>,
    channels: HashMap<ChannelId, ChannelState>,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, channel: ChannelId) -> BrokerResult<()> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(BrokerError::connection(format!("channel {} is closed", channel)))
        }
    }

    fn channel_connection(&self, channel: ChannelId) -> Option<ConnectionId> {
        self.channels.get(&channel).map(|state| state.connection)
    }

    /// 通道級錯誤：關閉通道並返回錯誤
    fn channel_error(&mut self, channel: ChannelId, error: BrokerError) -> BrokerError {
        warn!(channel, error = %error, "Closing channel after channel-level error");
        self.close_channel(channel, Some(&error.to_string()));
        error
    }

    fn has_capacity(&self, consumer: &ConsumerEntry) -> bool {
        let Some(channel) = self.channels.get(&consumer.channel) else {
            return false;
        };
        if consumer.no_ack {
            return true;
        }
        if channel.channel_prefetch > 0 && channel.unacked.len() >= channel.channel_prefetch as usize {
            return false;
        }
        if consumer.prefetch > 0 {
            let in_flight = channel
                .unacked
                .values()
                .filter(|entry| entry.consumer_tag == consumer.tag)
                .count();
            return in_flight < consumer.prefetch as usize;
        }
        true
    }

    /// 把就緒消息依輪詢順序推送給有容量的消費者
    fn pump(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&index| self.has_capacity(&queue.consumers[index]));
            let Some(index) = chosen else {
                return;
            };

            let (channel_id, tag, no_ack) = {
                let consumer = &queue.consumers[index];
                (consumer.channel, consumer.tag.clone(), consumer.no_ack)
            };
            let Some(channel) = self.channels.get_mut(&channel_id) else {
                return;
            };
            let delivery_tag = channel.next_delivery_tag;
            channel.next_delivery_tag += 1;

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.next_consumer = (index + 1) % count;
            let Some(message) = queue.messages.pop_front() else {
                return;
            };

            let delivery = Delivery {
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                data: message.data.clone(),
            };
            if queue.consumers[index].sender.unbounded_send(Ok(delivery)).is_err() {
                // 接收端已丟棄，移除消費者並退回消息
                queue.messages.push_front(message);
                queue.consumers.remove(index);
                continue;
            }

            if !no_ack {
                if let Some(channel) = self.channels.get_mut(&channel_id) {
                    channel.unacked.insert(
                        delivery_tag,
                        Unacked {
                            queue: queue_name.to_string(),
                            consumer_tag: tag,
                            message,
                        },
                    );
                }
            }
        }
    }

    fn pump_channel_queues(&mut self, channel: ChannelId) {
        let names: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.consumers.iter().any(|c| c.channel == channel))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.pump(&name);
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> BrokerResult<usize> {
        let targets: BTreeSet<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let Some(state) = self.exchanges.get(exchange) else {
                return Err(BrokerError::channel(
                    404,
                    format!("NOT_FOUND - no exchange '{}'", exchange),
                ));
            };
            state
                .bindings
                .iter()
                .filter(|(_, key)| match state.config.kind {
                    ExchangeKind::Topic => topic_matches(key, routing_key),
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Fanout => true,
                })
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.messages.push_back(message.clone());
            }
        }
        for name in &targets {
            self.pump(name);
        }
        Ok(targets.len())
    }

    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            debug!(queue = %name, "Deleted queue");
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|(queue, _)| queue != name);
        }
    }

    fn delete_unused_auto_delete(&mut self, names: &BTreeSet<String>) {
        for name in names {
            let unused = self
                .queues
                .get(name)
                .map(|q| q.config.auto_delete && q.had_consumer && q.consumers.is_empty())
                .unwrap_or(false);
            if unused {
                self.delete_queue(name);
            }
        }
    }

    fn close_channel(&mut self, id: ChannelId, error: Option<&str>) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        if let Some(connection) = self.connections.get_mut(&channel.connection) {
            connection.channels.retain(|open| *open != id);
        }
        let unacked = channel.unacked;

        let mut touched = BTreeSet::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|consumer| {
                if consumer.channel != id {
                    return true;
                }
                if let Some(message) = error {
                    let _ = consumer
                        .sender
                        .unbounded_send(Err(BrokerError::connection(message.to_string())));
                }
                false
            });
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                touched.insert(name.clone());
            }
        }

        // 逆序放回隊首，保持原有順序
        for (_, entry) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
                touched.insert(entry.queue);
            }
        }

        self.delete_unused_auto_delete(&touched);
        for name in &touched {
            self.pump(name);
        }
    }

    fn close_connection(&mut self, id: ConnectionId, error: Option<&str>) {
        let channels = match self.connections.get_mut(&id) {
            Some(connection) if connection.open => {
                connection.open = false;
                std::mem::take(&mut connection.channels)
            }
            _ => return,
        };
        for channel in channels {
            self.close_channel(channel, error);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            self.delete_queue(&name);
        }
    }
}

/// 進程內代理，可複製，所有副本共享狀態
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 連接此代理的傳輸
    pub fn transport(&self) -> Arc<InMemoryTransport> {
        Arc::new(InMemoryTransport {
            broker: self.clone(),
        })
    }

    /// 模擬網絡中斷：強制關閉所有連接，未確認消息重新入列
    pub fn drop_connections(&self) -> usize {
        let mut state = self.state.lock();
        let open: Vec<ConnectionId> = state
            .connections
            .iter()
            .filter(|(_, connection)| connection.open)
            .map(|(id, _)| *id)
            .collect();
        for id in &open {
            state.close_connection(*id, Some("CONNECTION_FORCED - broker forced connection closure"));
        }
        warn!(connections = open.len(), "Dropped all broker connections");
        open.len()
    }

    /// 設為不可達時新連接會被拒絕，已有連接不受影響
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// 不經通道直接發佈原始消息體
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerResult<usize> {
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: MessageProperties::default(),
            data: body.to_vec(),
            redelivered: false,
        };
        self.state
            .lock()
            .route(exchange, routing_key, message)
    }

    /// 就緒（未投遞）的消息數
    pub fn message_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// 已投遞但未確認的消息數
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|entry| entry.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// 交換機上的 (佇列, 綁定鍵) 列表
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// 打開中的連接數
    pub fn connection_count(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|connection| connection.open)
            .count()
    }

    /// 開啟中的通道數
    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }
}

/// `InMemoryBroker` 的傳輸實現
pub struct InMemoryTransport {
    broker: InMemoryBroker,
}

impl InMemoryTransport {
    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self, config: &BrokerConfig) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let mut state = self.broker.state.lock();
        if state.unreachable {
            return Err(BrokerError::connection(format!(
                "{}: connection refused",
                config.redacted_uri()
            )));
        }
        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                channels: Vec::new(),
            },
        );
        info!(connection = id, vhost = %config.vhost, "In-memory broker accepted connection");
        Ok(Arc::new(InMemoryConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    id: ConnectionId,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_connected(&self) -> bool {
        self.broker
            .state
            .lock()
            .connections
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false)
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.state.lock();
        let open = state.connections.get(&self.id).map(|c| c.open).unwrap_or(false);
        if !open {
            return Err(BrokerError::connection(format!("connection {} is closed", self.id)));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                next_delivery_tag: 1,
                consumer_prefetch: 0,
                channel_prefetch: 0,
                unacked: BTreeMap::new(),
            },
        );
        if let Some(connection) = state.connections.get_mut(&self.id) {
            connection.channels.push(id);
        }
        Ok(Arc::new(InMemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.broker.state.lock().close_connection(self.id, None);
        Ok(())
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    id: ChannelId,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.state.lock().ensure_open(self.id).is_ok()
    }

    async fn declare_exchange(&self, exchange: &ExchangeConfig) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        if exchange.name.is_empty() {
            return Ok(());
        }

        if let Some(existing) = state.exchanges.get(&exchange.name) {
            let current = &existing.config;
            let mismatch = if current.kind != exchange.kind {
                Some(format!("'type' (received '{}' but current is '{}')", exchange.kind, current.kind))
            } else if current.durable != exchange.durable {
                Some(format!("'durable' (received '{}' but current is '{}')", exchange.durable, current.durable))
            } else if current.auto_delete != exchange.auto_delete {
                Some(format!(
                    "'auto_delete' (received '{}' but current is '{}')",
                    exchange.auto_delete, current.auto_delete
                ))
            } else {
                None
            };
            return match mismatch {
                None => Ok(()),
                Some(arg) => {
                    let error = BrokerError::topology_conflict(
                        format!("exchange '{}'", exchange.name),
                        format!("PRECONDITION_FAILED - inequivalent arg {}", arg),
                    );
                    Err(state.channel_error(self.id, error))
                }
            };
        }

        state.exchanges.insert(
            exchange.name.clone(),
            ExchangeState {
                config: exchange.clone(),
                bindings: BTreeSet::new(),
            },
        );
        debug!(exchange = %exchange.name, kind = %exchange.kind, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> BrokerResult<String> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let connection = state.channel_connection(self.id);

        let name = if queue.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            queue.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some() && existing.owner != connection {
                let error = BrokerError::channel(
                    405,
                    format!(
                        "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                        name
                    ),
                );
                return Err(state.channel_error(self.id, error));
            }
            let current = &existing.config;
            let mismatch = if current.durable != queue.durable {
                Some("durable")
            } else if current.exclusive != queue.exclusive {
                Some("exclusive")
            } else if current.auto_delete != queue.auto_delete {
                Some("auto_delete")
            } else {
                None
            };
            return match mismatch {
                None => Ok(name),
                Some(arg) => {
                    let error = BrokerError::topology_conflict(
                        format!("queue '{}'", name),
                        format!("PRECONDITION_FAILED - inequivalent arg '{}'", arg),
                    );
                    Err(state.channel_error(self.id, error))
                }
            };
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                config: QueueConfig {
                    name: name.clone(),
                    ..queue.clone()
                },
                owner: if queue.exclusive { connection } else { None },
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                had_consumer: false,
            },
        );
        debug!(queue = %name, durable = queue.durable, exclusive = queue.exclusive, "Declared queue");
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;

        if !state.queues.contains_key(queue) {
            let error = BrokerError::channel(404, format!("NOT_FOUND - no queue '{}'", queue));
            return Err(state.channel_error(self.id, error));
        }
        match state.exchanges.get_mut(exchange) {
            Some(existing) => {
                if existing.bindings.insert((queue.to_string(), routing_key.to_string())) {
                    debug!(queue, exchange, routing_key, "Bound queue");
                }
                Ok(())
            }
            None => {
                let error = BrokerError::channel(404, format!("NOT_FOUND - no exchange '{}'", exchange));
                Err(state.channel_error(self.id, error))
            }
        }
    }

    async fn qos(&self, qos: &QosConfig) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            if qos.global {
                channel.channel_prefetch = qos.prefetch_count;
            } else {
                channel.consumer_prefetch = qos.prefetch_count;
            }
        }
        state.pump_channel_queues(self.id);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            data: body.to_vec(),
            redelivered: false,
        };
        match state.route(exchange, routing_key, message) {
            Ok(0) => {
                debug!(exchange, routing_key, "Message was unroutable and dropped");
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(error) => Err(state.channel_error(self.id, error)),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: &ConsumeOptions,
    ) -> BrokerResult<DeliveryStream> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let connection = state.channel_connection(self.id);
        let prefetch = state
            .channels
            .get(&self.id)
            .map(|c| c.consumer_prefetch)
            .unwrap_or(0);

        let refusal = match state.queues.get(queue) {
            None => Some((404, format!("NOT_FOUND - no queue '{}'", queue))),
            Some(existing) if existing.owner.is_some() && existing.owner != connection => Some((
                405,
                format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    queue
                ),
            )),
            Some(existing)
                if existing.consumers.iter().any(|c| c.exclusive)
                    || (options.exclusive && !existing.consumers.is_empty()) =>
            {
                Some((403, format!("ACCESS_REFUSED - queue '{}' in exclusive use", queue)))
            }
            Some(existing)
                if existing
                    .consumers
                    .iter()
                    .any(|c| c.channel == self.id && c.tag == consumer_tag) =>
            {
                Some((
                    530,
                    format!("NOT_ALLOWED - attempt to reuse consumer tag '{}'", consumer_tag),
                ))
            }
            Some(_) => None,
        };
        if let Some((code, message)) = refusal {
            return Err(state.channel_error(self.id, BrokerError::channel(code, message)));
        }

        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", Uuid::new_v4().simple())
        } else {
            consumer_tag.to_string()
        };
        let (sender, receiver) = mpsc::unbounded();
        if let Some(existing) = state.queues.get_mut(queue) {
            existing.had_consumer = true;
            existing.consumers.push(ConsumerEntry {
                tag: tag.clone(),
                channel: self.id,
                no_ack: options.no_ack,
                exclusive: options.exclusive,
                prefetch,
                sender,
            });
        }
        debug!(queue, consumer_tag = %tag, prefetch, "Registered consumer");
        state.pump(queue);
        Ok(receiver.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let mut touched = BTreeSet::new();
        for (name, queue) in state.queues.iter_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.channel == self.id && c.tag == consumer_tag));
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
                touched.insert(name.clone());
            }
        }
        state.delete_unused_auto_delete(&touched);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag));
        if removed.is_none() {
            let error = BrokerError::channel(
                406,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
            );
            return Err(state.channel_error(self.id, error));
        }
        state.pump_channel_queues(self.id);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_open(self.id)?;
        let removed = state
            .channels
            .get_mut(&self.id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag));
        let Some(entry) = removed else {
            let error = BrokerError::channel(
                406,
                format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag),
            );
            return Err(state.channel_error(self.id, error));
        };

        if requeue {
            if let Some(queue) = state.queues.get_mut(&entry.queue) {
                let mut message = entry.message;
                message.redelivered = true;
                queue.messages.push_front(message);
            }
            state.pump(&entry.queue);
        }
        state.pump_channel_queues(self.id);
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.broker.state.lock().close_channel(self.id, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use rstest::rstest;

    async fn open_channel(broker: &InMemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let connection = broker.transport().connect(&BrokerConfig::default()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        (connection, channel)
    }

    async fn declare_bound_queue(channel: &Arc<dyn BrokerChannel>, queue: &str, pattern: &str) {
        channel.declare_exchange(&ExchangeConfig::topic("events")).await.unwrap();
        channel.declare_queue(&QueueConfig::durable(queue)).await.unwrap();
        channel.bind_queue(queue, "events", pattern).await.unwrap();
    }

    #[rstest]
    #[case("order.*", "order.created", true)]
    #[case("order.*", "order.created.eu", false)]
    #[case("order.#", "order", true)]
    #[case("order.#", "order.created.eu", true)]
    #[case("*.created", "user.created", true)]
    #[case("#.eu", "order.created.eu", true)]
    #[case("#", "", true)]
    #[case("*", "", false)]
    #[case("order.created", "order.updated", false)]
    fn test_topic_matches(#[case] pattern: &str, #[case] key: &str, #[case] expected: bool) {
        assert_eq!(topic_matches(pattern, key), expected);
    }

    proptest! {
        #[test]
        fn prop_hash_matches_everything(words in prop::collection::vec("[a-z]{1,6}", 0..5)) {
            let key = words.join(".");
            prop_assert!(topic_matches("#", &key));
            prop_assert!(topic_matches(&key, &key));
        }

        #[test]
        fn prop_star_matches_one_word_each(words in prop::collection::vec("[a-z]{1,6}", 1..5)) {
            let key = words.join(".");
            let stars = vec!["*"; words.len()].join(".");
            prop_assert!(topic_matches(&stars, &key));
            let one_more = format!("{}.*", stars);
            prop_assert!(!topic_matches(&one_more, &key));
        }
    }

    #[tokio::test]
    async fn test_topic_routing_and_default_exchange() {
        let broker = InMemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        declare_bound_queue(&channel, "orders", "order.*").await;

        let properties = MessageProperties::persistent_json();
        channel.publish("events", "order.created", b"{}", &properties).await.unwrap();
        channel.publish("events", "user.created", b"{}", &properties).await.unwrap();
        channel.publish("", "orders", b"{}", &properties).await.unwrap();

        assert_eq!(broker.message_count("orders"), 2);
    }

    #[tokio::test]
    async fn test_rebinding_is_not_duplicated() {
        let broker = InMemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        declare_bound_queue(&channel, "orders", "order.*").await;
        channel.bind_queue("orders", "events", "order.*").await.unwrap();

        assert_eq!(
            broker.bindings("events"),
            vec![("orders".to_string(), "order.*".to_string())]
        );
    }

    #[tokio::test]
    async fn test_conflicting_redeclare_closes_channel() {
        let broker = InMemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        channel.declare_exchange(&ExchangeConfig::topic("events")).await.unwrap();

        let result = channel
            .declare_exchange(&ExchangeConfig::topic("events").with_kind(ExchangeKind::Fanout))
            .await;

        assert_matches!(result, Err(BrokerError::TopologyConflict { .. }));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_publish_to_unknown_exchange_is_channel_error() {
        let broker = InMemoryBroker::new();
        let (connection, channel) = open_channel(&broker).await;

        let result = channel
            .publish("missing", "key", b"{}", &MessageProperties::default())
            .await;

        assert_matches!(result, Err(BrokerError::Channel { code: 404, .. }));
        assert!(!channel.is_open());
        assert!(connection.is_connected());
    }

    #[rstest]
    #[case::missing_queue("missing", 404)]
    #[case::locked_queue("locked", 405)]
    #[tokio::test]
    async fn test_consume_refusal_is_not_retryable(#[case] queue: &str, #[case] code: u16) {
        let broker = InMemoryBroker::new();
        let (_owner, owner_channel) = open_channel(&broker).await;
        owner_channel
            .declare_queue(&QueueConfig::temporary("locked"))
            .await
            .unwrap();

        let (_connection, channel) = open_channel(&broker).await;
        let result = channel.consume(queue, "c1", &ConsumeOptions::default()).await;

        let error = match result {
            Err(error) => error,
            Ok(_) => panic!("consume on '{}' should be refused", queue),
        };
        assert_matches!(error, BrokerError::Channel { code: c, .. } if c == code);
        assert!(!error.is_retryable());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_closed_channels_are_forgotten() {
        let broker = InMemoryBroker::new();
        let (connection, channel) = open_channel(&broker).await;
        declare_bound_queue(&channel, "orders", "order.*").await;
        assert_eq!(broker.channel_count(), 1);

        for _ in 0..20 {
            let scratch = connection.create_channel().await.unwrap();
            let _ = scratch.publish("missing", "key", b"{}", &MessageProperties::default()).await;
            let reopened = connection.create_channel().await.unwrap();
            reopened.close().await.unwrap();
            assert!(!scratch.is_open());
        }
        assert_eq!(broker.channel_count(), 1);

        connection.close().await.unwrap();
        assert_eq!(broker.channel_count(), 0);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        declare_bound_queue(&channel, "orders", "order.*").await;
        for _ in 0..5 {
            broker.publish_raw("events", "order.created", b"{}").unwrap();
        }

        channel
            .qos(&QosConfig {
                prefetch_count: 2,
                ..QosConfig::default()
            })
            .await
            .unwrap();
        let mut stream = channel
            .consume("orders", "c1", &ConsumeOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.unacked_count("orders"), 2);
        assert_eq!(broker.message_count("orders"), 3);

        let first = stream.next().await.unwrap().unwrap();
        channel.ack(first.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count("orders"), 2);
        assert_eq!(broker.message_count("orders"), 2);
    }

    #[tokio::test]
    async fn test_nack_requeues_at_head_marked_redelivered() {
        let broker = InMemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        declare_bound_queue(&channel, "orders", "order.*").await;
        broker.publish_raw("events", "order.created", b"1").unwrap();
        broker.publish_raw("events", "order.created", b"2").unwrap();

        channel
            .qos(&QosConfig {
                prefetch_count: 1,
                ..QosConfig::default()
            })
            .await
            .unwrap();
        let mut stream = channel
            .consume("orders", "c1", &ConsumeOptions::default())
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        channel.nack(first.delivery_tag, true).await.unwrap();

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.data, b"1");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_channel_close_requeues_unacked_in_order() {
        let broker = InMemoryBroker::new();
        let (connection, channel) = open_channel(&broker).await;
        declare_bound_queue(&channel, "orders", "order.*").await;
        for body in [b"1", b"2", b"3"] {
            broker.publish_raw("events", "order.created", body).unwrap();
        }

        let consumer_channel = connection.create_channel().await.unwrap();
        let _stream = consumer_channel
            .consume("orders", "c1", &ConsumeOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.unacked_count("orders"), 3);

        consumer_channel.close().await.unwrap();
        assert_eq!(broker.unacked_count("orders"), 0);
        assert_eq!(broker.message_count("orders"), 3);

        let mut stream = channel
            .consume("orders", "c2", &ConsumeOptions::default())
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"1");
        assert!(first.redelivered);
    }

    #[tokio::test]
    async fn test_exclusive_queue_is_owned_by_connection() {
        let broker = InMemoryBroker::new();
        let (owner, channel) = open_channel(&broker).await;
        let name = channel.declare_queue(&QueueConfig::temporary("")).await.unwrap();
        assert!(name.starts_with("amq.gen-"));

        let (_other, other_channel) = open_channel(&broker).await;
        let result = other_channel
            .consume(&name, "", &ConsumeOptions::default())
            .await;
        assert!(result.is_err());

        owner.close().await.unwrap();
        assert!(!broker.has_queue(&name));
    }

    #[tokio::test]
    async fn test_auto_delete_queue_goes_with_last_consumer() {
        let broker = InMemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        let queue = QueueConfig {
            auto_delete: true,
            ..QueueConfig::durable("scratch")
        };
        channel.declare_queue(&queue).await.unwrap();
        let _stream = channel
            .consume("scratch", "c1", &ConsumeOptions::default())
            .await
            .unwrap();
        assert!(broker.has_queue("scratch"));

        channel.cancel("c1").await.unwrap();
        assert!(!broker.has_queue("scratch"));
    }

    #[tokio::test]
    async fn test_drop_connections_errors_streams() {
        let broker = InMemoryBroker::new();
        let (connection, channel) = open_channel(&broker).await;
        declare_bound_queue(&channel, "orders", "order.*").await;
        let mut stream = channel
            .consume("orders", "c1", &ConsumeOptions::default())
            .await
            .unwrap();

        assert_eq!(broker.drop_connections(), 1);
        assert!(!connection.is_connected());
        assert_matches!(stream.next().await, Some(Err(BrokerError::Connection { .. })));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let result = broker.transport().connect(&BrokerConfig::default()).await;
        assert!(matches!(result, Err(BrokerError::Connection { .. })));
        assert_eq!(broker.connection_count(), 0);
    }
}
