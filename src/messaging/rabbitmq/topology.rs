use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::messaging::rabbitmq::error::BrokerResult;
use crate::messaging::rabbitmq::transport::BrokerChannel;

/// 一次拓撲宣告的統計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyReport {
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
}

/// 依配置宣告交換機、佇列與綁定
///
/// 重複宣告相同參數是無操作；參數衝突時返回 `TopologyConflict`。
pub struct TopologyDeclarer;

impl TopologyDeclarer {
    pub async fn declare(channel: &dyn BrokerChannel, config: &BrokerConfig) -> BrokerResult<TopologyReport> {
        let mut report = TopologyReport::default();

        for exchange in config.exchanges.values() {
            debug!(exchange = %exchange.name, kind = %exchange.kind, "Declaring exchange");
            channel.declare_exchange(exchange).await?;
            report.exchanges += 1;
        }

        let mut bindings = Vec::new();
        for queue in config.queues.values() {
            debug!(queue = %queue.name, "Declaring queue");
            let name = channel.declare_queue(queue).await?;
            report.queues += 1;

            let exchange = config.binding_exchange(queue);
            for routing_key in &queue.routing_keys {
                bindings.push((name.clone(), exchange, routing_key.as_str()));
            }
        }

        for (queue, exchange, routing_key) in bindings {
            debug!(queue = %queue, exchange, routing_key, "Binding queue");
            channel.bind_queue(&queue, exchange, routing_key).await?;
            report.bindings += 1;
        }

        info!(
            exchanges = report.exchanges,
            queues = report.queues,
            bindings = report.bindings,
            "Topology declared"
        );
        Ok(report)
    }
}
