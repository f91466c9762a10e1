use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use tracing::{info, warn};

use service_broker::config::{self, MetricsConfig};
use service_broker::logging::init_logging;
use service_broker::messaging::{Broker, DeliveryMetadata, HandlerOutcome, MessageHandler};
use service_broker::worker::WorkerBuilder;

/// RabbitMQ 消息代理命令行工具
#[derive(Parser, Debug)]
#[command(name = "service-broker", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 宣告配置中的交換機、佇列與綁定後退出
    Declare,
    /// 發佈一條 JSON 消息
    Publish {
        #[arg(long)]
        exchange: String,
        #[arg(long)]
        routing_key: String,
        /// JSON 消息體
        #[arg(long)]
        payload: String,
    },
    /// 發送 RPC 請求並打印回應
    Request {
        /// 預設為配置中的 rpc.exchange
        #[arg(long)]
        exchange: Option<String>,
        #[arg(long)]
        routing_key: String,
        #[arg(long)]
        payload: String,
        /// 預設為配置中的 rpc.default_timeout_ms
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// 消費佇列，記錄並確認每條消息
    Consume {
        /// 配置鍵或佇列名稱，可重複
        #[arg(long = "queue", required = true)]
        queues: Vec<String>,
        /// 總時限（秒），未設置時運行到收到終止信號
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化配置
    let app_config = config::load_config()?;

    // 初始化日誌系統，guard 需持有到程序結束
    let _log_guard = init_logging(&app_config.log)?;

    if app_config.metrics.enabled {
        install_metrics_exporter(&app_config.metrics)?;
    }

    let broker = Broker::amqp(app_config.broker.clone())?;
    info!(
        service = %app_config.service.name,
        uri = %broker.config().redacted_uri(),
        "Broker client created"
    );

    match cli.command {
        Command::Declare => {
            let report = broker
                .run_scoped(|broker| async move { broker.declare_topology().await })
                .await?;
            info!(
                exchanges = report.exchanges,
                queues = report.queues,
                bindings = report.bindings,
                "Topology declared"
            );
        }
        Command::Publish {
            exchange,
            routing_key,
            payload,
        } => {
            let payload = parse_payload(&payload)?;
            broker
                .run_scoped(|broker| async move {
                    broker.publish(&exchange, &routing_key, &payload).await
                })
                .await?;
            info!("Message published");
        }
        Command::Request {
            exchange,
            routing_key,
            payload,
            timeout_ms,
        } => {
            let payload = parse_payload(&payload)?;
            let exchange = exchange.unwrap_or_else(|| app_config.broker.rpc.exchange.clone());
            let timeout = timeout_ms.map(Duration::from_millis);
            let reply = broker
                .run_scoped(|broker| async move {
                    broker.request(&exchange, &routing_key, &payload, timeout).await
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Command::Consume {
            queues,
            timeout_secs,
        } => {
            let handler: Arc<dyn MessageHandler> = Arc::new(log_message);
            let worker = queues
                .iter()
                .fold(WorkerBuilder::new().with_broker(broker), |builder, queue| {
                    builder.route(queue.clone(), handler.clone())
                })
                .with_timeout(timeout_secs.map(Duration::from_secs))
                .build()?;

            let reports = worker.run().await?;
            for report in reports {
                info!(
                    queue = %report.queue,
                    delivered = report.delivered,
                    acked = report.acked,
                    requeued = report.requeued,
                    stop_reason = ?report.stop_reason,
                    "Consumer summary"
                );
            }
        }
    }

    Ok(())
}

fn parse_payload(payload: &str) -> Result<Value> {
    serde_json::from_str(payload).with_context(|| format!("消息體不是有效的 JSON: {}", payload))
}

async fn log_message(body: Value, metadata: DeliveryMetadata) -> Result<HandlerOutcome> {
    if metadata.redelivered {
        warn!(queue = %metadata.queue, delivery_tag = metadata.delivery_tag, "Redelivered message");
    }
    info!(
        queue = %metadata.queue,
        routing_key = %metadata.routing_key,
        delivery_tag = metadata.delivery_tag,
        body = %body,
        "Received message"
    );
    Ok(HandlerOutcome::Ack)
}

fn install_metrics_exporter(metrics: &MetricsConfig) -> Result<()> {
    let listen: SocketAddr = metrics
        .listen
        .parse()
        .with_context(|| format!("無效的指標監聽地址: {}", metrics.listen))?;

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .map_err(|e| anyhow!("無法啟動 Prometheus 導出器: {}", e))?;

    info!(listen = %listen, "Prometheus exporter listening");
    Ok(())
}
