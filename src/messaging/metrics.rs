use metrics::{counter, histogram};
use std::time::Duration;

/// 監控指標命名空間
pub const METRIC_NAMESPACE: &str = "service_broker";

/// 消息指標類型
#[derive(Debug, Clone, Copy)]
pub enum MetricType<'a> {
    Published { exchange: &'a str },
    Delivered { queue: &'a str },
    Acked { queue: &'a str },
    Requeued { queue: &'a str },
    Rejected { queue: &'a str },
    HandlerLatency { queue: &'a str },
}

/// 消息層監控指標記錄器
pub struct MessagingMetrics;

impl MessagingMetrics {
    /// 記錄消息指標
    ///
    /// # Arguments
    /// * `metric_type` - 指標類型
    /// * `duration` - 可選的持續時間，用於延遲指標
    pub fn record(metric_type: MetricType<'_>, duration: Option<Duration>) {
        match metric_type {
            MetricType::Published { exchange } => {
                counter!(
                    format!("{}.published", METRIC_NAMESPACE),
                    "exchange" => exchange.to_string()
                )
                .increment(1);
            }
            MetricType::Delivered { queue } => {
                counter!(
                    format!("{}.delivered", METRIC_NAMESPACE),
                    "queue" => queue.to_string()
                )
                .increment(1);
            }
            MetricType::Acked { queue } => {
                counter!(
                    format!("{}.acked", METRIC_NAMESPACE),
                    "queue" => queue.to_string()
                )
                .increment(1);
            }
            MetricType::Requeued { queue } => {
                counter!(
                    format!("{}.requeued", METRIC_NAMESPACE),
                    "queue" => queue.to_string()
                )
                .increment(1);
            }
            MetricType::Rejected { queue } => {
                counter!(
                    format!("{}.rejected", METRIC_NAMESPACE),
                    "queue" => queue.to_string()
                )
                .increment(1);
            }
            MetricType::HandlerLatency { queue } => {
                if let Some(dur) = duration {
                    histogram!(
                        format!("{}.handler_latency_seconds", METRIC_NAMESPACE),
                        "queue" => queue.to_string()
                    )
                    .record(dur.as_secs_f64());
                }
            }
        }
    }

    /// 記錄重新連接
    pub fn record_reconnect() {
        counter!(format!("{}.reconnects", METRIC_NAMESPACE)).increment(1);
    }

    /// 記錄 RPC 請求結果
    pub fn record_rpc(outcome: &'static str, duration: Duration) {
        counter!(
            format!("{}.rpc_requests", METRIC_NAMESPACE),
            "outcome" => outcome
        )
        .increment(1);
        histogram!(format!("{}.rpc_latency_seconds", METRIC_NAMESPACE)).record(duration.as_secs_f64());

        if outcome == "timeout" {
            counter!(format!("{}.rpc_timeouts", METRIC_NAMESPACE)).increment(1);
        }
    }

    /// 記錄無人等待的回應（逾時後到達或重複）
    pub fn record_unmatched_reply() {
        counter!(format!("{}.unmatched_replies", METRIC_NAMESPACE)).increment(1);
    }
}
