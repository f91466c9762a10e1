use std::time::Duration;

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::config::ValidationError;

/// 消息代理層的錯誤類型
#[derive(Error, Debug)]
pub enum BrokerError {
    /// 代理不可達或連接中斷，調用方可重試
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    /// 宣告的資源參數與代理現有狀態衝突，需要人工介入
    #[error("Topology conflict on {resource}: {message}")]
    TopologyConflict { resource: String, message: String },

    /// 代理拒絕操作（資源不存在、無權限或被鎖定），重試不會改變結果
    #[error("Broker refused operation ({code}): {message}")]
    Channel { code: u16, message: String },

    /// 載荷無法編碼，屬於調用方錯誤
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerdeError),

    /// 業務處理器在分派時失敗
    #[error("Handler for '{event_type}' failed: {source}")]
    Handler {
        event_type: String,
        #[source]
        source: anyhow::Error,
    },

    /// 截止時間內未收到回應
    #[error("No reply for request {correlation_id} within {timeout:?}")]
    RequestTimeout {
        correlation_id: String,
        timeout: Duration,
    },

    /// 消費者遇到不可恢復的通道錯誤
    #[error("Consumer on queue '{queue}' faulted: {message}")]
    ConsumerFaulted { queue: String, message: String },

    /// 回應監聽器在請求完成前關閉
    #[error("Reply channel closed before a reply arrived")]
    ChannelClosed,

    #[error("Invalid broker configuration: {0}")]
    Config(#[from] ValidationError),
}

/// 消息代理結果類型別名
pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    pub fn connection(message: impl Into<String>) -> Self {
        BrokerError::Connection {
            message: message.into(),
        }
    }

    pub fn topology_conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        BrokerError::TopologyConflict {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// AMQP 回覆碼，例如 404 `NOT_FOUND`、403 `ACCESS_REFUSED`
    pub fn channel(code: u16, message: impl Into<String>) -> Self {
        BrokerError::Channel {
            code,
            message: message.into(),
        }
    }

    /// 從 lapin 錯誤轉換，並記錄涉及的資源
    ///
    /// `PRECONDITION_FAILED` 表示重複宣告的參數不一致；其他通道級拒絕
    /// 映射為 `Channel`，只有 I/O 與連接級錯誤可重試。
    pub fn from_lapin(resource: &str, error: LapinError) -> Self {
        if let LapinError::ProtocolError(amqp_error) = &error {
            match amqp_error.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    return BrokerError::topology_conflict(resource, amqp_error.to_string());
                }
                AMQPErrorKind::Soft(soft) => {
                    return BrokerError::channel(
                        soft.get_id(),
                        format!("{}: {}", resource, amqp_error),
                    );
                }
                AMQPErrorKind::Hard(_) => {}
            }
        }
        BrokerError::connection(format!("{}: {}", resource, error))
    }

    /// 調用方是否可以重試
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection { .. } | BrokerError::RequestTimeout { .. } | BrokerError::ChannelClosed
        )
    }

    /// HTTP 服務轉換錯誤時使用的狀態碼
    ///
    /// 連接與超時錯誤對應 503，而非讓請求線程崩潰。
    pub fn http_status(&self) -> u16 {
        match self {
            BrokerError::Connection { .. }
            | BrokerError::RequestTimeout { .. }
            | BrokerError::ChannelClosed => 503,
            BrokerError::TopologyConflict { .. } => 409,
            BrokerError::Channel { code, .. } => match code {
                403 => 403,
                404 => 404,
                405 => 409,
                _ => 500,
            },
            BrokerError::Serialization(_) => 400,
            _ => 500,
        }
    }
}

impl From<LapinError> for BrokerError {
    fn from(error: LapinError) -> Self {
        BrokerError::from_lapin("channel", error)
    }
}
