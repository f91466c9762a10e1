use thiserror::Error;

use crate::messaging::BrokerError;

/// 工作進程錯誤類型
#[derive(Error, Debug)]
pub enum WorkerError {
    /// 配置錯誤
    #[error("配置錯誤: {0}")]
    Config(String),

    /// 消息代理錯誤
    #[error("消息代理錯誤: {0}")]
    Broker(#[from] BrokerError),

    /// 單一佇列的消費者失敗
    #[error("佇列 {queue} 的消費者失敗: {source}")]
    Consumer {
        queue: String,
        #[source]
        source: BrokerError,
    },

    /// 初始化錯誤
    #[error("初始化錯誤: {0}")]
    Initialization(String),

    /// 運行時錯誤
    #[error("運行時錯誤: {0}")]
    Runtime(String),
}

/// 工作進程結果類型別名
pub type WorkerResult<T> = Result<T, WorkerError>;
