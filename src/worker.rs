// worker.rs - 消費者進程核心組件，宣告子模組
//
// 工作進程負責消費者的生命週期管理，實現：
// - 每個佇列一個消費者任務
// - 終止信號轉為協作式停止
// - 所有退出路徑上關閉連接

/// 工作進程構建器實現
pub mod builder;
/// 工作進程級別錯誤處理
pub mod error;
/// 終止信號監聽
pub mod signal;

// 重新導出核心組件，簡化外部使用
pub use builder::{Worker, WorkerBuilder};
pub use error::{WorkerError, WorkerResult};

/// 工作進程狀態枚舉
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// 正在連接並啟動消費者
    Initializing,
    /// 消費者正在運行
    Running,
    /// 所有消費者已結束，正在關閉連接
    ShuttingDown,
    /// 連接已關閉
    Stopped,
}
