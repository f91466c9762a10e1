// logging.rs - 日誌系統初始化
//
// 以 tracing-subscriber 建立全局訂閱者，可選輸出到按日滾動的文件。

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// 初始化日誌系統
///
/// `RUST_LOG` 存在時優先於配置中的級別。返回的 `WorkerGuard` 必須在程序結束前一直持有，
/// 否則文件輸出的緩衝內容會遺失。
pub fn init_logging(log_config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_config.level.to_lowercase()))
        .map_err(|e| anyhow!("無效的日誌級別 {}: {}", log_config.level, e))?;

    let (writer, guard) = match &log_config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &log_config.file_prefix);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true);

    let result = match log_config.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    result.map_err(|e| anyhow!("設置日誌系統失敗: {}", e))?;

    info!(level = %log_config.level, format = %log_config.format, "Logging initialised");
    Ok(guard)
}
