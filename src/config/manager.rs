use config::ConfigError;
use thiserror::Error;
use tracing::debug;

use crate::config::loader::{ConfigLoader, Environment};
use crate::config::types::ApplicationConfig;
use crate::config::validation::{ValidationError, Validator};

/// 配置加載錯誤
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("無法讀取配置: {0}")]
    Source(#[from] ConfigError),

    #[error("配置驗證失敗: {0}")]
    Invalid(#[from] ValidationError),
}

/// 從環境變數指定的環境加載配置
///
/// 配置在啟動時加載一次，由調用方持有並向下傳遞，不存放在全局狀態中。
pub fn load_config() -> Result<ApplicationConfig, ConfigLoadError> {
    ApplicationConfig::load_from_env()
}

/// ApplicationConfig 加載方法實現
impl ApplicationConfig {
    /// 從環境變數指定的環境加載配置
    pub fn load_from_env() -> Result<Self, ConfigLoadError> {
        let env = Environment::from_env();
        debug!(environment = ?env, "Loading configuration");
        Self::load(env)
    }

    /// 從指定環境加載配置
    pub fn load(env: Environment) -> Result<Self, ConfigLoadError> {
        Self::from_source(ConfigLoader::load(env)?)
    }

    /// 從指定目錄加載配置
    pub fn load_from_dir(
        dir: impl AsRef<std::path::Path>,
        env: Environment,
    ) -> Result<Self, ConfigLoadError> {
        Self::from_source(ConfigLoader::load_from_dir(dir, env)?)
    }

    fn from_source(source: config::Config) -> Result<Self, ConfigLoadError> {
        // 使用 serde 反序列化配置
        let app_config: ApplicationConfig = source.try_deserialize()?;

        app_config.validate()?;
        debug!("Configuration validated");

        Ok(app_config)
    }
}
