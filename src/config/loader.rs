use config::{Config, ConfigError, Environment as ConfigEnvironment, File};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// 選擇環境的環境變數名稱
pub const ENV_VAR: &str = "BROKER_ENV";
/// 配置目錄的環境變數名稱
pub const CONFIG_DIR_VAR: &str = "CONFIG_DIR";
/// 環境變數覆蓋的前綴，例如 `BROKER__BROKER__HOST`
pub const ENV_PREFIX: &str = "BROKER";

/// 環境類型枚舉
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// 從環境變數取得當前環境設定
    pub fn from_env() -> Self {
        match env::var(ENV_VAR)
            .unwrap_or_else(|_| "development".into())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }

    /// 轉換為配置文件名
    pub fn as_filename(&self) -> &'static str {
        match self {
            Environment::Development => "development.toml",
            Environment::Production => "production.toml",
        }
    }
}

/// 配置加載器，負責根據環境加載適當的配置
pub struct ConfigLoader;

impl ConfigLoader {
    /// 當前使用的配置目錄
    pub fn config_dir() -> PathBuf {
        PathBuf::from(env::var(CONFIG_DIR_VAR).unwrap_or_else(|_| "config".into()))
    }

    /// 載入指定環境的配置
    pub fn load(env: Environment) -> Result<Config, ConfigError> {
        Self::load_from_dir(Self::config_dir(), env)
    }

    /// 從指定目錄載入環境配置
    ///
    /// 配置文件不存在時只使用預設值與環境變數。
    pub fn load_from_dir(dir: impl AsRef<Path>, env: Environment) -> Result<Config, ConfigError> {
        let config_path = dir.as_ref().join(env.as_filename());

        Config::builder()
            // 加載環境特定配置
            .add_source(File::from(config_path).required(false))
            // 從環境變數加載配置（優先級高於文件配置）
            .add_source(
                ConfigEnvironment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
    }

    /// 載入當前環境的配置
    pub fn load_current() -> Result<Config, ConfigError> {
        Self::load(Environment::from_env())
    }
}

/// 配置獲取輔助特性
pub trait ConfigExt {
    /// 從配置中獲取並反序列化指定部分
    fn get_section<'a, T: Deserialize<'a>>(&'a self, section: &str) -> Result<T, ConfigError>;
}

impl ConfigExt for Config {
    fn get_section<'a, T: Deserialize<'a>>(&'a self, section: &str) -> Result<T, ConfigError> {
        self.get(section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_environment_from_env() {
        env::remove_var(ENV_VAR);
        assert_eq!(Environment::from_env(), Environment::Development);

        env::set_var(ENV_VAR, "production");
        assert_eq!(Environment::from_env(), Environment::Production);

        env::set_var(ENV_VAR, "PROD");
        assert_eq!(Environment::from_env(), Environment::Production);

        env::set_var(ENV_VAR, "staging");
        assert_eq!(Environment::from_env(), Environment::Development);

        env::remove_var(ENV_VAR);
    }

    #[test]
    fn test_environment_as_filename() {
        assert_eq!(Environment::Development.as_filename(), "development.toml");
        assert_eq!(Environment::Production.as_filename(), "production.toml");
    }

    #[test]
    #[serial]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load_from_dir(dir.path(), Environment::Production);
        assert!(config.is_ok());
    }
}
