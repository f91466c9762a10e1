/// 配置管理模組
///
/// 本模組負責加載、驗證和管理消息代理層的配置。
/// 支持從開發與生產環境的配置文件加載，並允許環境變數覆蓋。
// 宣告子模組
pub mod loader;
pub mod manager;
pub mod types;
pub mod validation;

// 重新導出常用組件
pub use loader::{ConfigExt, ConfigLoader, Environment};
pub use manager::load_config;
pub use types::*;
pub use validation::{validate_config, ValidationError, ValidationUtils, Validator};
