//! 机群配置
//!
//! 全部字段可省略，省略时取默认值。可以从 TOML 字符串或文件加载：
//!
//! ```
//! use fieldline_client::FleetConfig;
//!
//! let config = FleetConfig::from_toml_str(r#"
//!     burst_size = 20
//!     [connection]
//!     heartbeat_interval_ms = 500
//! "#)?;
//! assert_eq!(config.burst_size, 20);
//! assert_eq!(config.port, 7777);
//! assert_eq!(config.connection.heartbeat_interval_ms, 500);
//! # Ok::<(), fieldline_client::FleetError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use fieldline_driver::ConnectionConfig;
use fieldline_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// 发现服务名称前缀
pub const DEFAULT_SERVICE_PREFIX: &str = "Fieldline";

/// 一次交给消费者的批次数
pub const DEFAULT_BURST_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// 机箱端口
    pub port: u16,
    /// 只接受名称以此开头的发现服务（前面还可以再加 `zeroconf_prefix`）
    pub service_prefix: String,
    /// 附加在 `service_prefix` 之前的前缀（用于区分同一网络上的多套系统）
    pub zeroconf_prefix: String,
    /// 连接监视器周期（毫秒）
    pub monitor_period_ms: u64,
    /// 帧同步线程从单个机箱队列取包的超时（毫秒）
    pub sync_pop_timeout_ms: u64,
    /// 每次回调携带的批次数
    pub burst_size: usize,
    /// 开发者模式（允许配置任意数据类型）
    pub developer_mode: bool,
    /// 手动指定的机箱地址（不依赖发现服务）
    pub manual_hosts: Vec<String>,
    /// 单个机箱会话配置
    pub connection: ConnectionConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            service_prefix: DEFAULT_SERVICE_PREFIX.to_string(),
            zeroconf_prefix: String::new(),
            monitor_period_ms: 1000,
            sync_pop_timeout_ms: 10,
            burst_size: DEFAULT_BURST_SIZE,
            developer_mode: false,
            manual_hosts: Vec::new(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl FleetConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, FleetError> {
        let config: FleetConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, FleetError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, FleetError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), FleetError> {
        if self.burst_size == 0 {
            return Err(FleetError::Config("burst_size must be at least 1".into()));
        }
        if self.monitor_period_ms == 0 {
            return Err(FleetError::Config("monitor_period_ms must be positive".into()));
        }
        Ok(())
    }

    /// 完整的服务名称前缀
    pub fn service_name_prefix(&self) -> String {
        format!("{}{}", self.zeroconf_prefix, self.service_prefix)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }

    pub fn sync_pop_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_pop_timeout_ms)
    }
}
