//! 机群管理器构建器

use std::sync::Arc;

use fieldline_driver::DriverError;
use fieldline_net::{Connector, TlsConnector};
use fieldline_protocol::{BinaryCodec, MessageCodec};

use crate::callback::{FleetCallbacks, NoopCallbacks};
use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::fleet::{FleetInner, FleetManager};
use crate::hardware_state::{HardwareState, LocationTable};
use crate::identity::{ChassisIdentityStore, MemoryIdentityStore};

/// [`FleetManager`] 构建器
///
/// ```no_run
/// use std::sync::Arc;
/// use fieldline_client::{FleetConfig, FleetManager, TomlIdentityStore};
///
/// let fleet = FleetManager::builder()
///     .config(FleetConfig::load("fleet.toml")?)
///     .identity_store(Arc::new(TomlIdentityStore::new("chassis.toml")))
///     .build()?;
/// fleet.startup()?;
/// # Ok::<(), fieldline_client::FleetError>(())
/// ```
#[derive(Default)]
pub struct FleetBuilder {
    config: FleetConfig,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn MessageCodec>>,
    callbacks: Option<Arc<dyn FleetCallbacks>>,
    identity_store: Option<Arc<dyn ChassisIdentityStore>>,
    locations: Option<LocationTable>,
}

impl FleetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: FleetConfig) -> Self {
        self.config = config;
        self
    }

    /// 传输层（默认 [`TlsConnector`]）
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn FleetCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// 身份表存储（默认只保存在内存中）
    pub fn identity_store(mut self, store: Arc<dyn ChassisIdentityStore>) -> Self {
        self.identity_store = Some(store);
        self
    }

    /// 标定位置表（缺省的传感器使用按槽位计算的位置）
    pub fn location_table(mut self, table: LocationTable) -> Self {
        self.locations = Some(table);
        self
    }

    /// 启动监视线程，并登记配置中的手动地址
    pub fn build(self) -> Result<FleetManager, FleetError> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TlsConnector::new().map_err(DriverError::from)?),
        };
        let codec = self.codec.unwrap_or_else(|| Arc::new(BinaryCodec));
        let callbacks = self.callbacks.unwrap_or_else(|| Arc::new(NoopCallbacks));
        let identity_store = self
            .identity_store
            .unwrap_or_else(|| Arc::new(MemoryIdentityStore::default()));

        let hardware = HardwareState::new();
        if let Some(table) = self.locations {
            hardware.set_location_table(table);
        }

        FleetManager::start_with(FleetInner::new(
            self.config,
            connector,
            codec,
            callbacks,
            identity_store,
            hardware,
        ))
    }
}
