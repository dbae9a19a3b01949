//! 发现服务事件
//!
//! 网络发现本身不在本 crate 内实现，调用方把"服务出现/消失"事件送入
//! [`FleetManager::attach_discovery`](crate::FleetManager::attach_discovery) 的通道即可。
//!
//! 服务属性中带 `master` 的是多机箱固件；不带的是旧的单机箱设备。
//! 多机箱固件的 `serial` 与 `master` 必须以固定后缀结尾，否则拒绝。

use std::collections::BTreeMap;

use fieldline_net::Endpoint;
use fieldline_protocol::{SystemStatus, VALID_SERIAL_SUFFIX};

use crate::error::FleetError;

/// 服务属性
pub type ServiceProperties = BTreeMap<String, String>;

/// 发现事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added {
        name: String,
        address: String,
        port: u16,
        properties: ServiceProperties,
    },
    Removed {
        name: String,
    },
}

/// 校验通过的服务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// 发现服务名称
    pub service_name: String,
    pub endpoint: Endpoint,
    /// 旧的单机箱设备（不支持系统状态查询）
    pub legacy: bool,
    /// 服务属性中携带的系统信息（旧设备没有 `master`；手动地址为 `None`）
    pub system: Option<SystemStatus>,
}

impl ServiceInfo {
    /// 机箱名（`address:port`）
    pub fn chassis_name(&self) -> String {
        self.endpoint.to_string()
    }

    /// 手动指定的地址（不经发现服务，连接前查询系统状态）
    pub fn manual(host: &str, port: u16) -> Self {
        Self {
            service_name: format!("manual:{}", host),
            endpoint: Endpoint::new(host, port),
            legacy: false,
            system: None,
        }
    }

    /// 校验一个"服务出现"事件
    pub fn from_event(
        name: &str,
        address: &str,
        port: u16,
        properties: &ServiceProperties,
        prefix: &str,
    ) -> Result<Self, FleetError> {
        let invalid = |reason: &str| FleetError::InvalidService {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if !name.starts_with(prefix) {
            return Err(invalid(&format!("name does not start with {:?}", prefix)));
        }
        if address.is_empty() {
            return Err(invalid("no address"));
        }

        let number = |key: &str| -> Result<u32, FleetError> {
            match properties.get(key) {
                Some(v) => v
                    .parse()
                    .map_err(|_| invalid(&format!("{} {:?} is not a number", key, v))),
                None => Ok(0),
            }
        };
        let num = number("num")?;
        let total = number("total")?;
        let version = properties.get("version").cloned().unwrap_or_default();
        let serial = properties.get("serial").map(String::as_str).unwrap_or("");

        let endpoint = Endpoint::new(address, port);
        let Some(master) = properties.get("master") else {
            return Ok(Self {
                service_name: name.to_string(),
                endpoint,
                legacy: true,
                system: Some(SystemStatus {
                    num,
                    total,
                    version,
                    master: String::new(),
                    serial: serial.to_string(),
                }),
            });
        };

        if !serial.ends_with(VALID_SERIAL_SUFFIX) {
            return Err(invalid(&format!("serial {:?} is not valid", serial)));
        }
        if !master.ends_with(VALID_SERIAL_SUFFIX) {
            return Err(invalid(&format!("master {:?} is not valid", master)));
        }

        Ok(Self {
            service_name: name.to_string(),
            endpoint,
            legacy: false,
            system: Some(SystemStatus {
                num,
                total,
                version,
                master: master.clone(),
                serial: serial.to_string(),
            }),
        })
    }
}

/// 已发现的机箱
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredChassis {
    pub info: ServiceInfo,
    /// 最近一次系统状态（来自服务属性、一次性查询或会话）
    pub system: Option<SystemStatus>,
    /// 闭环状态（未知为 `None`）
    pub closed_loop: Option<bool>,
    /// 服务已消失，等待确认移除
    pub pending_removal: bool,
    /// 多机箱固件已通过一次性查询确认在线
    pub confirmed: bool,
}

impl DiscoveredChassis {
    pub fn new(info: ServiceInfo) -> Self {
        let system = info.system.clone();
        Self {
            confirmed: info.legacy,
            info,
            system,
            closed_loop: None,
            pending_removal: false,
        }
    }

    pub fn name(&self) -> String {
        self.info.chassis_name()
    }

    pub fn version(&self) -> Option<&str> {
        self.system
            .as_ref()
            .map(|s| s.version.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn total(&self) -> Option<u32> {
        self.system.as_ref().map(|s| s.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> ServiceProperties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_multi_chassis_service() {
        let info = ServiceInfo::from_event(
            "FieldlineChassis-02",
            "192.168.2.44",
            7777,
            &props(&[
                ("master", "FLM0117"),
                ("serial", "FLC0217"),
                ("num", "1"),
                ("total", "2"),
                ("version", "4.1.0"),
            ]),
            "Fieldline",
        )
        .unwrap();
        assert!(!info.legacy);
        assert_eq!(info.chassis_name(), "192.168.2.44:7777");
        let system = info.system.unwrap();
        assert_eq!((system.num, system.total), (1, 2));
        assert_eq!(system.version, "4.1.0");
    }

    #[test]
    fn test_legacy_service() {
        let info =
            ServiceInfo::from_event("Fieldline-old", "10.0.0.5", 7777, &props(&[]), "Fieldline")
                .unwrap();
        assert!(info.legacy);
        assert_eq!(info.system.as_ref().map(|s| s.total), Some(0));
        assert!(DiscoveredChassis::new(info).confirmed);
    }

    #[test]
    fn test_legacy_service_keeps_fleet_size() {
        let info = ServiceInfo::from_event(
            "Fieldline-old",
            "10.0.0.5",
            7777,
            &props(&[("num", "2"), ("total", "3"), ("serial", "FL0042")]),
            "Fieldline",
        )
        .unwrap();
        assert!(info.legacy);
        let chassis = DiscoveredChassis::new(info);
        assert_eq!(chassis.total(), Some(3));
        let system = chassis.system.unwrap();
        assert_eq!(system.num, 2);
        assert_eq!(system.serial, "FL0042");
        assert!(system.master.is_empty());

        let bad = props(&[("total", "many")]);
        assert!(ServiceInfo::from_event("Fieldline-old", "a", 7777, &bad, "Fieldline").is_err());
    }

    #[test]
    fn test_rejects_foreign_prefix() {
        let err = ServiceInfo::from_event("Printer", "10.0.0.9", 631, &props(&[]), "Fieldline")
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidService { .. }));

        assert!(
            ServiceInfo::from_event("Fieldline-1", "10.0.0.9", 7777, &props(&[]), "lab-Fieldline")
                .is_err()
        );
    }

    #[test]
    fn test_rejects_bad_serial_suffix() {
        let bad_serial = props(&[("master", "FLM0117"), ("serial", "FLC0299")]);
        assert!(ServiceInfo::from_event("Fieldline", "a", 7777, &bad_serial, "Fieldline").is_err());

        let bad_master = props(&[("master", "FLM0100"), ("serial", "FLC0217")]);
        assert!(ServiceInfo::from_event("Fieldline", "a", 7777, &bad_master, "Fieldline").is_err());

        let bad_total = props(&[("master", "M17"), ("serial", "S17"), ("total", "two")]);
        assert!(ServiceInfo::from_event("Fieldline", "a", 7777, &bad_total, "Fieldline").is_err());
    }

    #[test]
    fn test_manual_host() {
        let info = ServiceInfo::manual("192.168.2.43", 7777);
        assert!(!info.legacy);
        assert_eq!(info.chassis_name(), "192.168.2.43:7777");
        assert!(!DiscoveredChassis::new(info).confirmed);
    }
}
