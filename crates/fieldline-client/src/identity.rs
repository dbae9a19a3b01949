//! 机箱身份表持久化
//!
//! 记录 "地址:端口" → 机箱 ID 的映射，使程序重启后仍以相同的逻辑 ID 连接同一批机箱。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::FleetError;

/// 机箱名称 → ID
pub type ChassisIdentityMap = BTreeMap<String, u32>;

/// 身份表读写接口
pub trait ChassisIdentityStore: Send + Sync {
    fn load(&self) -> Result<ChassisIdentityMap, FleetError>;
    fn save(&self, map: &ChassisIdentityMap) -> Result<(), FleetError>;
}

/// 内存实现（测试或不需要持久化时使用）
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    map: Mutex<ChassisIdentityMap>,
}

impl MemoryIdentityStore {
    pub fn new(map: ChassisIdentityMap) -> Self {
        Self {
            map: Mutex::new(map),
        }
    }
}

impl ChassisIdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<ChassisIdentityMap, FleetError> {
        Ok(self.map.lock().clone())
    }

    fn save(&self, map: &ChassisIdentityMap) -> Result<(), FleetError> {
        *self.map.lock() = map.clone();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IdentityFile {
    #[serde(default)]
    chassis: ChassisIdentityMap,
}

/// TOML 文件实现
///
/// ```toml
/// [chassis]
/// "192.168.2.43:7777" = 0
/// "192.168.2.44:7777" = 1
/// ```
#[derive(Debug, Clone)]
pub struct TomlIdentityStore {
    path: PathBuf,
}

impl TomlIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ChassisIdentityStore for TomlIdentityStore {
    /// 文件不存在时返回空表
    fn load(&self) -> Result<ChassisIdentityMap, FleetError> {
        if !self.path.exists() {
            debug!("Identity file {} does not exist", self.path.display());
            return Ok(ChassisIdentityMap::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        let file: IdentityFile = toml::from_str(&text)?;
        Ok(file.chassis)
    }

    fn save(&self, map: &ChassisIdentityMap) -> Result<(), FleetError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            chassis: map.clone(),
        };
        std::fs::write(&self.path, toml::to_string_pretty(&file)?)?;
        info!("Saved {} chassis identities to {}", map.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> ChassisIdentityMap {
        let mut map = ChassisIdentityMap::new();
        map.insert("192.168.2.43:7777".into(), 0);
        map.insert("192.168.2.44:7777".into(), 1);
        map
    }

    #[test]
    fn test_toml_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlIdentityStore::new(dir.path().join("chassis.toml"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_toml_store_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlIdentityStore::new(dir.path().join("nested").join("chassis.toml"));
        store.save(&sample_map()).unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("[chassis]"));
        assert_eq!(store.load().unwrap(), sample_map());
    }

    #[test]
    fn test_toml_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chassis.toml");
        std::fs::write(&path, "[chassis]\n\"a:1\" = \"zero\"\n").unwrap();
        let store = TomlIdentityStore::new(path);
        assert!(matches!(store.load(), Err(FleetError::Config(_))));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryIdentityStore::default();
        assert!(store.load().unwrap().is_empty());
        store.save(&sample_map()).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }
}
