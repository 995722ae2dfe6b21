//! 模块持久化存储
//!
//! 注册表把已安装模块的来源与自启动标记写入注入的键值存储，
//! 框架重启后据此恢复。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::utils::id::ModuleId;
use crate::utils::Result;

const MODULE_KEY_PREFIX: &str = "module.";

/// 键值存储接口
pub trait MetadataStore: Send + Sync {
    /// 读取
    fn get(&self, key: &str) -> Option<String>;

    /// 写入（覆盖）
    fn put(&self, key: &str, value: String) -> Result<()>;

    /// 删除
    fn remove(&self, key: &str) -> Result<()>;

    /// 所有键
    fn keys(&self) -> Vec<String>;
}

/// 持久化的模块条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredModule {
    pub id: ModuleId,
    pub location: String,
    /// 上次运行时处于 Active
    #[serde(default)]
    pub autostart: bool,
}

impl StoredModule {
    pub(crate) fn key(id: ModuleId) -> String {
        format!("{}{}", MODULE_KEY_PREFIX, id.value())
    }

    /// 按模块 ID 顺序读取所有条目，跳过无法解析的条目
    pub fn load_all(store: &dyn MetadataStore) -> Vec<StoredModule> {
        let mut modules: Vec<StoredModule> = store
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(MODULE_KEY_PREFIX))
            .filter_map(|key| {
                let raw = store.get(&key)?;
                match serde_json::from_str::<StoredModule>(&raw) {
                    Ok(module) => Some(module),
                    Err(e) => {
                        warn!(key = %key, error = %e, "忽略无法解析的模块条目");
                        None
                    }
                }
            })
            .collect();
        modules.sort_by_key(|m| m.id);
        modules
    }

    pub(crate) fn save(&self, store: &dyn MetadataStore) -> Result<()> {
        store.put(&Self::key(self.id), serde_json::to_string(self)?)
    }
}

// ==================== 内存存储 ====================

/// 内存键值存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

// ==================== 文件存储 ====================

/// JSON 文件键值存储
///
/// 整个映射保存在一个文件中，每次写入后整体落盘。
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    /// 打开存储文件，不存在时创建空存储
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// 存储文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(entries)?)?;
        Ok(())
    }
}

impl MetadataStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
