//! 模块加载器
//!
//! 注册表通过 [`ModuleLoader`] 把安装来源（location）转换为可用的模块：
//! 加载得到不透明的 [`ModuleHandle`]，再从句柄读取描述字典和激活器。
//! 内置两种实现：内存中的 [`StaticLoader`] 与基于目录的 [`DirectoryLoader`]。

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::module::lifecycle::Activator;
use crate::module::metadata::MODULE_ACTIVATOR;
use crate::module::parser::{ModuleParser, MANIFEST_FILE};
use crate::service::properties::PropertyDictionary;

/// 加载错误
#[derive(Error, Debug)]
pub enum LoadError {
    /// 来源不存在
    #[error("未找到模块来源: {0}")]
    NotFound(String),

    /// 读取失败
    #[error("读取模块 '{location}' 失败: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    /// 内容无效
    #[error("模块 '{location}' 无效: {reason}")]
    Invalid { location: String, reason: String },
}

/// 激活器工厂，每次启动创建一个新实例
pub type ActivatorFactory = Arc<dyn Fn() -> Arc<dyn Activator> + Send + Sync>;

/// 已加载模块的句柄
///
/// 载荷只对创建它的加载器有意义，注册表不解释其内容。
#[derive(Clone)]
pub struct ModuleHandle {
    location: String,
    payload: Arc<dyn Any + Send + Sync>,
}

impl ModuleHandle {
    /// 创建句柄
    pub fn new<T: Any + Send + Sync>(location: impl Into<String>, payload: T) -> Self {
        Self {
            location: location.into(),
            payload: Arc::new(payload),
        }
    }

    /// 安装来源
    pub fn location(&self) -> &str {
        &self.location
    }

    /// 取出载荷
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// 模块加载器接口
pub trait ModuleLoader: Send + Sync {
    /// 加载来源，返回句柄
    fn load(&self, location: &str) -> Result<ModuleHandle, LoadError>;

    /// 读取描述字典
    fn manifest(&self, handle: &ModuleHandle) -> Result<PropertyDictionary, LoadError>;

    /// 创建激活器；模块没有激活器时返回 `None`
    fn activator(&self, handle: &ModuleHandle) -> Option<Arc<dyn Activator>>;

    /// 释放句柄
    fn unload(&self, handle: ModuleHandle);
}

// ==================== 激活器表 ====================

/// 按名称登记的激活器工厂
#[derive(Clone, Default)]
pub struct ActivatorTable {
    factories: Arc<RwLock<HashMap<String, ActivatorFactory>>>,
}

impl ActivatorTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记激活器工厂，同名覆盖
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn Activator> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    /// 按名称创建激活器
    pub fn create(&self, name: &str) -> Option<Arc<dyn Activator>> {
        let factory = self.factories.read().get(name).cloned()?;
        Some(factory())
    }

    /// 是否登记了该名称
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    /// 已登记的名称
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ActivatorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivatorTable")
            .field("names", &self.names())
            .finish()
    }
}

// ==================== 内存加载器 ====================

#[derive(Clone)]
struct StaticModule {
    manifest: PropertyDictionary,
    activator: Option<ActivatorFactory>,
}

/// 内存加载器
///
/// 来源是预先登记的任意字符串，常用于嵌入式场景和测试。
#[derive(Clone, Default)]
pub struct StaticLoader {
    modules: Arc<RwLock<HashMap<String, StaticModule>>>,
}

impl StaticLoader {
    /// 创建空加载器
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记没有激活器的模块
    pub fn add(&self, location: impl Into<String>, manifest: PropertyDictionary) {
        self.modules.write().insert(
            location.into(),
            StaticModule {
                manifest,
                activator: None,
            },
        );
    }

    /// 登记带激活器的模块
    pub fn add_with_activator<F>(
        &self,
        location: impl Into<String>,
        manifest: PropertyDictionary,
        factory: F,
    ) where
        F: Fn() -> Arc<dyn Activator> + Send + Sync + 'static,
    {
        self.modules.write().insert(
            location.into(),
            StaticModule {
                manifest,
                activator: Some(Arc::new(factory)),
            },
        );
    }

    /// 移除登记
    pub fn remove(&self, location: &str) -> bool {
        self.modules.write().remove(location).is_some()
    }
}

impl ModuleLoader for StaticLoader {
    fn load(&self, location: &str) -> Result<ModuleHandle, LoadError> {
        let module = self
            .modules
            .read()
            .get(location)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(location.to_string()))?;
        Ok(ModuleHandle::new(location, module))
    }

    fn manifest(&self, handle: &ModuleHandle) -> Result<PropertyDictionary, LoadError> {
        handle
            .payload::<StaticModule>()
            .map(|m| m.manifest.clone())
            .ok_or_else(|| LoadError::Invalid {
                location: handle.location().to_string(),
                reason: "句柄不属于该加载器".to_string(),
            })
    }

    fn activator(&self, handle: &ModuleHandle) -> Option<Arc<dyn Activator>> {
        let factory = handle.payload::<StaticModule>()?.activator.as_ref()?;
        Some(factory())
    }

    fn unload(&self, handle: ModuleHandle) {
        debug!(location = %handle.location(), "释放内存模块句柄");
    }
}

// ==================== 目录加载器 ====================

/// 已加载的目录模块
#[derive(Debug, Clone)]
struct DirectoryModule {
    root: PathBuf,
    manifest: PropertyDictionary,
}

/// 目录加载器
///
/// 来源是包含 `module.yaml` 的目录路径。激活器按描述中的
/// `Module-Activator` 名称在 [`ActivatorTable`] 中查找。
#[derive(Debug, Clone, Default)]
pub struct DirectoryLoader {
    activators: ActivatorTable,
}

impl DirectoryLoader {
    /// 使用给定激活器表创建
    pub fn new(activators: ActivatorTable) -> Self {
        Self { activators }
    }

    /// 激活器表
    pub fn activators(&self) -> &ActivatorTable {
        &self.activators
    }

    /// 扫描目录，返回所有包含描述文件的子目录（按路径排序）
    pub fn discover(dirs: &[PathBuf]) -> Vec<PathBuf> {
        let mut found = Vec::new();
        for dir in dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "无法读取模块目录");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
                    found.push(path);
                }
            }
        }
        found.sort();
        found
    }

    fn read_manifest(location: &str, root: &Path) -> Result<PropertyDictionary, LoadError> {
        let path = root.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(LoadError::Invalid {
                location: location.to_string(),
                reason: format!("缺少 {}", MANIFEST_FILE),
            });
        }
        let descriptor = ModuleParser::parse_file_sync(&path).map_err(|e| LoadError::Invalid {
            location: location.to_string(),
            reason: e.to_string(),
        })?;
        Ok(descriptor.to_dictionary())
    }
}

impl ModuleLoader for DirectoryLoader {
    fn load(&self, location: &str) -> Result<ModuleHandle, LoadError> {
        let root = PathBuf::from(location);
        let meta = std::fs::metadata(&root).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound(location.to_string()),
            _ => LoadError::Io {
                location: location.to_string(),
                source: e,
            },
        })?;
        if !meta.is_dir() {
            return Err(LoadError::Invalid {
                location: location.to_string(),
                reason: "不是目录".to_string(),
            });
        }

        // 描述文件缺失或损坏不影响加载，由 manifest() 报告
        let manifest = Self::read_manifest(location, &root).unwrap_or_default();
        Ok(ModuleHandle::new(location, DirectoryModule { root, manifest }))
    }

    fn manifest(&self, handle: &ModuleHandle) -> Result<PropertyDictionary, LoadError> {
        let module = handle
            .payload::<DirectoryModule>()
            .ok_or_else(|| LoadError::Invalid {
                location: handle.location().to_string(),
                reason: "句柄不属于该加载器".to_string(),
            })?;
        if module.manifest.is_empty() {
            // 重新读取以得到具体错误
            return Self::read_manifest(handle.location(), &module.root);
        }
        Ok(module.manifest.clone())
    }

    fn activator(&self, handle: &ModuleHandle) -> Option<Arc<dyn Activator>> {
        let module = handle.payload::<DirectoryModule>()?;
        let name = module.manifest.get_str(MODULE_ACTIVATOR)?;
        self.activators.create(name)
    }

    fn unload(&self, handle: ModuleHandle) {
        debug!(location = %handle.location(), "释放目录模块句柄");
    }
}
