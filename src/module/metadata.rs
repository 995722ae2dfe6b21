//! 模块元数据定义
//!
//! 模块描述（manifest）以属性字典的形式由加载器提供，这里定义其键名、
//! 解析后的结构、模块状态以及注册表中保存的模块记录。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::service::properties::{PropertyDictionary, Value};
use crate::utils::id::ModuleId;
use crate::utils::{CoreError, Result};

/// 符号名（必填）
pub const MODULE_SYMBOLIC_NAME: &str = "Module-SymbolicName";
/// 版本（必填，semver）
pub const MODULE_VERSION: &str = "Module-Version";
/// 显示名称
pub const MODULE_NAME: &str = "Module-Name";
/// 描述
pub const MODULE_DESCRIPTION: &str = "Module-Description";
/// 激活器名称
pub const MODULE_ACTIVATOR: &str = "Module-Activator";
/// 依赖声明：`"<符号名> <版本要求>"` 列表
pub const MODULE_REQUIRES: &str = "Module-Requires";

/// 依赖声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// 依赖模块的符号名
    pub name: String,

    /// 版本要求
    pub version: VersionReq,
}

impl Requirement {
    /// 创建依赖声明
    pub fn new(name: impl Into<String>, version: VersionReq) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// 检查模块是否满足要求
    pub fn matches(&self, symbolic_name: &str, version: &Version) -> bool {
        self.name == symbolic_name && self.version.matches(version)
    }
}

impl FromStr for Requirement {
    type Err = CoreError;

    /// 解析 `"com.acme.log >=1.0, <2.0"`；省略版本要求时为 `*`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (name, req) = match s.split_once(char::is_whitespace) {
            Some((name, req)) => (name, req.trim()),
            None => (s, "*"),
        };
        if name.is_empty() {
            return Err(CoreError::InvalidArgument("依赖声明缺少模块名".to_string()));
        }
        Ok(Self::new(name, VersionReq::parse(req)?))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

/// 解析后的模块描述
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleManifest {
    /// 符号名
    pub symbolic_name: String,

    /// 版本
    pub version: Version,

    /// 显示名称
    pub name: Option<String>,

    /// 描述
    pub description: Option<String>,

    /// 激活器名称
    pub activator: Option<String>,

    /// 依赖声明
    pub requires: Vec<Requirement>,

    /// 原始描述字典（包含自定义键）
    pub headers: PropertyDictionary,
}

impl ModuleManifest {
    /// 创建只含必填项的描述
    pub fn new(symbolic_name: impl Into<String>, version: Version) -> Self {
        Self {
            symbolic_name: symbolic_name.into(),
            version,
            name: None,
            description: None,
            activator: None,
            requires: Vec::new(),
            headers: PropertyDictionary::new(),
        }
    }

    /// 添加依赖
    pub fn requires(mut self, requirement: Requirement) -> Self {
        self.requires.push(requirement);
        self
    }

    /// 设置激活器名称
    pub fn activator(mut self, name: impl Into<String>) -> Self {
        self.activator = Some(name.into());
        self
    }

    /// 从描述字典解析
    ///
    /// # Errors
    ///
    /// 缺少必填键、版本格式错误或依赖声明无效时返回 `Manifest` 错误，
    /// 错误信息汇总所有问题。
    pub fn from_dictionary(location: &str, headers: &PropertyDictionary) -> Result<Self> {
        let mut errors: Vec<String> = Vec::new();

        let symbolic_name = match headers.get_str(MODULE_SYMBOLIC_NAME).map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                errors.push(format!("缺少 {}", MODULE_SYMBOLIC_NAME));
                String::new()
            }
        };

        let version = match headers.get(MODULE_VERSION) {
            Some(Value::String(raw)) => match Version::parse(raw.trim()) {
                Ok(v) => Some(v),
                Err(e) => {
                    errors.push(format!("无效的版本号 '{}': {}", raw, e));
                    None
                }
            },
            Some(other) => {
                errors.push(format!("{} 必须是字符串，实际为 {}", MODULE_VERSION, other.type_name()));
                None
            }
            None => {
                errors.push(format!("缺少 {}", MODULE_VERSION));
                None
            }
        };

        let raw_requires: Vec<String> = match headers.get(MODULE_REQUIRES) {
            None => Vec::new(),
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::StringList(list)) => list.clone(),
            Some(other) => {
                errors.push(format!(
                    "{} 必须是字符串列表，实际为 {}",
                    MODULE_REQUIRES,
                    other.type_name()
                ));
                Vec::new()
            }
        };

        let mut requires = Vec::with_capacity(raw_requires.len());
        for raw in &raw_requires {
            match raw.parse::<Requirement>() {
                Ok(req) => requires.push(req),
                Err(e) => errors.push(format!("无效的依赖声明 '{}': {}", raw, e)),
            }
        }

        match version {
            Some(version) if errors.is_empty() => Ok(Self {
                symbolic_name,
                version,
                name: headers.get_str(MODULE_NAME).map(str::to_string),
                description: headers.get_str(MODULE_DESCRIPTION).map(str::to_string),
                activator: headers.get_str(MODULE_ACTIVATOR).map(str::to_string),
                requires,
                headers: headers.clone(),
            }),
            _ => Err(CoreError::manifest(location, errors.join("; "))),
        }
    }

    /// 转换为描述字典
    pub fn to_dictionary(&self) -> PropertyDictionary {
        let mut dict = self.headers.clone();
        dict.insert(MODULE_SYMBOLIC_NAME, self.symbolic_name.as_str());
        dict.insert(MODULE_VERSION, self.version.to_string());
        if let Some(name) = &self.name {
            dict.insert(MODULE_NAME, name.as_str());
        }
        if let Some(description) = &self.description {
            dict.insert(MODULE_DESCRIPTION, description.as_str());
        }
        if let Some(activator) = &self.activator {
            dict.insert(MODULE_ACTIVATOR, activator.as_str());
        }
        if !self.requires.is_empty() {
            let requires: Vec<String> = self.requires.iter().map(ToString::to_string).collect();
            dict.insert(MODULE_REQUIRES, requires);
        }
        dict
    }
}

/// 模块状态
///
/// `Installed -> Resolved -> Starting -> Active -> Stopping -> Resolved`，
/// 任何非终止状态都可以进入 `Uninstalled`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// 已安装，依赖尚未解析
    Installed,
    /// 依赖已解析，可以启动
    Resolved,
    /// 正在执行激活器 start
    Starting,
    /// 运行中
    Active,
    /// 正在执行激活器 stop
    Stopping,
    /// 已卸载（终止状态）
    Uninstalled,
}

impl ModuleState {
    /// 状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Installed => "installed",
            ModuleState::Resolved => "resolved",
            ModuleState::Starting => "starting",
            ModuleState::Active => "active",
            ModuleState::Stopping => "stopping",
            ModuleState::Uninstalled => "uninstalled",
        }
    }

    /// 依赖是否已解析（包括运行相关状态）
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ModuleState::Resolved | ModuleState::Starting | ModuleState::Active | ModuleState::Stopping
        )
    }

    /// 是否处于启动/停止过程中
    pub fn is_transient(&self) -> bool {
        matches!(self, ModuleState::Starting | ModuleState::Stopping)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模块记录
///
/// 注册表中一个已安装模块的元数据快照。
#[derive(Debug, Clone, Serialize)]
pub struct ModuleRecord {
    /// 模块 ID（安装时分配，永不复用）
    pub id: ModuleId,

    /// 安装来源
    pub location: String,

    /// 当前状态
    pub state: ModuleState,

    /// 模块描述
    pub manifest: ModuleManifest,

    /// 安装时间
    pub installed_at: DateTime<Utc>,

    /// 最近一次状态变化时间
    pub last_modified: DateTime<Utc>,
}

impl ModuleRecord {
    pub(crate) fn new(id: ModuleId, location: impl Into<String>, manifest: ModuleManifest) -> Self {
        let now = Utc::now();
        Self {
            id,
            location: location.into(),
            state: ModuleState::Installed,
            manifest,
            installed_at: now,
            last_modified: now,
        }
    }

    /// 符号名
    pub fn symbolic_name(&self) -> &str {
        &self.manifest.symbolic_name
    }

    /// 版本
    pub fn version(&self) -> &Version {
        &self.manifest.version
    }
}

/// 已卸载模块的墓碑记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tombstone {
    pub id: ModuleId,
    pub symbolic_name: String,
    pub version: Version,
    pub location: String,
    pub uninstalled_at: DateTime<Utc>,
}
