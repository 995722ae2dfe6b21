//! 事件数据结构
//!
//! 定义模块生命周期事件与服务变更事件。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::ServiceReference;
use crate::utils::id::ModuleId;

/// 模块事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleEventKind {
    /// 已安装
    Installed,
    /// 已解析
    Resolved,
    /// 正在启动
    Starting,
    /// 已启动
    Started,
    /// 正在停止
    Stopping,
    /// 已停止
    Stopped,
    /// 解析已撤销（卸载已解析模块时先于 Uninstalled 触发）
    Unresolved,
    /// 已卸载
    Uninstalled,
}

impl ModuleEventKind {
    /// 事件名称（用于日志）
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleEventKind::Installed => "module.installed",
            ModuleEventKind::Resolved => "module.resolved",
            ModuleEventKind::Starting => "module.starting",
            ModuleEventKind::Started => "module.started",
            ModuleEventKind::Stopping => "module.stopping",
            ModuleEventKind::Stopped => "module.stopped",
            ModuleEventKind::Unresolved => "module.unresolved",
            ModuleEventKind::Uninstalled => "module.uninstalled",
        }
    }
}

impl fmt::Display for ModuleEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 模块生命周期事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEvent {
    /// 事件类型
    pub kind: ModuleEventKind,

    /// 模块 ID
    pub module: ModuleId,

    /// 模块符号名
    pub symbolic_name: String,

    /// 事件时间戳
    pub timestamp: DateTime<Utc>,
}

impl ModuleEvent {
    /// 创建模块事件
    pub fn new(kind: ModuleEventKind, module: ModuleId, symbolic_name: impl Into<String>) -> Self {
        Self {
            kind,
            module,
            symbolic_name: symbolic_name.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 服务事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceEventKind {
    /// 服务已注册
    Registered,
    /// 服务属性已修改
    Modified,
    /// 服务属性已修改，且不再匹配监听器的过滤器（由分发器合成）
    ModifiedEndMatch,
    /// 服务正在注销，属性仍可读取
    Unregistering,
}

impl ServiceEventKind {
    /// 事件名称（用于日志）
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceEventKind::Registered => "service.registered",
            ServiceEventKind::Modified => "service.modified",
            ServiceEventKind::ModifiedEndMatch => "service.modified_endmatch",
            ServiceEventKind::Unregistering => "service.unregistering",
        }
    }
}

impl fmt::Display for ServiceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务变更事件
#[derive(Debug, Clone)]
pub struct ServiceEvent {
    /// 事件类型
    pub kind: ServiceEventKind,

    /// 相关服务的引用
    pub reference: ServiceReference,
}

impl ServiceEvent {
    /// 创建服务事件
    pub fn new(kind: ServiceEventKind, reference: ServiceReference) -> Self {
        Self { kind, reference }
    }

    /// 以另一种类型复制事件
    pub(crate) fn with_kind(&self, kind: ServiceEventKind) -> Self {
        Self {
            kind,
            reference: self.reference.clone(),
        }
    }
}
