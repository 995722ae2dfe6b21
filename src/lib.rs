//! # Chips Runtime - 薯片模块运行时
//!
//! 一个进程内的模块与服务运行时，提供以下核心功能：
//!
//! - **模块管理**: 安装、依赖解析、启动、停止和卸载，带严格的状态机
//! - **服务注册表**: 以接口名和属性字典发布服务，按排序与过滤表达式查找
//! - **过滤表达式**: LDAP 风格的匹配语言，用于查询和监听器
//! - **事件分发**: 同步投递服务与模块事件，支持结束匹配语义
//! - **日志系统**: 结构化日志记录
//!
//! ## 快速开始
//!
//! ```rust
//! use std::sync::Arc;
//! use chips_runtime::{CoreConfig, Framework, PropertyDictionary, ServiceObject, StaticLoader};
//!
//! let framework = Framework::new(CoreConfig::default(), Arc::new(StaticLoader::new()));
//!
//! // 框架自身也可以发布服务
//! let registration = framework
//!     .system_context()
//!     .register_service(
//!         &["Clock"],
//!         ServiceObject::single("Clock", 42u64),
//!         PropertyDictionary::new().with("service.ranking", 10),
//!     )
//!     .unwrap();
//!
//! let found = framework
//!     .system_context()
//!     .get_service_references(Some("Clock"), Some("(service.ranking>=5)"))
//!     .unwrap();
//! assert_eq!(found, vec![registration.reference()]);
//! ```
//!
//! ## 模块结构
//!
//! - `api` - 组合根 `Framework`
//! - `core` - 配置
//! - `event` - 事件与分发器
//! - `filter` - 过滤表达式
//! - `module` - 模块管理
//! - `service` - 服务注册表
//! - `utils` - 错误类型、标识与日志

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod event;
pub mod filter;
pub mod module;
pub mod service;
pub mod utils;

// 重导出常用类型，方便使用
pub use api::{Framework, FrameworkBuilder, FrameworkState, FrameworkStats};

pub use event::{
    DispatchStats, EventDispatcher, ModuleEvent, ModuleEventKind, ServiceEvent, ServiceEventKind,
};

pub use filter::{Filter, InvalidSyntaxError};

pub use module::{
    Activator, ActivatorTable, DirectoryLoader, LoadError, MemoryStore, MetadataStore,
    ModuleContext, ModuleLoader, ModuleManifest, ModuleRecord, ModuleRegistry, ModuleState,
    Requirement, StaticLoader, Tombstone,
};

pub use service::{
    PropertyDictionary, ServiceObject, ServiceReference, ServiceRegistration, ServiceRegistry,
    Value,
};

pub use utils::{error_code, status_code, CoreError, ListenerId, ModuleId, Result, ServiceId};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{CoreConfig, CoreConfigBuilder, DispatchConfig, LogConfig, ModuleConfig};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
