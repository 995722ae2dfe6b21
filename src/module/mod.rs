//! 模块管理
//!
//! 包含模块系统的核心组件：
//! - 模块描述与状态（`metadata`）
//! - `module.yaml` 解析（`parser`）
//! - 加载器接口及内置实现（`loader`）
//! - 依赖图与解析（`dependency`）
//! - 生命周期与激活器（`lifecycle`）
//! - 模块上下文（`context`）
//! - 模块注册表（`registry`）
//! - 持久化存储（`store`）

pub mod context;
pub mod dependency;
pub mod lifecycle;
pub mod loader;
pub mod metadata;
pub mod parser;
pub mod registry;
pub mod store;

// 重导出常用类型
pub use context::ModuleContext;
pub use dependency::{DependencyGraph, DependencyResolver};
pub use lifecycle::{can_transition, Activator};
pub use loader::{
    ActivatorFactory, ActivatorTable, DirectoryLoader, LoadError, ModuleHandle, ModuleLoader,
    StaticLoader,
};
pub use metadata::{ModuleManifest, ModuleRecord, ModuleState, Requirement, Tombstone};
pub use parser::{ModuleDescriptor, ModuleParser, RequireEntry, MANIFEST_FILE};
pub use registry::ModuleRegistry;
pub use store::{FileStore, MemoryStore, MetadataStore, StoredModule};
