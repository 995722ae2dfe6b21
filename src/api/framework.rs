//! Framework 组合根
//!
//! 运行时的主要对外接口。一个 [`Framework`] 实例拥有一个事件分发器、
//! 一个服务注册表和一个模块注册表，三者显式构造、互不共享，
//! 同一进程中可以并存任意多个相互隔离的实例。
//!
//! # 示例
//!
//! ```rust
//! use std::sync::Arc;
//! use chips_runtime::{CoreConfig, Framework, PropertyDictionary, StaticLoader};
//! use chips_runtime::module::metadata::{MODULE_SYMBOLIC_NAME, MODULE_VERSION};
//!
//! let loader = StaticLoader::new();
//! loader.add(
//!     "mem:greeter",
//!     PropertyDictionary::new()
//!         .with(MODULE_SYMBOLIC_NAME, "greeter")
//!         .with(MODULE_VERSION, "1.0.0"),
//! );
//!
//! let framework = Framework::new(CoreConfig::default(), Arc::new(loader));
//! let id = framework.install("mem:greeter").unwrap();
//! assert_eq!(framework.start_all(), vec![id]);
//! framework.shutdown();
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::config::CoreConfig;
use crate::event::{DispatchStats, EventDispatcher, ModuleEvent, ServiceEvent};
use crate::module::context::ModuleContext;
use crate::module::loader::{DirectoryLoader, ModuleLoader};
use crate::module::metadata::{ModuleRecord, ModuleState};
use crate::module::registry::ModuleRegistry;
use crate::module::store::{FileStore, MetadataStore};
use crate::service::ServiceRegistry;
use crate::utils::id::{ListenerId, ModuleId};
use crate::utils::Result;

/// `data_dir` 下的模块存储文件名
pub const STORE_FILE: &str = "modules.json";

// ============================================================================
// 框架状态
// ============================================================================

/// 框架状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameworkState {
    /// 已创建，尚未启动模块
    Initialized,
    /// 运行中
    Running,
    /// 已关闭
    Shutdown,
}

// ============================================================================
// 构建器
// ============================================================================

/// Framework 构建器
#[derive(Default)]
pub struct FrameworkBuilder {
    config: CoreConfig,
    loader: Option<Arc<dyn ModuleLoader>>,
    store: Option<Arc<dyn MetadataStore>>,
}

impl FrameworkBuilder {
    /// 设置配置
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置模块加载器，缺省为 [`DirectoryLoader`]
    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// 设置持久化存储
    ///
    /// 未设置且配置了 `data_dir` 时，使用 `data_dir/modules.json` 文件存储。
    pub fn store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 构建框架
    ///
    /// # Errors
    ///
    /// 打开 `data_dir` 下的存储文件失败时返回错误
    pub fn build(self) -> Result<Framework> {
        let store = match (self.store, &self.config.data_dir) {
            (Some(store), _) => Some(store),
            (None, Some(dir)) => {
                let store: Arc<dyn MetadataStore> = Arc::new(FileStore::open(dir.join(STORE_FILE))?);
                Some(store)
            }
            (None, None) => None,
        };
        let loader = self
            .loader
            .unwrap_or_else(|| Arc::new(DirectoryLoader::default()));
        Ok(Framework::assemble(self.config, loader, store))
    }
}

// ============================================================================
// Framework
// ============================================================================

/// 运行时框架
///
/// # 组件
///
/// - `dispatcher`: 事件分发器，同步投递服务与模块事件
/// - `services`: 服务注册表
/// - `modules`: 模块注册表，管理安装、解析、启动、停止与卸载
/// - `system`: 框架自身（模块 0）的上下文
///
/// # 生命周期
///
/// 1. `new()` / `builder()` - 创建框架
/// 2. `install()` / `install_configured()` - 安装模块
/// 3. `start_all()` / `restore()` - 解析并启动模块
/// 4. `shutdown()` - 逆序停止并卸载所有模块
pub struct Framework {
    config: CoreConfig,
    state: RwLock<FrameworkState>,
    dispatcher: Arc<EventDispatcher>,
    services: ServiceRegistry,
    modules: ModuleRegistry,
    system: ModuleContext,
    started_at: RwLock<Option<Instant>>,
}

impl Framework {
    // ========================================================================
    // 创建
    // ========================================================================

    /// 使用给定加载器创建框架，不带持久化存储
    pub fn new(config: CoreConfig, loader: Arc<dyn ModuleLoader>) -> Self {
        Self::assemble(config, loader, None)
    }

    /// 创建构建器
    pub fn builder() -> FrameworkBuilder {
        FrameworkBuilder::default()
    }

    fn assemble(
        config: CoreConfig,
        loader: Arc<dyn ModuleLoader>,
        store: Option<Arc<dyn MetadataStore>>,
    ) -> Self {
        info!("初始化模块运行时 v{}", crate::VERSION);

        let dispatcher = Arc::new(EventDispatcher::new(config.dispatch.clone()));
        debug!("事件分发器初始化完成");

        let services = ServiceRegistry::new(Arc::clone(&dispatcher));
        debug!("服务注册表初始化完成");

        let modules = ModuleRegistry::with_store(loader, services.clone(), Arc::clone(&dispatcher), store);
        let system = modules.new_context(ModuleId::SYSTEM);
        debug!("模块注册表初始化完成");

        Self {
            config,
            state: RwLock::new(FrameworkState::Initialized),
            dispatcher,
            services,
            modules,
            system,
            started_at: RwLock::new(None),
        }
    }

    // ========================================================================
    // 模块生命周期
    // ========================================================================

    /// 安装模块
    pub fn install(&self, location: &str) -> Result<ModuleId> {
        self.modules.install(location)
    }

    /// 解析模块
    pub fn resolve(&self, id: ModuleId) -> Result<()> {
        self.modules.resolve(id)
    }

    /// 启动模块（必要时先解析）
    pub fn start(&self, id: ModuleId) -> Result<()> {
        if self.modules.state(id)? == ModuleState::Installed {
            self.modules.resolve(id)?;
        }
        self.modules.start(id)
    }

    /// 停止模块
    pub fn stop(&self, id: ModuleId) -> Result<()> {
        self.modules.stop(id)
    }

    /// 卸载模块
    pub fn uninstall(&self, id: ModuleId) -> Result<()> {
        self.modules.uninstall(id)
    }

    /// 安装配置中 `module_dirs` 下发现的所有模块
    ///
    /// 单个模块安装失败只记录日志。
    ///
    /// # Returns
    ///
    /// 成功安装的模块 ID
    pub fn install_configured(&self) -> Vec<ModuleId> {
        self.install_dirs(&self.config.modules.module_dirs)
    }

    /// 安装给定目录下发现的所有模块
    pub fn install_dirs(&self, dirs: &[PathBuf]) -> Vec<ModuleId> {
        let mut installed = Vec::new();
        for path in DirectoryLoader::discover(dirs) {
            let location = path.to_string_lossy();
            match self.modules.install(&location) {
                Ok(id) => installed.push(id),
                Err(e) => warn!(location = %location, error = %e, "安装模块失败"),
            }
        }
        installed
    }

    /// 解析所有已安装模块，并按依赖顺序启动所有未激活的模块
    ///
    /// 解析或启动失败的模块只记录日志，不影响其余模块。
    ///
    /// # Returns
    ///
    /// 本次启动的模块 ID（按启动顺序）
    pub fn start_all(&self) -> Vec<ModuleId> {
        self.start_matching(|_| true)
    }

    /// 启动配置中 `auto_start` 列出的模块
    pub fn start_configured(&self) -> Vec<ModuleId> {
        let names = &self.config.modules.auto_start;
        for name in names {
            if self.modules.find(name).is_empty() {
                warn!(symbolic_name = %name, "自启动模块未安装");
            }
        }
        self.start_matching(|record| names.iter().any(|n| n == record.symbolic_name()))
    }

    fn start_matching(&self, wanted: impl Fn(&ModuleRecord) -> bool) -> Vec<ModuleId> {
        for record in self.modules.modules() {
            if record.state == ModuleState::Installed && wanted(&record) {
                if let Err(e) = self.modules.resolve(record.id) {
                    warn!(module_id = %record.id, error = %e, "解析模块失败");
                }
            }
        }

        let order = match self.modules.resolution_order() {
            Ok(order) => order,
            Err(e) => {
                warn!(error = %e, "无法计算启动顺序");
                return Vec::new();
            }
        };

        let mut started = Vec::new();
        for id in order {
            let Ok(record) = self.modules.get(id) else {
                continue;
            };
            if record.state != ModuleState::Resolved || !wanted(&record) {
                continue;
            }
            match self.modules.start(id) {
                Ok(()) => started.push(id),
                Err(e) => warn!(module_id = %id, error = %e, "启动模块失败"),
            }
        }

        self.mark_running();
        info!(started = started.len(), "模块启动完成");
        started
    }

    /// 从持久化存储恢复模块
    pub fn restore(&self) -> Result<Vec<ModuleId>> {
        let installed = self.modules.restore()?;
        self.mark_running();
        Ok(installed)
    }

    /// 关闭框架
    ///
    /// 按启动顺序的逆序停止所有 Active 模块，然后卸载全部模块。
    /// 不修改持久化存储，之后仍可 `restore()`。
    pub fn shutdown(&self) {
        info!("正在关闭模块运行时...");
        self.modules.shutdown();
        *self.state.write() = FrameworkState::Shutdown;
        *self.started_at.write() = None;
        info!("模块运行时已关闭");
    }

    fn mark_running(&self) {
        let mut state = self.state.write();
        if *state != FrameworkState::Running {
            *state = FrameworkState::Running;
            *self.started_at.write() = Some(Instant::now());
        }
    }

    // ========================================================================
    // 系统监听器
    // ========================================================================

    /// 以框架名义登记服务监听器
    pub fn add_service_listener<F>(&self, filter: Option<&str>, callback: F) -> Result<ListenerId>
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.system.add_service_listener(filter, callback)
    }

    /// 以框架名义登记模块监听器
    pub fn add_module_listener<F>(&self, callback: F) -> Result<ListenerId>
    where
        F: Fn(&ModuleEvent) + Send + Sync + 'static,
    {
        self.system.add_module_listener(callback)
    }

    /// 移除框架登记的监听器
    pub fn remove_listener(&self, id: ListenerId) -> Result<()> {
        self.dispatcher.remove_listener(ModuleId::SYSTEM, id)
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 模块记录
    pub fn module(&self, id: ModuleId) -> Result<ModuleRecord> {
        self.modules.get(id)
    }

    /// 所有已安装模块
    pub fn installed_modules(&self) -> Vec<ModuleRecord> {
        self.modules.modules()
    }

    /// 框架自身的上下文
    pub fn system_context(&self) -> &ModuleContext {
        &self.system
    }

    /// 模块注册表
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// 服务注册表
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// 事件分发器
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// 配置
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// 当前状态
    pub fn state(&self) -> FrameworkState {
        *self.state.read()
    }

    /// 运行时长
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.read().map(|t| t.elapsed())
    }

    /// 运行统计
    pub fn stats(&self) -> FrameworkStats {
        let records = self.modules.modules();
        let (service_listeners, module_listeners) = self.dispatcher.listener_count();
        FrameworkStats {
            state: self.state(),
            uptime_secs: self.uptime().map(|d| d.as_secs()),
            modules: records.len(),
            active_modules: records
                .iter()
                .filter(|r| r.state == ModuleState::Active)
                .count(),
            services: self.services.len(),
            service_listeners,
            module_listeners,
            dispatch: self.dispatcher.stats(),
        }
    }
}

impl std::fmt::Debug for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framework")
            .field("state", &self.state())
            .field("modules", &self.modules.len())
            .field("services", &self.services.len())
            .finish()
    }
}

// ============================================================================
// 统计信息
// ============================================================================

/// 框架运行统计
#[derive(Debug, Clone, Serialize)]
pub struct FrameworkStats {
    /// 框架状态
    pub state: FrameworkState,
    /// 运行时间（秒）
    pub uptime_secs: Option<u64>,
    /// 已安装模块数
    pub modules: usize,
    /// Active 模块数
    pub active_modules: usize,
    /// 已注册服务数
    pub services: usize,
    /// 服务监听器数
    pub service_listeners: usize,
    /// 模块监听器数
    pub module_listeners: usize,
    /// 分发统计
    pub dispatch: DispatchStats,
}

// ============================================================================
// 单元测试
// ============================================================================
