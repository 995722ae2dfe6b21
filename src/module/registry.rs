//! 模块注册表
//!
//! 管理所有已安装的模块：安装、解析、启动、停止、卸载，以及状态查询。
//!
//! 每个模块有一把可重入的迁移锁，同一模块的迁移串行执行，不同模块互不阻塞。
//! 激活器回调和事件分发都在持有迁移锁的线程上同步进行，回调中可以再次
//! 对同一模块发起操作。

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::event::{EventDispatcher, ModuleEvent, ModuleEventKind};
use crate::module::context::ModuleContext;
use crate::module::dependency::{DependencyGraph, DependencyResolver, ResolveCandidate, ResolveStep};
use crate::module::lifecycle::{self, can_transition, Activator};
use crate::module::loader::{ModuleHandle, ModuleLoader};
use crate::module::metadata::{ModuleManifest, ModuleRecord, ModuleState, Tombstone};
use crate::module::store::{MetadataStore, StoredModule};
use crate::service::ServiceRegistry;
use crate::utils::id::{IdAllocator, ModuleId};
use crate::utils::{CoreError, Result};

// ==================== 内部结构 ====================

#[derive(Default)]
struct SlotRuntime {
    handle: Option<ModuleHandle>,
    activator: Option<Arc<dyn Activator>>,
    context: Option<ModuleContext>,
}

struct ModuleSlot {
    record: RwLock<ModuleRecord>,
    transition: ReentrantMutex<()>,
    runtime: Mutex<SlotRuntime>,
}

impl ModuleSlot {
    fn new(record: ModuleRecord, handle: ModuleHandle) -> Self {
        Self {
            record: RwLock::new(record),
            transition: ReentrantMutex::new(()),
            runtime: Mutex::new(SlotRuntime {
                handle: Some(handle),
                ..SlotRuntime::default()
            }),
        }
    }

    fn state(&self) -> ModuleState {
        self.record.read().state
    }

    fn symbolic_name(&self) -> String {
        self.record.read().manifest.symbolic_name.clone()
    }

    fn snapshot(&self) -> ModuleRecord {
        self.record.read().clone()
    }
}

pub(crate) struct RegistryCore {
    slots: RwLock<BTreeMap<ModuleId, Arc<ModuleSlot>>>,
    ids: IdAllocator,
    loader: Arc<dyn ModuleLoader>,
    services: ServiceRegistry,
    dispatcher: Arc<EventDispatcher>,
    wiring: RwLock<DependencyGraph>,
    tombstones: RwLock<BTreeMap<ModuleId, Tombstone>>,
    start_order: Mutex<Vec<ModuleId>>,
    store: Option<Arc<dyn MetadataStore>>,
}

// ==================== 模块注册表 ====================

/// 模块注册表
///
/// 克隆得到的副本共享同一份状态。
#[derive(Clone)]
pub struct ModuleRegistry {
    core: Arc<RegistryCore>,
}

impl ModuleRegistry {
    /// 创建注册表
    ///
    /// # Arguments
    ///
    /// * `loader` - 模块加载器
    /// * `services` - 服务注册表，模块停止时清理其服务
    /// * `dispatcher` - 事件分发器
    pub fn new(
        loader: Arc<dyn ModuleLoader>,
        services: ServiceRegistry,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self::with_store(loader, services, dispatcher, None)
    }

    /// 创建带持久化存储的注册表
    pub fn with_store(
        loader: Arc<dyn ModuleLoader>,
        services: ServiceRegistry,
        dispatcher: Arc<EventDispatcher>,
        store: Option<Arc<dyn MetadataStore>>,
    ) -> Self {
        Self {
            core: Arc::new(RegistryCore {
                slots: RwLock::new(BTreeMap::new()),
                ids: IdAllocator::default(),
                loader,
                services,
                dispatcher,
                wiring: RwLock::new(DependencyGraph::new()),
                tombstones: RwLock::new(BTreeMap::new()),
                start_order: Mutex::new(Vec::new()),
                store,
            }),
        }
    }

    pub(crate) fn from_core(core: Arc<RegistryCore>) -> Self {
        Self { core }
    }

    /// 为指定模块创建上下文
    pub(crate) fn new_context(&self, module: ModuleId) -> ModuleContext {
        ModuleContext::new(
            module,
            self.core.services.clone(),
            Arc::clone(&self.core.dispatcher),
            Arc::downgrade(&self.core),
        )
    }

    // ==================== 内部辅助 ====================

    fn slot(&self, id: ModuleId) -> Result<Arc<ModuleSlot>> {
        self.core
            .slots
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::ModuleNotFound(id))
    }

    fn set_state(&self, slot: &ModuleSlot, to: ModuleState) -> Result<()> {
        let mut record = slot.record.write();
        if !can_transition(record.state, to) {
            error!(
                module_id = %record.id,
                from = %record.state,
                to = %to,
                "非法的状态迁移"
            );
            return Err(CoreError::Internal(format!(
                "{} 非法的状态迁移: {} -> {}",
                record.id, record.state, to
            )));
        }
        debug!(module_id = %record.id, from = %record.state, to = %to, "模块状态迁移");
        record.state = to;
        record.last_modified = Utc::now();
        Ok(())
    }

    fn fire(&self, kind: ModuleEventKind, id: ModuleId, symbolic_name: &str) {
        self.core
            .dispatcher
            .fire_module_event(&ModuleEvent::new(kind, id, symbolic_name));
    }

    fn persist(&self, id: ModuleId, location: &str, autostart: bool) {
        if let Some(store) = &self.core.store {
            let entry = StoredModule {
                id,
                location: location.to_string(),
                autostart,
            };
            if let Err(e) = entry.save(store.as_ref()) {
                warn!(module_id = %id, error = %e, "写入模块存储失败");
            }
        }
    }

    fn forget(&self, id: ModuleId) {
        if let Some(store) = &self.core.store {
            if let Err(e) = store.remove(&StoredModule::key(id)) {
                warn!(module_id = %id, error = %e, "删除模块存储条目失败");
            }
        }
    }

    /// 释放模块持有的服务、使用计数与监听器
    fn release_resources(&self, id: ModuleId) {
        let services = self.core.services.unregister_all(id);
        let usages = self.core.services.release_usages(id);
        let listeners = self.core.dispatcher.remove_listeners_of(id);
        debug!(
            module_id = %id,
            services,
            usages,
            listeners,
            "已释放模块资源"
        );
    }

    fn illegal(id: ModuleId, state: ModuleState, operation: &'static str) -> CoreError {
        CoreError::IllegalState {
            module: id,
            state: state.to_string(),
            operation,
        }
    }

    // ==================== 生命周期 ====================

    /// 安装模块
    ///
    /// 同一来源已安装时返回已有的模块 ID。
    ///
    /// # Errors
    ///
    /// - 加载器无法加载来源时返回 `Load`
    /// - 描述缺失或无效时返回 `Manifest`
    pub fn install(&self, location: &str) -> Result<ModuleId> {
        if let Some(existing) = self.find_by_location(location) {
            debug!(module_id = %existing, location, "来源已安装");
            return Ok(existing);
        }

        let handle = self.core.loader.load(location).map_err(|e| {
            warn!(location, error = %e, "模块加载失败");
            CoreError::from(e)
        })?;

        let manifest = self
            .core
            .loader
            .manifest(&handle)
            .map_err(|e| CoreError::manifest(location, e.to_string()))
            .and_then(|headers| ModuleManifest::from_dictionary(location, &headers));
        let manifest = match manifest {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(location, error = %e, "模块描述无效");
                self.core.loader.unload(handle);
                return Err(e);
            }
        };

        let (id, name) = {
            let mut slots = self.core.slots.write();
            if let Some(existing) = slots
                .values()
                .find(|s| s.record.read().location == location)
                .map(|s| s.record.read().id)
            {
                drop(slots);
                self.core.loader.unload(handle);
                return Ok(existing);
            }

            let id = ModuleId::new(self.core.ids.allocate());
            let record = ModuleRecord::new(id, location, manifest);
            let name = record.symbolic_name().to_string();
            slots.insert(id, Arc::new(ModuleSlot::new(record, handle)));
            (id, name)
        };

        self.persist(id, location, false);
        info!(module_id = %id, symbolic_name = %name, location, "模块已安装");
        self.fire(ModuleEventKind::Installed, id, &name);
        Ok(id)
    }

    /// 解析模块依赖
    ///
    /// 先在快照上计算完整的解析计划，再按依赖在前的顺序逐个迁移到 Resolved。
    /// 已解析的模块直接返回成功。
    ///
    /// # Errors
    ///
    /// - 依赖找不到提供方时返回 `UnresolvedDependency`，安装提供方后可重试
    /// - 依赖成环时返回 `CircularDependency`
    pub fn resolve(&self, id: ModuleId) -> Result<()> {
        let slot = self.slot(id)?;
        match slot.state() {
            ModuleState::Installed => {}
            ModuleState::Uninstalled => return Err(CoreError::ModuleNotFound(id)),
            _ => return Ok(()),
        }

        let candidates: Vec<ResolveCandidate> = self
            .modules()
            .iter()
            .filter(|r| r.state != ModuleState::Uninstalled)
            .map(ResolveCandidate::from)
            .collect();

        let plan = DependencyResolver::new(&candidates).plan(id).map_err(|e| {
            warn!(module_id = %id, error = %e, "模块解析失败");
            e
        })?;

        for step in &plan {
            self.apply_step(step)?;
        }
        Ok(())
    }

    fn apply_step(&self, step: &ResolveStep) -> Result<()> {
        let slot = self.slot(step.module)?;
        let _guard = slot.transition.lock();
        if slot.state() != ModuleState::Installed {
            return Ok(());
        }

        // 提供方可能在计划之后被卸载
        for (requirement, provider) in &step.wires {
            let ready = self
                .slot(*provider)
                .map(|p| p.state().is_resolved())
                .unwrap_or(false);
            if !ready {
                return Err(CoreError::UnresolvedDependency {
                    module: slot.symbolic_name(),
                    missing: vec![requirement.to_string()],
                });
            }
        }

        {
            let mut wiring = self.core.wiring.write();
            wiring.add_module(step.module);
            for (_, provider) in &step.wires {
                wiring.add_dependency(step.module, *provider);
            }
        }

        self.set_state(&slot, ModuleState::Resolved)?;
        let name = slot.symbolic_name();
        info!(module_id = %step.module, symbolic_name = %name, wires = step.wires.len(), "模块已解析");
        self.fire(ModuleEventKind::Resolved, step.module, &name);
        Ok(())
    }

    /// 启动模块
    ///
    /// 模块必须处于 Resolved；已经 Active 时直接返回成功。激活器失败时
    /// 清理模块已登记的服务与监听器，回到 Resolved。
    ///
    /// # Errors
    ///
    /// - 状态不是 Resolved/Active 时返回 `IllegalState`，无副作用
    /// - 激活器失败时返回 `ActivationFailed`
    pub fn start(&self, id: ModuleId) -> Result<()> {
        let slot = self.slot(id)?;
        let _guard = slot.transition.lock();

        let (state, name, location, declared) = {
            let record = slot.record.read();
            (
                record.state,
                record.manifest.symbolic_name.clone(),
                record.location.clone(),
                record.manifest.activator.clone(),
            )
        };
        match state {
            ModuleState::Active => return Ok(()),
            ModuleState::Resolved => {}
            ModuleState::Uninstalled => return Err(CoreError::ModuleNotFound(id)),
            other => return Err(Self::illegal(id, other, "start")),
        }

        self.set_state(&slot, ModuleState::Starting)?;
        info!(module_id = %id, symbolic_name = %name, "启动模块");
        self.fire(ModuleEventKind::Starting, id, &name);

        let context = self.new_context(id);
        let activator = {
            let runtime = slot.runtime.lock();
            runtime
                .handle
                .as_ref()
                .and_then(|handle| self.core.loader.activator(handle))
        };
        let outcome = match (&activator, declared) {
            (Some(activator), _) => lifecycle::invoke(|| activator.start(&context)),
            (None, Some(declared)) => Err(format!("未找到激活器 '{}'", declared)),
            (None, None) => Ok(()),
        };

        match outcome {
            Ok(()) => {
                {
                    let mut runtime = slot.runtime.lock();
                    runtime.activator = activator;
                    runtime.context = Some(context);
                }
                self.set_state(&slot, ModuleState::Active)?;
                self.core.start_order.lock().push(id);
                self.persist(id, &location, true);
                info!(module_id = %id, symbolic_name = %name, "模块已启动");
                self.fire(ModuleEventKind::Started, id, &name);
                Ok(())
            }
            Err(reason) => {
                error!(module_id = %id, symbolic_name = %name, error = %reason, "模块启动失败，已回滚");
                context.invalidate();
                self.release_resources(id);
                self.set_state(&slot, ModuleState::Resolved)?;
                self.fire(ModuleEventKind::Stopped, id, &name);
                Err(CoreError::ActivationFailed { module: name, reason })
            }
        }
    }

    /// 停止模块
    ///
    /// 不处于 Active 时直接返回成功。无论激活器 stop 是否失败，上下文都会
    /// 失效，模块的服务、使用计数和监听器都会被释放。
    ///
    /// # Errors
    ///
    /// 激活器 stop 失败时在清理完成后返回 `ActivationFailed`。
    pub fn stop(&self, id: ModuleId) -> Result<()> {
        self.stop_with(id, true)
    }

    fn stop_with(&self, id: ModuleId, persist: bool) -> Result<()> {
        let slot = self.slot(id)?;
        let _guard = slot.transition.lock();

        let (state, name, location) = {
            let record = slot.record.read();
            (
                record.state,
                record.manifest.symbolic_name.clone(),
                record.location.clone(),
            )
        };
        match state {
            ModuleState::Active => {}
            ModuleState::Installed | ModuleState::Resolved => return Ok(()),
            ModuleState::Uninstalled => return Err(CoreError::ModuleNotFound(id)),
            other => return Err(Self::illegal(id, other, "stop")),
        }

        self.set_state(&slot, ModuleState::Stopping)?;
        info!(module_id = %id, symbolic_name = %name, "停止模块");
        self.fire(ModuleEventKind::Stopping, id, &name);

        let (activator, context) = {
            let mut runtime = slot.runtime.lock();
            (runtime.activator.take(), runtime.context.take())
        };
        let outcome = match (&activator, &context) {
            (Some(activator), Some(context)) => lifecycle::invoke(|| activator.stop(context)),
            _ => Ok(()),
        };

        if let Some(context) = &context {
            context.invalidate();
        }
        self.release_resources(id);
        self.set_state(&slot, ModuleState::Resolved)?;
        self.core.start_order.lock().retain(|m| *m != id);
        if persist {
            self.persist(id, &location, false);
        }
        info!(module_id = %id, symbolic_name = %name, "模块已停止");
        self.fire(ModuleEventKind::Stopped, id, &name);

        outcome.map_err(|reason| {
            warn!(module_id = %id, symbolic_name = %name, error = %reason, "激活器停止失败");
            CoreError::ActivationFailed { module: name, reason }
        })
    }

    /// 卸载模块
    ///
    /// Active 的模块先停止。卸载后记录移除，只保留墓碑。
    pub fn uninstall(&self, id: ModuleId) -> Result<()> {
        self.uninstall_with(id, true)
    }

    fn uninstall_with(&self, id: ModuleId, persist: bool) -> Result<()> {
        let slot = self.slot(id)?;
        let _guard = slot.transition.lock();

        match slot.state() {
            ModuleState::Uninstalled => return Err(CoreError::ModuleNotFound(id)),
            state if state.is_transient() => return Err(Self::illegal(id, state, "uninstall")),
            ModuleState::Active => {
                if let Err(e) = self.stop_with(id, persist) {
                    warn!(module_id = %id, error = %e, "卸载前停止模块失败，继续卸载");
                }
            }
            _ => {}
        }

        let was_resolved = slot.state() == ModuleState::Resolved;
        self.set_state(&slot, ModuleState::Uninstalled)?;
        let record = slot.snapshot();
        let name = record.manifest.symbolic_name.clone();

        if was_resolved {
            self.fire(ModuleEventKind::Unresolved, id, &name);
        }
        if let Some(handle) = slot.runtime.lock().handle.take() {
            self.core.loader.unload(handle);
        }
        self.fire(ModuleEventKind::Uninstalled, id, &name);

        self.core.slots.write().remove(&id);
        self.core.wiring.write().remove_module(id);
        self.core.tombstones.write().insert(
            id,
            Tombstone {
                id,
                symbolic_name: name.clone(),
                version: record.manifest.version.clone(),
                location: record.location.clone(),
                uninstalled_at: Utc::now(),
            },
        );
        if persist {
            self.forget(id);
        }
        info!(module_id = %id, symbolic_name = %name, "模块已卸载");
        Ok(())
    }

    /// 停止并卸载所有模块，不修改持久化存储
    ///
    /// Active 的模块按启动顺序的逆序停止。
    pub fn shutdown(&self) {
        let order: Vec<ModuleId> = self.core.start_order.lock().iter().rev().copied().collect();
        for id in order {
            if let Err(e) = self.stop_with(id, false) {
                warn!(module_id = %id, error = %e, "关闭时停止模块失败");
            }
        }

        let remaining: Vec<ModuleId> = self.core.slots.read().keys().copied().collect();
        for id in remaining.into_iter().rev() {
            if let Err(e) = self.uninstall_with(id, false) {
                warn!(module_id = %id, error = %e, "关闭时卸载模块失败");
            }
        }
        info!("所有模块已关闭");
    }

    /// 从持久化存储恢复模块
    ///
    /// 重新安装存储中的所有来源；上次处于 Active 的模块按依赖顺序解析并启动。
    /// 单个模块失败只记录日志。
    ///
    /// # Returns
    ///
    /// 成功安装的模块 ID
    pub fn restore(&self) -> Result<Vec<ModuleId>> {
        let Some(store) = self.core.store.clone() else {
            return Ok(Vec::new());
        };

        // 旧条目先全部删除，重新安装时按新分配的 ID 写入
        let entries = StoredModule::load_all(store.as_ref());
        for entry in &entries {
            store.remove(&StoredModule::key(entry.id))?;
        }

        let mut installed = Vec::with_capacity(entries.len());
        let mut autostart = HashSet::new();
        for entry in entries {
            match self.install(&entry.location) {
                Ok(id) => {
                    installed.push(id);
                    if entry.autostart {
                        autostart.insert(id);
                    }
                }
                Err(e) => warn!(location = %entry.location, error = %e, "恢复模块失败"),
            }
        }

        for id in &autostart {
            if let Err(e) = self.resolve(*id) {
                warn!(module_id = %id, error = %e, "恢复时解析模块失败");
            }
        }
        for id in self.resolution_order()? {
            if autostart.contains(&id) {
                if let Err(e) = self.start(id) {
                    warn!(module_id = %id, error = %e, "恢复时启动模块失败");
                }
            }
        }

        info!(installed = installed.len(), autostart = autostart.len(), "模块恢复完成");
        Ok(installed)
    }

    // ==================== 查询 ====================

    /// 模块记录快照
    pub fn get(&self, id: ModuleId) -> Result<ModuleRecord> {
        Ok(self.slot(id)?.snapshot())
    }

    /// 模块状态
    pub fn state(&self, id: ModuleId) -> Result<ModuleState> {
        Ok(self.slot(id)?.state())
    }

    /// 所有已安装模块，按 ID 升序
    pub fn modules(&self) -> Vec<ModuleRecord> {
        let slots: Vec<Arc<ModuleSlot>> = self.core.slots.read().values().cloned().collect();
        slots.iter().map(|s| s.snapshot()).collect()
    }

    /// 按符号名查找
    pub fn find(&self, symbolic_name: &str) -> Vec<ModuleRecord> {
        self.modules()
            .into_iter()
            .filter(|r| r.manifest.symbolic_name == symbolic_name)
            .collect()
    }

    /// 按来源查找
    pub fn find_by_location(&self, location: &str) -> Option<ModuleId> {
        self.core
            .slots
            .read()
            .values()
            .map(|s| s.record.read())
            .find(|r| r.location == location)
            .map(|r| r.id)
    }

    /// 已卸载模块的墓碑
    pub fn tombstone(&self, id: ModuleId) -> Option<Tombstone> {
        self.core.tombstones.read().get(&id).cloned()
    }

    /// 所有墓碑
    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.core.tombstones.read().values().cloned().collect()
    }

    /// 模块连到的提供方
    pub fn dependencies(&self, id: ModuleId) -> Vec<ModuleId> {
        self.core.wiring.read().dependencies(id)
    }

    /// 连到该模块的依赖方
    pub fn dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        self.core.wiring.read().dependents(id)
    }

    /// 已解析模块的依赖顺序（提供方在前）
    pub fn resolution_order(&self) -> Result<Vec<ModuleId>> {
        self.core.wiring.read().topological_sort()
    }

    /// Active 模块的启动顺序
    pub fn start_order(&self) -> Vec<ModuleId> {
        self.core.start_order.lock().clone()
    }

    /// 运行中模块的上下文
    pub fn context(&self, id: ModuleId) -> Option<ModuleContext> {
        self.slot(id).ok()?.runtime.lock().context.clone()
    }

    /// 已安装模块数量
    pub fn len(&self) -> usize {
        self.core.slots.read().len()
    }

    /// 是否没有已安装模块
    pub fn is_empty(&self) -> bool {
        self.core.slots.read().is_empty()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.len())
            .field("tombstones", &self.core.tombstones.read().len())
            .finish()
    }
}
