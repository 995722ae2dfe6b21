//! 事件分发器
//!
//! 将模块事件与服务事件同步扇出给所有匹配的监听器。分发在执行注册表
//! 变更的线程上进行，没有独立的事件循环线程。
//!
//! # 主要功能
//!
//! - **快照分发**: 监听器列表在表锁下复制一份快照，回调在表锁外执行
//! - **结束匹配**: 服务属性修改使监听器从匹配变为不匹配时，合成 `ModifiedEndMatch`
//! - **接口短路**: 过滤器要求单个 `objectClass` 时，按哈希跳过接口不相交的注册
//! - **监听器隔离**: 单个回调 panic 被捕获并记录，不影响其余监听器
//! - **安全移除**: 移除监听器会等待其在途回调结束，此后不再投递

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use crate::core::config::DispatchConfig;
use crate::event::event::{ModuleEvent, ServiceEvent};
use crate::event::listener::{Callback, ListenerEntry, Verdict};
use crate::filter::Filter;
use crate::service::properties::PropertyDictionary;
use crate::utils::id::{IdAllocator, ListenerId, ModuleId};
use crate::utils::{CoreError, Result};

/// 服务事件回调
pub type ServiceListener = Callback<ServiceEvent>;

/// 模块事件回调
pub type ModuleListener = Callback<ModuleEvent>;

/// 分发统计信息
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// 成功投递次数
    pub delivered: u64,

    /// 因接口短路跳过的次数
    pub short_circuited: u64,

    /// 合成的结束匹配事件数
    pub end_matches: u64,

    /// 回调失败（panic）次数
    pub listener_failures: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    delivered: AtomicU64,
    short_circuited: AtomicU64,
    end_matches: AtomicU64,
    listener_failures: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            short_circuited: self.short_circuited.load(Ordering::Relaxed),
            end_matches: self.end_matches.load(Ordering::Relaxed),
            listener_failures: self.listener_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, delivered: bool) {
        if delivered {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.listener_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// 事件分发器
pub struct EventDispatcher {
    /// 服务监听器（按注册顺序）
    service_listeners: RwLock<Vec<Arc<ListenerEntry<ServiceEvent>>>>,

    /// 模块监听器（按注册顺序）
    module_listeners: RwLock<Vec<Arc<ListenerEntry<ModuleEvent>>>>,

    /// 监听器 ID 分配器
    ids: IdAllocator,

    /// 分发统计
    stats: StatCounters,

    /// 配置
    config: DispatchConfig,
}

impl EventDispatcher {
    /// 创建分发器
    pub fn new(config: DispatchConfig) -> Self {
        debug!(
            object_class_short_circuit = config.object_class_short_circuit,
            "创建事件分发器"
        );
        Self {
            service_listeners: RwLock::new(Vec::new()),
            module_listeners: RwLock::new(Vec::new()),
            ids: IdAllocator::default(),
            stats: StatCounters::default(),
            config,
        }
    }

    /// 添加服务监听器
    ///
    /// # 参数
    ///
    /// * `owner` - 所属模块
    /// * `filter` - 可选的过滤表达式，语法错误时立即拒绝
    /// * `callback` - 事件回调
    pub fn add_service_listener(
        &self,
        owner: ModuleId,
        filter: Option<&str>,
        callback: ServiceListener,
    ) -> Result<ListenerId> {
        let filter = filter.map(Filter::parse).transpose()?;
        let id = ListenerId::new(self.ids.allocate());

        debug!(
            listener_id = %id,
            module_id = %owner,
            filter = filter.as_ref().map(Filter::as_str).unwrap_or("<none>"),
            "添加服务监听器"
        );

        let entry = Arc::new(ListenerEntry::new(id, owner, filter, callback));
        self.service_listeners.write().push(entry);
        Ok(id)
    }

    /// 添加模块监听器
    pub fn add_module_listener(&self, owner: ModuleId, callback: ModuleListener) -> ListenerId {
        let id = ListenerId::new(self.ids.allocate());
        debug!(listener_id = %id, module_id = %owner, "添加模块监听器");

        let entry = Arc::new(ListenerEntry::new(id, owner, None, callback));
        self.module_listeners.write().push(entry);
        id
    }

    /// 移除服务监听器
    ///
    /// 只能移除调用方自己注册的监听器。返回时该监听器的在途回调（其他线程上的）
    /// 已经结束，之后不会再被调用。`id` 是模块监听器时返回 `ListenerNotFound`。
    pub fn remove_service_listener(&self, caller: ModuleId, id: ListenerId) -> Result<()> {
        let entry = take_entry(&self.service_listeners, caller, id)?
            .ok_or(CoreError::ListenerNotFound(id))?;
        entry.mark_removed();
        debug!(listener_id = %id, module_id = %caller, "移除服务监听器");
        Ok(())
    }

    /// 移除模块监听器
    pub fn remove_module_listener(&self, caller: ModuleId, id: ListenerId) -> Result<()> {
        let entry = take_entry(&self.module_listeners, caller, id)?
            .ok_or(CoreError::ListenerNotFound(id))?;
        entry.mark_removed();
        debug!(listener_id = %id, module_id = %caller, "移除模块监听器");
        Ok(())
    }

    /// 移除任意种类的监听器
    pub fn remove_listener(&self, caller: ModuleId, id: ListenerId) -> Result<()> {
        match self.remove_service_listener(caller, id) {
            Err(CoreError::ListenerNotFound(_)) => self.remove_module_listener(caller, id),
            other => other,
        }
    }

    /// 移除某个模块注册的全部监听器
    ///
    /// # 返回
    ///
    /// 被移除的监听器数量
    pub fn remove_listeners_of(&self, owner: ModuleId) -> usize {
        let services = drain_owned(&self.service_listeners, owner);
        let modules = drain_owned(&self.module_listeners, owner);

        for entry in &services {
            entry.mark_removed();
        }
        for entry in &modules {
            entry.mark_removed();
        }

        let removed = services.len() + modules.len();
        if removed > 0 {
            debug!(module_id = %owner, count = removed, "批量移除监听器");
        }
        removed
    }

    /// 分发服务事件
    ///
    /// # 参数
    ///
    /// * `event` - 原始事件
    /// * `properties` - 注册在事件发生时的属性
    /// * `class_hashes` - 注册的接口名哈希，用于短路判断
    pub fn fire_service_event(
        &self,
        event: &ServiceEvent,
        properties: &PropertyDictionary,
        class_hashes: &[u64],
    ) {
        let snapshot = self.service_listeners.read().clone();
        trace!(
            event_type = %event.kind,
            service_id = %event.reference.id(),
            listeners = snapshot.len(),
            "分发服务事件"
        );

        for entry in snapshot {
            match entry.evaluate(
                event.kind,
                properties,
                class_hashes,
                self.config.object_class_short_circuit,
            ) {
                Verdict::ShortCircuited => {
                    self.stats.short_circuited.fetch_add(1, Ordering::Relaxed);
                }
                Verdict::Removed | Verdict::NoMatch => {}
                Verdict::Deliver(kind) if kind == event.kind => {
                    let ok = entry.deliver(event);
                    self.stats.record(ok);
                }
                Verdict::Deliver(kind) => {
                    self.stats.end_matches.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        listener_id = %entry.id(),
                        service_id = %event.reference.id(),
                        "合成结束匹配事件"
                    );
                    let synthesized = event.with_kind(kind);
                    let ok = entry.deliver(&synthesized);
                    self.stats.record(ok);
                }
            }
        }
    }

    /// 分发模块事件
    pub fn fire_module_event(&self, event: &ModuleEvent) {
        let snapshot = self.module_listeners.read().clone();
        trace!(
            event_type = %event.kind,
            module_id = %event.module,
            listeners = snapshot.len(),
            "分发模块事件"
        );

        for entry in snapshot {
            if entry.admit() {
                let ok = entry.deliver(event);
                self.stats.record(ok);
            }
        }
    }

    /// 当前监听器数量（服务监听器, 模块监听器）
    pub fn listener_count(&self) -> (usize, usize) {
        (
            self.service_listeners.read().len(),
            self.module_listeners.read().len(),
        )
    }

    /// 某模块拥有的监听器 ID
    pub fn listeners_of(&self, owner: ModuleId) -> Vec<ListenerId> {
        let mut ids: Vec<_> = self
            .service_listeners
            .read()
            .iter()
            .filter(|e| e.owner() == owner)
            .map(|e| e.id())
            .collect();
        ids.extend(
            self.module_listeners
                .read()
                .iter()
                .filter(|e| e.owner() == owner)
                .map(|e| e.id()),
        );
        ids.sort();
        ids
    }

    /// 获取分发统计信息
    pub fn stats(&self) -> DispatchStats {
        self.stats.snapshot()
    }

    /// 获取配置
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DispatchConfig::default())
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (services, modules) = self.listener_count();
        f.debug_struct("EventDispatcher")
            .field("service_listeners", &services)
            .field("module_listeners", &modules)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// 在写锁下取出指定监听器，所有者不符时拒绝
fn take_entry<E>(
    list: &RwLock<Vec<Arc<ListenerEntry<E>>>>,
    caller: ModuleId,
    id: ListenerId,
) -> Result<Option<Arc<ListenerEntry<E>>>> {
    let mut list = list.write();
    let Some(pos) = list.iter().position(|e| e.id() == id) else {
        return Ok(None);
    };
    if list[pos].owner() != caller {
        return Err(CoreError::PermissionDenied(format!(
            "{} 不属于 {}",
            id, caller
        )));
    }
    Ok(Some(list.remove(pos)))
}

fn drain_owned<E>(
    list: &RwLock<Vec<Arc<ListenerEntry<E>>>>,
    owner: ModuleId,
) -> Vec<Arc<ListenerEntry<E>>> {
    let mut list = list.write();
    let (owned, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|e| e.owner() == owner);
    *list = kept;
    owned.into_iter().filter(|e| !e.is_removed()).collect()
}
