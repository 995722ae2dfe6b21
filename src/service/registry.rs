//! 服务注册表
//!
//! 管理所有已发布的服务，提供注册、注销、属性修改和按排序权重查找。
//!
//! 服务表由一把读写锁保护：查找只取读锁，互不阻塞；注册与注销取写锁。
//! 事件分发总在释放表锁之后进行。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::event::event::{ServiceEvent, ServiceEventKind};
use crate::event::listener::class_hash;
use crate::event::EventDispatcher;
use crate::filter::Filter;
use crate::service::object::ServiceObject;
use crate::service::properties::{PropertyDictionary, Value, OBJECT_CLASS, SERVICE_ID};
use crate::service::reference::{ServiceReference, ServiceRegistration};
use crate::utils::id::{IdAllocator, ModuleId, ServiceId};
use crate::utils::{CoreError, Result};

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    /// 已注册，可被查找
    Live,
    /// 正在注销：查找不再返回，但注销事件的监听器仍可读取属性、获取服务
    Unregistering,
    /// 已从服务表移除
    Removed,
}

/// 服务表中的一条注册
pub(crate) struct RegistrationEntry {
    id: ServiceId,
    owner: ModuleId,
    interfaces: Vec<String>,
    class_hashes: Vec<u64>,
    properties: RwLock<Arc<PropertyDictionary>>,
    service: ServiceObject,
    state: Mutex<RegistrationState>,
    /// 使用计数：模块 -> 获取次数
    usage: Mutex<HashMap<ModuleId, usize>>,
}

impl RegistrationEntry {
    pub(crate) fn owner(&self) -> ModuleId {
        self.owner
    }

    pub(crate) fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub(crate) fn properties(&self) -> Arc<PropertyDictionary> {
        Arc::clone(&self.properties.read())
    }

    pub(crate) fn state(&self) -> RegistrationState {
        *self.state.lock()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state() == RegistrationState::Live
    }

    pub(crate) fn users(&self) -> Vec<ModuleId> {
        let mut users: Vec<_> = self.usage.lock().keys().copied().collect();
        users.sort();
        users
    }
}

#[derive(Default)]
struct ServiceTable {
    /// 服务 ID -> 注册（ID 单调递增，迭代顺序即注册顺序）
    entries: BTreeMap<ServiceId, Arc<RegistrationEntry>>,

    /// 接口名 -> 服务 ID 列表
    by_class: HashMap<String, Vec<ServiceId>>,
}

impl ServiceTable {
    fn insert(&mut self, entry: Arc<RegistrationEntry>) {
        for name in &entry.interfaces {
            self.by_class.entry(name.clone()).or_default().push(entry.id);
        }
        self.entries.insert(entry.id, entry);
    }

    fn remove(&mut self, id: ServiceId) -> Option<Arc<RegistrationEntry>> {
        let entry = self.entries.remove(&id)?;
        for name in &entry.interfaces {
            if let Some(ids) = self.by_class.get_mut(name) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    self.by_class.remove(name);
                }
            }
        }
        Some(entry)
    }
}

/// 注册表共享状态（服务引用持有它的弱引用）
pub(crate) struct RegistryShared {
    table: RwLock<ServiceTable>,
    ids: IdAllocator,
    dispatcher: Arc<EventDispatcher>,
}

impl RegistryShared {
    pub(crate) fn entry(&self, id: ServiceId) -> Option<Arc<RegistrationEntry>> {
        self.table.read().entries.get(&id).cloned()
    }
}

/// 服务注册表
///
/// 克隆得到的是同一个注册表的句柄。
#[derive(Clone)]
pub struct ServiceRegistry {
    shared: Arc<RegistryShared>,
}

impl ServiceRegistry {
    /// 创建注册表，事件通过 `dispatcher` 分发
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                table: RwLock::new(ServiceTable::default()),
                ids: IdAllocator::default(),
                dispatcher,
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<RegistryShared>) -> Self {
        Self { shared }
    }

    fn reference(&self, id: ServiceId) -> ServiceReference {
        ServiceReference::new(id, &self.shared)
    }

    fn owned_entry(&self, caller: ModuleId, id: ServiceId) -> Result<Option<Arc<RegistrationEntry>>> {
        let Some(entry) = self.shared.entry(id) else {
            return Ok(None);
        };
        if entry.owner != caller {
            return Err(CoreError::PermissionDenied(format!(
                "{} 不属于 {}",
                id, caller
            )));
        }
        Ok(Some(entry))
    }

    /// 注册服务
    ///
    /// # 参数
    ///
    /// * `owner` - 发布服务的模块
    /// * `interfaces` - 接口名集合（去重后不能为空，且服务对象必须提供每个接口）
    /// * `service` - 服务对象
    /// * `properties` - 服务属性；`objectClass` 与 `service.id` 由注册表设置
    ///
    /// # 返回
    ///
    /// 注册凭证。注册完成后同步分发 `Registered` 事件。
    pub fn register(
        &self,
        owner: ModuleId,
        interfaces: &[&str],
        service: ServiceObject,
        properties: PropertyDictionary,
    ) -> Result<ServiceRegistration> {
        let mut names: Vec<String> = Vec::with_capacity(interfaces.len());
        for name in interfaces {
            if name.is_empty() {
                return Err(CoreError::InvalidArgument("接口名不能为空".to_string()));
            }
            if !names.iter().any(|n| n == name) {
                names.push((*name).to_string());
            }
        }
        if names.is_empty() {
            return Err(CoreError::InvalidArgument("接口集合不能为空".to_string()));
        }
        if let Some(missing) = names.iter().find(|n| !service.provides(n)) {
            return Err(CoreError::InvalidArgument(format!(
                "服务对象未提供接口 '{}'",
                missing
            )));
        }

        let id = ServiceId::new(self.shared.ids.allocate());
        let properties = Arc::new(stamp(properties, id, &names));
        let class_hashes: Vec<u64> = names.iter().map(|n| class_hash(n)).collect();

        let entry = Arc::new(RegistrationEntry {
            id,
            owner,
            interfaces: names,
            class_hashes,
            properties: RwLock::new(Arc::clone(&properties)),
            service,
            state: Mutex::new(RegistrationState::Live),
            usage: Mutex::new(HashMap::new()),
        });

        self.shared.table.write().insert(Arc::clone(&entry));

        info!(
            service_id = %id,
            module_id = %owner,
            interfaces = ?entry.interfaces,
            "服务已注册"
        );

        let reference = self.reference(id);
        let event = ServiceEvent::new(ServiceEventKind::Registered, reference.clone());
        self.shared
            .dispatcher
            .fire_service_event(&event, &properties, &entry.class_hashes);

        Ok(ServiceRegistration::new(reference, owner))
    }

    /// 注销服务
    ///
    /// 先把注册标记为注销中（查找立即不再返回它），再分发 `Unregistering`，
    /// 最后从服务表移除。重复注销无副作用。
    pub fn unregister(&self, caller: ModuleId, id: ServiceId) -> Result<()> {
        let Some(entry) = self.owned_entry(caller, id)? else {
            return Ok(());
        };

        {
            let mut state = entry.state.lock();
            if *state != RegistrationState::Live {
                return Ok(());
            }
            *state = RegistrationState::Unregistering;
        }

        let event = ServiceEvent::new(ServiceEventKind::Unregistering, self.reference(id));
        self.shared
            .dispatcher
            .fire_service_event(&event, &entry.properties(), &entry.class_hashes);

        self.shared.table.write().remove(id);
        *entry.state.lock() = RegistrationState::Removed;
        entry.usage.lock().clear();

        info!(service_id = %id, module_id = %entry.owner, "服务已注销");
        Ok(())
    }

    /// 替换服务属性并分发 `Modified`
    ///
    /// `objectClass` 与 `service.id` 保持不变。
    pub fn update_properties(
        &self,
        caller: ModuleId,
        id: ServiceId,
        properties: PropertyDictionary,
    ) -> Result<()> {
        let entry = self
            .owned_entry(caller, id)?
            .filter(|e| e.is_live())
            .ok_or(CoreError::ServiceUnregistered(id))?;

        let properties = Arc::new(stamp(properties, id, &entry.interfaces));
        *entry.properties.write() = Arc::clone(&properties);

        debug!(service_id = %id, "服务属性已更新");

        let event = ServiceEvent::new(ServiceEventKind::Modified, self.reference(id));
        self.shared
            .dispatcher
            .fire_service_event(&event, &properties, &entry.class_hashes);
        Ok(())
    }

    /// 获取实现指定接口的最佳服务
    ///
    /// 排序权重最高者优先；权重相同时注册最早（ID 最小）者优先。
    pub fn get_service_reference(&self, interface: &str) -> Option<ServiceReference> {
        self.get_service_references(Some(interface), None)
            .into_iter()
            .next()
    }

    /// 按接口与过滤器查找服务，结果按排序权重降序、ID 升序排列
    ///
    /// `interface` 为 `None` 时搜索全部服务。
    pub fn get_service_references(
        &self,
        interface: Option<&str>,
        filter: Option<&Filter>,
    ) -> Vec<ServiceReference> {
        let candidates: Vec<Arc<RegistrationEntry>> = {
            let table = self.shared.table.read();
            match interface {
                Some(name) => table
                    .by_class
                    .get(name)
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| table.entries.get(id).cloned())
                            .collect()
                    })
                    .unwrap_or_default(),
                None => table.entries.values().cloned().collect(),
            }
        };

        let mut ranked: Vec<(f64, ServiceId)> = candidates
            .iter()
            .filter(|entry| entry.is_live())
            .filter_map(|entry| {
                let properties = entry.properties();
                match filter {
                    Some(filter) if !filter.matches(&properties) => None,
                    _ => Some((properties.ranking(), entry.id)),
                }
            })
            .collect();

        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .map(|(_, id)| self.reference(id))
            .collect()
    }

    /// 获取服务对象并记录使用
    ///
    /// 默认构造的引用返回 `InvalidArgument`；已移除的服务返回 `ServiceUnregistered`。
    pub fn get_service(&self, caller: ModuleId, reference: &ServiceReference) -> Result<ServiceObject> {
        let entry = reference.entry()?;
        if entry.state() == RegistrationState::Removed {
            return Err(CoreError::ServiceUnregistered(reference.id()));
        }
        *entry.usage.lock().entry(caller).or_insert(0) += 1;
        Ok(entry.service.clone())
    }

    /// 释放一次服务使用
    ///
    /// # 返回
    ///
    /// 调用方此前确实在使用该服务时返回 `true`
    pub fn unget_service(&self, caller: ModuleId, reference: &ServiceReference) -> Result<bool> {
        let entry = match reference.entry() {
            Ok(entry) => entry,
            Err(CoreError::ServiceUnregistered(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut usage = entry.usage.lock();
        match usage.get_mut(&caller) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Ok(true)
            }
            Some(_) => {
                usage.remove(&caller);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 模块正在使用的服务
    pub fn services_in_use(&self, module: ModuleId) -> Vec<ServiceReference> {
        let table = self.shared.table.read();
        table
            .entries
            .values()
            .filter(|entry| entry.usage.lock().contains_key(&module))
            .map(|entry| self.reference(entry.id))
            .collect()
    }

    /// 模块发布的仍处于注册状态的服务
    pub fn registered_services(&self, module: ModuleId) -> Vec<ServiceReference> {
        let table = self.shared.table.read();
        table
            .entries
            .values()
            .filter(|entry| entry.owner == module && entry.is_live())
            .map(|entry| self.reference(entry.id))
            .collect()
    }

    /// 注销模块发布的全部服务
    ///
    /// # 返回
    ///
    /// 被注销的服务数量
    pub fn unregister_all(&self, owner: ModuleId) -> usize {
        let ids: Vec<ServiceId> = self
            .registered_services(owner)
            .iter()
            .map(ServiceReference::id)
            .collect();

        let mut count = 0;
        for id in ids {
            if self.unregister(owner, id).is_ok() {
                count += 1;
            }
        }
        if count > 0 {
            debug!(module_id = %owner, count, "批量注销服务");
        }
        count
    }

    /// 释放模块对所有服务的使用
    pub fn release_usages(&self, module: ModuleId) -> usize {
        let table = self.shared.table.read();
        table
            .entries
            .values()
            .filter(|entry| entry.usage.lock().remove(&module).is_some())
            .count()
    }

    /// 注册状态；已移除的服务返回 `None`
    pub fn state_of(&self, id: ServiceId) -> Option<RegistrationState> {
        self.shared.entry(id).map(|e| e.state())
    }

    /// 服务表中的注册数（含注销中的）
    pub fn len(&self) -> usize {
        self.shared.table.read().entries.len()
    }

    /// 服务表是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.len())
            .finish()
    }
}

/// 写入注册表维护的属性
fn stamp(mut properties: PropertyDictionary, id: ServiceId, interfaces: &[String]) -> PropertyDictionary {
    properties.insert(OBJECT_CLASS, Value::StringList(interfaces.to_vec()));
    properties.insert(SERVICE_ID, id.value());
    properties
}
