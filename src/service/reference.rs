//! 服务引用与注册凭证
//!
//! [`ServiceReference`] 是不持有所有权的查找句柄：服务 ID 加上指向注册表的弱引用。
//! [`ServiceRegistration`] 是发布方持有的凭证，可以修改属性或注销服务。

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use crate::service::properties::{PropertyDictionary, Value};
use crate::service::registry::{RegistrationEntry, RegistryShared, ServiceRegistry};
use crate::utils::id::{ModuleId, ServiceId};
use crate::utils::{CoreError, Result};

/// 服务引用
///
/// 相等性与哈希只看服务 ID。默认构造的引用无效，对它的任何查询都返回
/// `InvalidArgument`；服务注销后查询返回 `ServiceUnregistered`。
#[derive(Clone)]
pub struct ServiceReference {
    id: ServiceId,
    registry: Weak<RegistryShared>,
}

impl ServiceReference {
    pub(crate) fn new(id: ServiceId, registry: &Arc<RegistryShared>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    /// 服务 ID
    pub fn id(&self) -> ServiceId {
        self.id
    }

    /// 是否为默认构造的无效引用
    pub fn is_default(&self) -> bool {
        !self.id.is_valid()
    }

    pub(crate) fn entry(&self) -> Result<Arc<RegistrationEntry>> {
        if self.is_default() {
            return Err(CoreError::InvalidArgument("无效的服务引用".to_string()));
        }
        self.registry
            .upgrade()
            .and_then(|shared| shared.entry(self.id))
            .ok_or(CoreError::ServiceUnregistered(self.id))
    }

    pub(crate) fn registry(&self) -> Option<ServiceRegistry> {
        self.registry.upgrade().map(ServiceRegistry::from_shared)
    }

    /// 服务当前属性（注销事件分发期间仍可读取）
    pub fn properties(&self) -> Result<Arc<PropertyDictionary>> {
        Ok(self.entry()?.properties())
    }

    /// 读取单个属性，服务已不存在时返回 `None`
    pub fn property(&self, key: &str) -> Option<Value> {
        self.properties().ok()?.get(key).cloned()
    }

    /// 属性键名列表
    pub fn property_keys(&self) -> Vec<String> {
        self.properties()
            .map(|props| props.keys().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// 服务发布的接口名
    pub fn interfaces(&self) -> Result<Vec<String>> {
        Ok(self.entry()?.interfaces().to_vec())
    }

    /// 发布服务的模块
    pub fn owner(&self) -> Result<ModuleId> {
        Ok(self.entry()?.owner())
    }

    /// 排序权重，服务已不存在时为 0
    pub fn ranking(&self) -> f64 {
        self.properties().map(|p| p.ranking()).unwrap_or(0.0)
    }

    /// 服务是否仍处于已注册状态
    pub fn is_live(&self) -> bool {
        self.entry().map(|e| e.is_live()).unwrap_or(false)
    }

    /// 正在使用该服务的模块
    pub fn using_modules(&self) -> Vec<ModuleId> {
        self.entry().map(|e| e.users()).unwrap_or_default()
    }
}

impl Default for ServiceReference {
    fn default() -> Self {
        Self {
            id: ServiceId::INVALID,
            registry: Weak::new(),
        }
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceReference {}

impl Hash for ServiceReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceReference").field(&self.id).finish()
    }
}

impl fmt::Display for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// 服务注册凭证
///
/// 由发布方持有。丢弃凭证不会注销服务；服务在显式注销或所属模块停止时移除。
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    reference: ServiceReference,
    owner: ModuleId,
}

impl ServiceRegistration {
    pub(crate) fn new(reference: ServiceReference, owner: ModuleId) -> Self {
        Self { reference, owner }
    }

    /// 服务 ID
    pub fn id(&self) -> ServiceId {
        self.reference.id()
    }

    /// 对应的服务引用
    pub fn reference(&self) -> ServiceReference {
        self.reference.clone()
    }

    /// 替换服务属性，触发 `Modified`
    pub fn set_properties(&self, properties: PropertyDictionary) -> Result<()> {
        let registry = self
            .reference
            .registry()
            .ok_or(CoreError::ServiceUnregistered(self.id()))?;
        registry.update_properties(self.owner, self.id(), properties)
    }

    /// 注销服务，重复注销无副作用
    pub fn unregister(&self) -> Result<()> {
        match self.reference.registry() {
            Some(registry) => registry.unregister(self.owner, self.id()),
            None => Ok(()),
        }
    }
}
