//! 模块上下文
//!
//! 模块启动时获得的能力入口：发布与查找服务、登记监听器、查询其他模块。
//! 上下文在模块停止后失效，之后的任何调用都返回 `ContextInvalid`。
//!
//! 登记类操作完成后会再检查一次有效标记：若模块在操作进行中被停止，
//! 刚登记的服务、监听器或服务使用会被撤销，调用返回 `ContextInvalid`。
//! 停止流程先置失效标记再清理资源，因此两者之间不会遗留属于已停止模块的资源。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::event::{EventDispatcher, ModuleEvent, ServiceEvent};
use crate::filter::Filter;
use crate::module::metadata::ModuleRecord;
use crate::module::registry::{ModuleRegistry, RegistryCore};
use crate::service::{PropertyDictionary, ServiceObject, ServiceReference, ServiceRegistration, ServiceRegistry};
use crate::utils::id::{ListenerId, ModuleId};
use crate::utils::{CoreError, Result};

/// 模块上下文
///
/// 克隆得到的副本共享同一个有效标记。
#[derive(Clone)]
pub struct ModuleContext {
    module: ModuleId,
    services: ServiceRegistry,
    dispatcher: Arc<EventDispatcher>,
    modules: Weak<RegistryCore>,
    valid: Arc<AtomicBool>,
}

impl ModuleContext {
    pub(crate) fn new(
        module: ModuleId,
        services: ServiceRegistry,
        dispatcher: Arc<EventDispatcher>,
        modules: Weak<RegistryCore>,
    ) -> Self {
        Self {
            module,
            services,
            dispatcher,
            modules,
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    /// 所属模块
    pub fn module_id(&self) -> ModuleId {
        self.module
    }

    /// 上下文是否仍然有效
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            debug!(module_id = %self.module, "模块上下文失效");
        }
    }

    fn check(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(CoreError::ContextInvalid(self.module))
        }
    }

    /// 登记完成后复查有效标记，已失效则撤销登记
    fn settle<T>(&self, value: T, undo: impl FnOnce(&T)) -> Result<T> {
        if self.is_valid() {
            return Ok(value);
        }
        undo(&value);
        debug!(module_id = %self.module, "上下文在登记过程中失效，已撤销");
        Err(CoreError::ContextInvalid(self.module))
    }

    // ==================== 服务 ====================

    /// 以本模块名义发布服务
    pub fn register_service(
        &self,
        interfaces: &[&str],
        service: ServiceObject,
        properties: PropertyDictionary,
    ) -> Result<ServiceRegistration> {
        self.check()?;
        let registration = self
            .services
            .register(self.module, interfaces, service, properties)?;
        self.settle(registration, |r| {
            let _ = r.unregister();
        })
    }

    /// 按接口查找排序最高的服务
    pub fn get_service_reference(&self, interface: &str) -> Result<Option<ServiceReference>> {
        self.check()?;
        Ok(self.services.get_service_reference(interface))
    }

    /// 按接口与过滤表达式查找服务
    ///
    /// # Errors
    ///
    /// 过滤表达式语法错误时返回 `InvalidFilter`。
    pub fn get_service_references(
        &self,
        interface: Option<&str>,
        filter: Option<&str>,
    ) -> Result<Vec<ServiceReference>> {
        self.check()?;
        let filter = filter.map(Filter::parse).transpose()?;
        Ok(self.services.get_service_references(interface, filter.as_ref()))
    }

    /// 获取服务对象，记一次使用
    pub fn get_service(&self, reference: &ServiceReference) -> Result<ServiceObject> {
        self.check()?;
        let object = self.services.get_service(self.module, reference)?;
        self.settle(object, |_| {
            let _ = self.services.unget_service(self.module, reference);
        })
    }

    /// 释放一次使用
    pub fn unget_service(&self, reference: &ServiceReference) -> Result<bool> {
        self.check()?;
        self.services.unget_service(self.module, reference)
    }

    // ==================== 监听器 ====================

    /// 登记服务监听器
    pub fn add_service_listener<F>(&self, filter: Option<&str>, callback: F) -> Result<ListenerId>
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.check()?;
        let id = self
            .dispatcher
            .add_service_listener(self.module, filter, Arc::new(callback))?;
        self.settle(id, |id| {
            let _ = self.dispatcher.remove_service_listener(self.module, *id);
        })
    }

    /// 登记模块监听器
    pub fn add_module_listener<F>(&self, callback: F) -> Result<ListenerId>
    where
        F: Fn(&ModuleEvent) + Send + Sync + 'static,
    {
        self.check()?;
        let id = self.dispatcher.add_module_listener(self.module, Arc::new(callback));
        self.settle(id, |id| {
            let _ = self.dispatcher.remove_module_listener(self.module, *id);
        })
    }

    /// 移除服务监听器，`id` 必须是本模块登记的服务监听器
    pub fn remove_service_listener(&self, id: ListenerId) -> Result<()> {
        self.check()?;
        self.dispatcher.remove_service_listener(self.module, id)
    }

    /// 移除模块监听器，`id` 必须是本模块登记的模块监听器
    pub fn remove_module_listener(&self, id: ListenerId) -> Result<()> {
        self.check()?;
        self.dispatcher.remove_module_listener(self.module, id)
    }

    // ==================== 模块 ====================

    fn registry(&self) -> Result<ModuleRegistry> {
        self.modules
            .upgrade()
            .map(ModuleRegistry::from_core)
            .ok_or(CoreError::ContextInvalid(self.module))
    }

    /// 查询模块记录
    pub fn module(&self, id: ModuleId) -> Result<ModuleRecord> {
        self.check()?;
        self.registry()?.get(id)
    }

    /// 所有已安装模块
    pub fn modules(&self) -> Result<Vec<ModuleRecord>> {
        self.check()?;
        Ok(self.registry()?.modules())
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module", &self.module)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::properties::SERVICE_RANKING;
    use parking_lot::Mutex;

    fn context(module: u64) -> ModuleContext {
        let dispatcher = Arc::new(EventDispatcher::default());
        let services = ServiceRegistry::new(Arc::clone(&dispatcher));
        ModuleContext::new(ModuleId::new(module), services, dispatcher, Weak::new())
    }

    #[test]
    fn test_register_and_lookup() {
        let ctx = context(3);
        let registration = ctx
            .register_service(
                &["Counter"],
                ServiceObject::single("Counter", 1u32),
                PropertyDictionary::new().with(SERVICE_RANKING, 5),
            )
            .unwrap();

        let reference = ctx.get_service_reference("Counter").unwrap().unwrap();
        assert_eq!(reference, registration.reference());
        assert_eq!(reference.owner().unwrap(), ModuleId::new(3));

        let found = ctx
            .get_service_references(Some("Counter"), Some("(service.ranking>=5)"))
            .unwrap();
        assert_eq!(found.len(), 1);

        let object = ctx.get_service(&reference).unwrap();
        assert_eq!(object.get::<u32>("Counter"), Some(&1));
        assert_eq!(reference.using_modules(), vec![ModuleId::new(3)]);
        assert!(ctx.unget_service(&reference).unwrap());
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let ctx = context(1);
        assert!(matches!(
            ctx.get_service_references(None, Some("(a=")),
            Err(CoreError::InvalidFilter(_))
        ));
        assert!(matches!(
            ctx.add_service_listener(Some("bad"), |_| {}),
            Err(CoreError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_invalidated_context_rejects_calls() {
        let ctx = context(2);
        let copy = ctx.clone();
        ctx.invalidate();

        assert!(!copy.is_valid());
        assert!(matches!(
            copy.get_service_reference("Counter"),
            Err(CoreError::ContextInvalid(id)) if id == ModuleId::new(2)
        ));
        assert!(matches!(
            copy.add_module_listener(|_| {}),
            Err(CoreError::ContextInvalid(_))
        ));
    }

    #[test]
    fn test_listener_add_remove() {
        let ctx = context(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = ctx
            .add_service_listener(Some("(objectClass=Counter)"), move |e| {
                sink.lock().push(e.kind);
            })
            .unwrap();

        ctx.register_service(&["Counter"], ServiceObject::single("Counter", 0u8), PropertyDictionary::new())
            .unwrap();
        assert_eq!(seen.lock().len(), 1);

        ctx.remove_service_listener(id).unwrap();
        assert!(matches!(
            ctx.remove_service_listener(id),
            Err(CoreError::ListenerNotFound(_))
        ));
    }

    #[test]
    fn test_remove_listener_of_wrong_kind() {
        let ctx = context(6);
        let service_listener = ctx.add_service_listener(None, |_| {}).unwrap();
        let module_listener = ctx.add_module_listener(|_| {}).unwrap();

        assert!(matches!(
            ctx.remove_module_listener(service_listener),
            Err(CoreError::ListenerNotFound(_))
        ));
        assert!(matches!(
            ctx.remove_service_listener(module_listener),
            Err(CoreError::ListenerNotFound(_))
        ));

        ctx.remove_service_listener(service_listener).unwrap();
        ctx.remove_module_listener(module_listener).unwrap();
    }

    #[test]
    fn test_registration_undone_when_invalidated_meanwhile() {
        let dispatcher = Arc::new(EventDispatcher::default());
        let services = ServiceRegistry::new(Arc::clone(&dispatcher));
        let ctx = ModuleContext::new(
            ModuleId::new(7),
            services.clone(),
            Arc::clone(&dispatcher),
            Weak::new(),
        );

        // 监听器在 Registered 事件中作废上下文，模拟登记过程中模块被停止
        let stopper = ctx.clone();
        dispatcher
            .add_service_listener(ModuleId::SYSTEM, None, Arc::new(move |_: &ServiceEvent| stopper.invalidate()))
            .unwrap();

        let result = ctx.register_service(
            &["Counter"],
            ServiceObject::single("Counter", 0u8),
            PropertyDictionary::new(),
        );
        assert!(matches!(result, Err(CoreError::ContextInvalid(_))));
        assert!(services.registered_services(ModuleId::new(7)).is_empty());
        assert!(services.get_service_reference("Counter").is_none());
    }

    #[test]
    fn test_module_queries_without_registry() {
        let ctx = context(5);
        assert!(matches!(ctx.modules(), Err(CoreError::ContextInvalid(_))));
    }
}
