//! 服务对象
//!
//! 服务实现以接口名为键存放为类型擦除的值，使用方按接口名取出并安全向下转型。

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// 服务能力句柄
///
/// 克隆开销很小（内部为 `Arc`）。同一个实现可以以多个接口名发布，
/// 例如把同一个 `Arc<dyn Logger>` 同时登记为 `"Logger"` 和 `"Sink"`。
#[derive(Clone, Default)]
pub struct ServiceObject {
    interfaces: Arc<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceObject {
    /// 创建空的服务对象
    pub fn new() -> Self {
        Self::default()
    }

    /// 以单个接口创建
    pub fn single<T: Any + Send + Sync>(interface: impl Into<String>, value: T) -> Self {
        Self::new().with_interface(interface, value)
    }

    /// 登记一个接口的实现
    pub fn with_interface<T: Any + Send + Sync>(
        mut self,
        interface: impl Into<String>,
        value: T,
    ) -> Self {
        Arc::make_mut(&mut self.interfaces).insert(interface.into(), Arc::new(value));
        self
    }

    /// 是否提供指定接口
    pub fn provides(&self, interface: &str) -> bool {
        self.interfaces.contains_key(interface)
    }

    /// 按接口名取出实现并向下转型，类型不符时返回 `None`
    pub fn get<T: Any + Send + Sync>(&self, interface: &str) -> Option<&T> {
        self.interfaces
            .get(interface)
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// 已登记的接口名
    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.interfaces.keys().map(String::as_str)
    }
}

impl fmt::Debug for ServiceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.interfaces().collect();
        names.sort_unstable();
        f.debug_struct("ServiceObject")
            .field("interfaces", &names)
            .finish()
    }
}
