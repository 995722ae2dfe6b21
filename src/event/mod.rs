//! 事件系统
//!
//! 模块生命周期事件与服务变更事件的定义、监听器条目以及同步分发器。

#[allow(clippy::module_inception)]
pub mod event;
pub mod dispatcher;
pub(crate) mod listener;

pub use dispatcher::{DispatchStats, EventDispatcher, ModuleListener, ServiceListener};
pub use event::{ModuleEvent, ModuleEventKind, ServiceEvent, ServiceEventKind};
pub use listener::Callback;
