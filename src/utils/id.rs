//! 标识符定义与分配
//!
//! 模块、服务和监听器都使用单调递增的 64 位整数作为标识，
//! 分配后永不复用。标识只是可复制的句柄，不携带任何所有权语义。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// 从原始数值构造
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// 获取原始数值
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }
    };
}

define_id!(
    /// 模块标识
    ///
    /// `0` 保留给框架自身（系统模块），已安装模块从 `1` 开始编号。
    ModuleId,
    "module"
);

define_id!(
    /// 服务标识
    ///
    /// `0` 表示无效引用（默认构造的 `ServiceReference`）。
    ServiceId,
    "service"
);

define_id!(
    /// 监听器标识
    ListenerId,
    "listener"
);

impl ModuleId {
    /// 系统模块（框架自身）
    pub const SYSTEM: ModuleId = ModuleId(0);
}

impl ServiceId {
    /// 无效的服务标识
    pub const INVALID: ServiceId = ServiceId(0);

    /// 是否为有效标识
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// 单调递增的标识分配器
///
/// 线程安全，分配出的值永不重复。
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// 创建分配器，首个分配值为 `first`
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// 分配下一个原始值
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// 查看下一个将被分配的值（不消耗）
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}
