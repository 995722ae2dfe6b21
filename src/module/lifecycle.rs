//! 模块生命周期
//!
//! 激活器接口与状态迁移规则。

use std::panic::{self, AssertUnwindSafe};

use crate::event::listener::panic_message;
use crate::module::context::ModuleContext;
use crate::module::metadata::ModuleState;

/// 模块激活器
///
/// 模块启动时框架调用 `start`，停止时调用 `stop`。两个回调都在发起迁移的
/// 线程上同步执行；返回错误或 panic 都视为失败。
pub trait Activator: Send + Sync {
    /// 模块启动
    fn start(&self, context: &ModuleContext) -> anyhow::Result<()>;

    /// 模块停止
    fn stop(&self, context: &ModuleContext) -> anyhow::Result<()>;
}

/// 状态迁移是否合法
///
/// ```text
/// Installed -> Resolved -> Starting -> Active -> Stopping -> Resolved
/// Starting -> Resolved          (start 失败回滚)
/// Installed | Resolved -> Uninstalled
/// ```
pub fn can_transition(from: ModuleState, to: ModuleState) -> bool {
    use ModuleState::*;
    matches!(
        (from, to),
        (Installed, Resolved)
            | (Resolved, Starting)
            | (Starting, Active)
            | (Starting, Resolved)
            | (Active, Stopping)
            | (Stopping, Resolved)
            | (Installed, Uninstalled)
            | (Resolved, Uninstalled)
    )
}

/// 执行一次激活器回调，把 panic 转换为错误信息
pub(crate) fn invoke<F>(callback: F) -> std::result::Result<(), String>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(format!("激活器 panic: {}", panic_message(&*payload))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ModuleState::*;

    #[test]
    fn test_legal_transitions() {
        assert!(can_transition(Installed, Resolved));
        assert!(can_transition(Resolved, Starting));
        assert!(can_transition(Starting, Active));
        assert!(can_transition(Starting, Resolved));
        assert!(can_transition(Active, Stopping));
        assert!(can_transition(Stopping, Resolved));
        assert!(can_transition(Resolved, Uninstalled));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!can_transition(Installed, Active));
        assert!(!can_transition(Installed, Starting));
        assert!(!can_transition(Active, Resolved));
        assert!(!can_transition(Active, Uninstalled));
        assert!(!can_transition(Stopping, Active));
        assert!(!can_transition(Uninstalled, Installed));
        assert!(!can_transition(Uninstalled, Resolved));
    }

    #[test]
    fn test_invoke_maps_failures() {
        assert!(invoke(|| Ok(())).is_ok());

        let err = invoke(|| Err(anyhow::anyhow!("数据库不可用"))).unwrap_err();
        assert!(err.contains("数据库不可用"));

        let err = invoke(|| panic!("boom")).unwrap_err();
        assert!(err.contains("boom"));
    }
}
