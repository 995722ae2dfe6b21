//! 监听器条目
//!
//! 每个条目持有回调、可选过滤器以及一个受条目自身锁保护的匹配锁存器。
//! 锁只覆盖锁存器的读写与在途计数，用户回调永远在锁外执行，
//! 因此回调可以安全地回调注册表（包括移除自己）。

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::event::event::ServiceEventKind;
use crate::filter::Filter;
use crate::service::properties::PropertyDictionary;
use crate::utils::id::{ListenerId, ModuleId};

/// 监听器回调
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

thread_local! {
    /// 当前线程正在执行的监听器（允许嵌套分发）
    static DELIVERING: RefCell<Vec<ListenerId>> = const { RefCell::new(Vec::new()) };
}

/// 计算接口名哈希
pub(crate) fn class_hash(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// 单次投递的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// 所需接口不在注册的接口集合中，未加锁即跳过
    ShortCircuited,
    /// 条目已移除
    Removed,
    /// 过滤器不匹配，不投递
    NoMatch,
    /// 投递（可能是合成的结束匹配事件）
    Deliver(ServiceEventKind),
}

#[derive(Debug, Default)]
struct LatchState {
    matched: bool,
    removed: bool,
    in_flight: usize,
}

/// 监听器条目
pub(crate) struct ListenerEntry<E> {
    id: ListenerId,
    owner: ModuleId,
    callback: Callback<E>,
    filter: Option<Filter>,
    required_class_hash: Option<u64>,
    state: Mutex<LatchState>,
    idle: Condvar,
}

impl<E> ListenerEntry<E> {
    pub(crate) fn new(
        id: ListenerId,
        owner: ModuleId,
        filter: Option<Filter>,
        callback: Callback<E>,
    ) -> Self {
        let required_class_hash = filter
            .as_ref()
            .and_then(Filter::required_object_class)
            .map(class_hash);
        Self {
            id,
            owner,
            callback,
            filter,
            required_class_hash,
            state: Mutex::new(LatchState::default()),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn owner(&self) -> ModuleId {
        self.owner
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.state.lock().removed
    }

    /// 服务事件的投递判定
    ///
    /// 返回 `Deliver` 时在途计数已加一，调用方必须随后调用 [`Self::deliver`]。
    /// `short_circuit` 为 `false` 时不做接口哈希预判，总是求值过滤器。
    pub(crate) fn evaluate(
        &self,
        kind: ServiceEventKind,
        properties: &PropertyDictionary,
        class_hashes: &[u64],
        short_circuit: bool,
    ) -> Verdict {
        if let (true, Some(required)) = (short_circuit, self.required_class_hash) {
            if !class_hashes.contains(&required) {
                return Verdict::ShortCircuited;
            }
        }

        let mut state = self.state.lock();
        if state.removed {
            return Verdict::Removed;
        }

        let matches = self
            .filter
            .as_ref()
            .map_or(true, |filter| filter.matches(properties));

        let verdict = if matches {
            state.matched = true;
            Verdict::Deliver(kind)
        } else if state.matched {
            state.matched = false;
            if kind == ServiceEventKind::Modified {
                Verdict::Deliver(ServiceEventKind::ModifiedEndMatch)
            } else {
                Verdict::NoMatch
            }
        } else {
            Verdict::NoMatch
        };

        if matches!(verdict, Verdict::Deliver(_)) {
            state.in_flight += 1;
        }
        verdict
    }

    /// 无过滤器事件（模块事件）的投递判定
    pub(crate) fn admit(&self) -> bool {
        let mut state = self.state.lock();
        if state.removed {
            return false;
        }
        state.in_flight += 1;
        true
    }

    /// 执行回调
    ///
    /// 必须在 `evaluate` 返回 `Deliver` 或 `admit` 返回 `true` 之后调用。
    /// 回调 panic 总是被捕获并记录，返回 `false`。
    pub(crate) fn deliver(&self, event: &E) -> bool {
        let _guard = InFlight::enter(self);
        let result = panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(event)));
        match result {
            Ok(()) => true,
            Err(payload) => {
                tracing::error!(
                    listener_id = %self.id,
                    module_id = %self.owner,
                    panic = %panic_message(&*payload),
                    "监听器回调 panic，已隔离"
                );
                false
            }
        }
    }

    /// 标记为已移除并等待在途回调结束
    ///
    /// 在自身回调内部调用时只等待其他线程上的投递，不会死锁。
    /// 返回 `false` 表示此前已被移除。
    pub(crate) fn mark_removed(&self) -> bool {
        let own = DELIVERING.with(|stack| stack.borrow().iter().filter(|id| **id == self.id).count());

        let mut state = self.state.lock();
        if state.removed {
            return false;
        }
        state.removed = true;
        while state.in_flight > own {
            self.idle.wait(&mut state);
        }
        true
    }
}

/// 在途投递守卫：登记当前线程正在执行的监听器，结束时释放计数
struct InFlight<'a, E> {
    entry: &'a ListenerEntry<E>,
}

impl<'a, E> InFlight<'a, E> {
    fn enter(entry: &'a ListenerEntry<E>) -> Self {
        DELIVERING.with(|stack| stack.borrow_mut().push(entry.id));
        Self { entry }
    }
}

impl<E> Drop for InFlight<'_, E> {
    fn drop(&mut self) {
        DELIVERING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|id| *id == self.entry.id) {
                stack.remove(pos);
            }
        });

        let mut state = self.entry.state.lock();
        state.in_flight -= 1;
        self.entry.idle.notify_all();
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}
