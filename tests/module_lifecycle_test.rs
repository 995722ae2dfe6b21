//! # 模块生命周期集成测试
//!
//! 通过 Framework 与内存加载器测试模块系统的完整工作流程，包括：
//! - 安装 → 解析 → 启动 → 停止 → 卸载
//! - 状态机合法性与幂等性（含随机操作序列）
//! - 激活器失败回滚与资源清理
//! - 依赖解析、版本约束与循环依赖
//! - 模块间通过服务协作

use std::sync::Arc;

use chips_runtime::module::can_transition;
use chips_runtime::module::metadata::{
    MODULE_ACTIVATOR, MODULE_REQUIRES, MODULE_SYMBOLIC_NAME, MODULE_VERSION,
};
use chips_runtime::{
    Activator, CoreConfig, CoreError, Framework, ModuleContext, ModuleEvent, ModuleEventKind,
    ModuleId, ModuleState, PropertyDictionary, ServiceEventKind, ServiceObject, StaticLoader,
    Value,
};
use parking_lot::Mutex;
use proptest::prelude::*;

// ============================================================================
// 测试辅助结构
// ============================================================================

/// 激活器行为
#[derive(Clone, Copy)]
enum Behavior {
    /// 启动时发布 Greeter 服务
    Publish,
    /// 启动时查找并使用 Greeter 服务
    Consume,
    /// 发布服务后返回错误
    FailAfterPublish,
    /// 启动时 panic
    Panic,
    /// stop 返回错误
    FailOnStop,
}

struct TestActivator {
    behavior: Behavior,
    kept: Arc<Mutex<Option<ModuleContext>>>,
}

impl Activator for TestActivator {
    fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
        *self.kept.lock() = Some(context.clone());
        match self.behavior {
            Behavior::Publish | Behavior::FailOnStop => {
                context.register_service(
                    &["Greeter"],
                    ServiceObject::single("Greeter", String::from("hello")),
                    PropertyDictionary::new(),
                )?;
                Ok(())
            }
            Behavior::Consume => {
                let reference = context
                    .get_service_reference("Greeter")?
                    .ok_or_else(|| anyhow::anyhow!("Greeter 不可用"))?;
                let object = context.get_service(&reference)?;
                anyhow::ensure!(object.get::<String>("Greeter").is_some(), "Greeter 类型不符");
                Ok(())
            }
            Behavior::FailAfterPublish => {
                context.register_service(
                    &["Greeter"],
                    ServiceObject::single("Greeter", String::from("half")),
                    PropertyDictionary::new(),
                )?;
                context.add_module_listener(|_| {})?;
                anyhow::bail!("配置缺失")
            }
            Behavior::Panic => panic!("activator boom"),
        }
    }

    fn stop(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        match self.behavior {
            Behavior::FailOnStop => anyhow::bail!("stop 失败"),
            _ => Ok(()),
        }
    }
}

fn manifest(name: &str, version: &str, requires: &[&str]) -> PropertyDictionary {
    let mut dict = PropertyDictionary::new()
        .with(MODULE_SYMBOLIC_NAME, name)
        .with(MODULE_VERSION, version);
    if !requires.is_empty() {
        dict.insert(
            MODULE_REQUIRES,
            Value::StringList(requires.iter().map(|s| s.to_string()).collect()),
        );
    }
    dict
}

struct Harness {
    loader: StaticLoader,
    framework: Framework,
    events: Arc<Mutex<Vec<(ModuleId, ModuleEventKind)>>>,
    kept: Arc<Mutex<Option<ModuleContext>>>,
}

impl Harness {
    fn new() -> Self {
        let loader = StaticLoader::new();
        let framework = Framework::new(CoreConfig::default(), Arc::new(loader.clone()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        framework
            .add_module_listener(move |e: &ModuleEvent| sink.lock().push((e.module, e.kind)))
            .unwrap();
        Self {
            loader,
            framework,
            events,
            kept: Arc::new(Mutex::new(None)),
        }
    }

    fn add(&self, location: &str, dict: PropertyDictionary, behavior: Behavior) {
        let kept = Arc::clone(&self.kept);
        self.loader.add_with_activator(
            location,
            dict.with(MODULE_ACTIVATOR, location),
            move || {
                Arc::new(TestActivator {
                    behavior,
                    kept: Arc::clone(&kept),
                }) as Arc<dyn Activator>
            },
        );
    }

    fn kinds(&self, id: ModuleId) -> Vec<ModuleEventKind> {
        self.events
            .lock()
            .iter()
            .filter(|(m, _)| *m == id)
            .map(|(_, k)| *k)
            .collect()
    }
}

// ============================================================================
// 基本生命周期
// ============================================================================

#[test]
fn test_full_lifecycle_event_sequence() {
    let h = Harness::new();
    h.add("mem:greeter", manifest("greeter", "1.0.0", &[]), Behavior::Publish);
    let modules = h.framework.modules();

    let id = h.framework.install("mem:greeter").unwrap();
    assert_eq!(modules.state(id).unwrap(), ModuleState::Installed);

    // 未解析的模块不能启动，且没有副作用
    assert!(matches!(
        modules.start(id),
        Err(CoreError::IllegalState { operation: "start", .. })
    ));
    assert_eq!(h.kinds(id), vec![ModuleEventKind::Installed]);

    modules.resolve(id).unwrap();
    modules.start(id).unwrap();
    assert_eq!(modules.state(id).unwrap(), ModuleState::Active);
    assert_eq!(h.framework.services().registered_services(id).len(), 1);

    // 重复启动无副作用
    modules.start(id).unwrap();

    modules.stop(id).unwrap();
    assert_eq!(modules.state(id).unwrap(), ModuleState::Resolved);
    assert!(h.framework.services().registered_services(id).is_empty());

    h.framework.uninstall(id).unwrap();
    assert!(matches!(h.framework.module(id), Err(CoreError::ModuleNotFound(m)) if m == id));

    assert_eq!(
        h.kinds(id),
        vec![
            ModuleEventKind::Installed,
            ModuleEventKind::Resolved,
            ModuleEventKind::Starting,
            ModuleEventKind::Started,
            ModuleEventKind::Stopping,
            ModuleEventKind::Stopped,
            ModuleEventKind::Unresolved,
            ModuleEventKind::Uninstalled,
        ]
    );

    let tombstone = modules.tombstone(id).unwrap();
    assert_eq!(tombstone.symbolic_name, "greeter");
    assert_eq!(tombstone.location, "mem:greeter");

    // 重新安装得到新的 ID
    let again = h.framework.install("mem:greeter").unwrap();
    assert!(again > id);
}

#[test]
fn test_stale_context_rejected_after_stop() {
    let h = Harness::new();
    h.add("mem:greeter", manifest("greeter", "1.0.0", &[]), Behavior::Publish);
    let id = h.framework.install("mem:greeter").unwrap();
    h.framework.start(id).unwrap();

    let context = h.kept.lock().clone().unwrap();
    assert!(context.is_valid());
    assert_eq!(h.framework.modules().context(id).unwrap().module_id(), id);

    h.framework.stop(id).unwrap();
    assert!(!context.is_valid());
    assert!(matches!(
        context.register_service(
            &["Greeter"],
            ServiceObject::single("Greeter", String::new()),
            PropertyDictionary::new()
        ),
        Err(CoreError::ContextInvalid(m)) if m == id
    ));
    assert!(h.framework.modules().context(id).is_none());
}

#[test]
fn test_stop_during_registration_leaves_nothing_behind() {
    let h = Harness::new();
    h.add("mem:greeter", manifest("greeter", "1.0.0", &[]), Behavior::Publish);
    let id = h.framework.install("mem:greeter").unwrap();
    h.framework.start(id).unwrap();
    let context = h.kept.lock().clone().unwrap();

    // 另一方在 Extra 服务注册事件中停止该模块
    let modules = h.framework.modules().clone();
    h.framework
        .add_service_listener(Some("(objectClass=Extra)"), move |e| {
            if e.kind == ServiceEventKind::Registered {
                modules.stop(id).unwrap();
            }
        })
        .unwrap();

    let result = context.register_service(
        &["Extra"],
        ServiceObject::single("Extra", 1u8),
        PropertyDictionary::new(),
    );
    assert!(matches!(result, Err(CoreError::ContextInvalid(m)) if m == id));
    assert_eq!(h.framework.modules().state(id).unwrap(), ModuleState::Resolved);
    assert!(h.framework.services().registered_services(id).is_empty());
    assert!(h.framework.services().get_service_reference("Extra").is_none());

    // 已失效的上下文也不能再登记监听器
    assert!(matches!(
        context.add_module_listener(|_| {}),
        Err(CoreError::ContextInvalid(_))
    ));
    assert!(h.framework.dispatcher().listeners_of(id).is_empty());
}

// ============================================================================
// 激活失败
// ============================================================================

#[test]
fn test_failed_start_rolls_back_and_cleans_up() {
    let h = Harness::new();
    h.add("mem:broken", manifest("broken", "1.0.0", &[]), Behavior::FailAfterPublish);
    let id = h.framework.install("mem:broken").unwrap();
    let (_, module_listeners_before) = h.framework.dispatcher().listener_count();

    let err = h.framework.start(id).unwrap_err();
    match err {
        CoreError::ActivationFailed { module, reason } => {
            assert_eq!(module, "broken");
            assert!(reason.contains("配置缺失"));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(h.framework.module(id).unwrap().state, ModuleState::Resolved);
    assert!(h.framework.services().get_service_reference("Greeter").is_none());
    assert_eq!(h.framework.dispatcher().listener_count().1, module_listeners_before);
    assert!(!h.kept.lock().as_ref().unwrap().is_valid());
    assert_eq!(
        h.kinds(id),
        vec![
            ModuleEventKind::Installed,
            ModuleEventKind::Resolved,
            ModuleEventKind::Starting,
            ModuleEventKind::Stopped,
        ]
    );
}

#[test]
fn test_panicking_activator_reported() {
    let h = Harness::new();
    h.add("mem:panic", manifest("panicky", "1.0.0", &[]), Behavior::Panic);
    let id = h.framework.install("mem:panic").unwrap();

    let err = h.framework.start(id).unwrap_err();
    assert!(matches!(&err, CoreError::ActivationFailed { reason, .. } if reason.contains("activator boom")));
    assert_eq!(err.error_code(), chips_runtime::error_code::MODULE_ACTIVATION_FAILED);
    assert_eq!(h.framework.module(id).unwrap().state, ModuleState::Resolved);
}

#[test]
fn test_failing_stop_still_cleans_up() {
    let h = Harness::new();
    h.add("mem:sticky", manifest("sticky", "1.0.0", &[]), Behavior::FailOnStop);
    let id = h.framework.install("mem:sticky").unwrap();
    h.framework.start(id).unwrap();

    assert!(matches!(h.framework.stop(id), Err(CoreError::ActivationFailed { .. })));
    assert_eq!(h.framework.module(id).unwrap().state, ModuleState::Resolved);
    assert!(h.framework.services().registered_services(id).is_empty());
}

#[test]
fn test_missing_manifest_fields_rejected() {
    let h = Harness::new();
    h.loader
        .add("mem:nameless", PropertyDictionary::new().with(MODULE_VERSION, "1.0.0"));
    h.loader.add(
        "mem:badversion",
        PropertyDictionary::new()
            .with(MODULE_SYMBOLIC_NAME, "bad")
            .with(MODULE_VERSION, "one"),
    );

    assert!(matches!(h.framework.install("mem:nameless"), Err(CoreError::Manifest { .. })));
    assert!(matches!(h.framework.install("mem:badversion"), Err(CoreError::Manifest { .. })));
    assert!(matches!(h.framework.install("mem:absent"), Err(CoreError::Load(_))));
    assert!(h.framework.installed_modules().is_empty());
}

// ============================================================================
// 依赖
// ============================================================================

#[test]
fn test_unresolved_dependency_recoverable() {
    let h = Harness::new();
    h.loader.add("mem:app", manifest("app", "1.0.0", &["base >=2.0"]));
    h.loader.add("mem:base-1", manifest("base", "1.4.0", &[]));
    h.loader.add("mem:base-2", manifest("base", "2.1.0", &[]));

    let app = h.framework.install("mem:app").unwrap();
    h.framework.install("mem:base-1").unwrap();

    let err = h.framework.resolve(app).unwrap_err();
    match &err {
        CoreError::UnresolvedDependency { module, missing } => {
            assert_eq!(module, "app");
            assert_eq!(missing.len(), 1);
            assert!(missing[0].starts_with("base"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_recoverable());
    assert_eq!(h.framework.module(app).unwrap().state, ModuleState::Installed);

    let base = h.framework.install("mem:base-2").unwrap();
    h.framework.resolve(app).unwrap();
    assert_eq!(h.framework.modules().dependencies(app), vec![base]);
    assert_eq!(h.framework.modules().dependents(base), vec![app]);
    assert_eq!(h.framework.module(base).unwrap().state, ModuleState::Resolved);
}

#[test]
fn test_circular_dependency_rejected() {
    let h = Harness::new();
    h.loader.add("mem:a", manifest("a", "1.0.0", &["b"]));
    h.loader.add("mem:b", manifest("b", "1.0.0", &["a"]));
    let a = h.framework.install("mem:a").unwrap();
    let b = h.framework.install("mem:b").unwrap();

    assert!(matches!(h.framework.resolve(a), Err(CoreError::CircularDependency(_))));
    assert_eq!(h.framework.module(a).unwrap().state, ModuleState::Installed);
    assert_eq!(h.framework.module(b).unwrap().state, ModuleState::Installed);
}

#[test]
fn test_modules_cooperate_through_services() {
    let h = Harness::new();
    h.add("mem:provider", manifest("provider", "1.0.0", &[]), Behavior::Publish);
    h.add(
        "mem:consumer",
        manifest("consumer", "1.0.0", &["provider ^1"]),
        Behavior::Consume,
    );

    let consumer = h.framework.install("mem:consumer").unwrap();
    let provider = h.framework.install("mem:provider").unwrap();
    assert_eq!(h.framework.start_all(), vec![provider, consumer]);

    let services = h.framework.services();
    let greeter = services.get_service_reference("Greeter").unwrap();
    assert_eq!(greeter.owner().unwrap(), provider);
    assert_eq!(greeter.using_modules(), vec![consumer]);
    assert_eq!(services.services_in_use(consumer), vec![greeter.clone()]);

    // 消费方停止后释放使用
    h.framework.stop(consumer).unwrap();
    assert!(greeter.using_modules().is_empty());

    // 关闭按启动逆序停止
    h.framework.start(consumer).unwrap();
    h.events.lock().clear();
    h.framework.shutdown();
    let stops: Vec<ModuleId> = h
        .events
        .lock()
        .iter()
        .filter(|(_, k)| *k == ModuleEventKind::Stopping)
        .map(|(m, _)| *m)
        .collect();
    assert_eq!(stops, vec![consumer, provider]);
    assert!(h.framework.installed_modules().is_empty());
}

// ============================================================================
// 随机操作序列
// ============================================================================

fn state_after(kind: ModuleEventKind) -> Option<ModuleState> {
    match kind {
        ModuleEventKind::Installed => Some(ModuleState::Installed),
        ModuleEventKind::Resolved => Some(ModuleState::Resolved),
        ModuleEventKind::Starting => Some(ModuleState::Starting),
        ModuleEventKind::Started => Some(ModuleState::Active),
        ModuleEventKind::Stopping => Some(ModuleState::Stopping),
        ModuleEventKind::Stopped => Some(ModuleState::Resolved),
        ModuleEventKind::Unresolved => None,
        ModuleEventKind::Uninstalled => Some(ModuleState::Uninstalled),
    }
}

proptest! {
    #[test]
    fn test_random_operations_follow_state_machine(
        ops in proptest::collection::vec(0u8..6, 1..40),
        failing in any::<bool>(),
    ) {
        let h = Harness::new();
        let behavior = if failing { Behavior::FailAfterPublish } else { Behavior::Publish };
        h.add("mem:subject", manifest("subject", "1.0.0", &[]), behavior);
        let modules = h.framework.modules();

        let mut id = h.framework.install("mem:subject").unwrap();
        for op in ops {
            let before = h.events.lock().len();
            let before_state = modules.state(id).ok();
            let result = match op {
                0 => modules.resolve(id),
                1 => modules.start(id),
                2 => modules.stop(id),
                3 => modules.uninstall(id),
                4 => h.framework.install("mem:subject").map(|new| { id = new; }),
                _ => modules.start(id),
            };

            // 失败的 start 只允许在 Resolved 上产生回滚事件
            if let Err(CoreError::IllegalState { .. }) | Err(CoreError::ModuleNotFound(_)) = result {
                prop_assert_eq!(h.events.lock().len(), before);
                prop_assert_eq!(modules.state(id).ok(), before_state);
            }
        }

        let events = h.events.lock().clone();
        let mut current: std::collections::HashMap<ModuleId, ModuleState> = Default::default();
        for (module, kind) in events {
            let Some(next) = state_after(kind) else { continue };
            match current.get(&module) {
                None => prop_assert_eq!(next, ModuleState::Installed),
                Some(prev) => prop_assert!(
                    can_transition(*prev, next),
                    "{} 非法迁移 {:?} -> {:?}", module, prev, next
                ),
            }
            current.insert(module, next);
        }
        if let Ok(state) = modules.state(id) {
            prop_assert_eq!(current.get(&id).copied(), Some(state));
        }
    }
}
