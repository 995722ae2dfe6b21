//! # 服务注册表集成测试
//!
//! 测试服务注册表与事件分发器协同工作的完整流程，包括：
//! - 排序权重与注册顺序决定的查找顺序
//! - 结束匹配事件的合成
//! - 注销事件期间服务仍可获取
//! - 监听器 panic 隔离
//! - objectClass 接口短路
//! - 多线程并发注册、注销与查询

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use chips_runtime::filter::Filter;
use chips_runtime::service::properties::SERVICE_RANKING;
use chips_runtime::{
    CoreError, DispatchConfig, EventDispatcher, ModuleId, PropertyDictionary, ServiceEvent,
    ServiceEventKind, ServiceObject, ServiceRegistry,
};
use parking_lot::Mutex;

// ============================================================================
// 测试辅助
// ============================================================================

const PUBLISHER: ModuleId = ModuleId::new(1);
const CONSUMER: ModuleId = ModuleId::new(2);

fn setup() -> (Arc<EventDispatcher>, ServiceRegistry) {
    let dispatcher = Arc::new(EventDispatcher::new(DispatchConfig::default()));
    let registry = ServiceRegistry::new(Arc::clone(&dispatcher));
    (dispatcher, registry)
}

fn recorder() -> (Arc<Mutex<Vec<ServiceEventKind>>>, Arc<dyn Fn(&ServiceEvent) + Send + Sync>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: Arc<dyn Fn(&ServiceEvent) + Send + Sync> = Arc::new(move |e: &ServiceEvent| {
        sink.lock().push(e.kind);
    });
    (seen, callback)
}

fn foo(tag: &str) -> ServiceObject {
    ServiceObject::single("Foo", tag.to_string())
}

// ============================================================================
// 查找顺序
// ============================================================================

#[test]
fn test_ranking_then_registration_order() {
    let (_, registry) = setup();

    let a = registry
        .register(PUBLISHER, &["Foo"], foo("A"), PropertyDictionary::new().with(SERVICE_RANKING, 5))
        .unwrap();
    let c = registry
        .register(PUBLISHER, &["Foo"], foo("C"), PropertyDictionary::new().with(SERVICE_RANKING, 10))
        .unwrap();
    let b = registry
        .register(PUBLISHER, &["Foo"], foo("B"), PropertyDictionary::new().with(SERVICE_RANKING, 10))
        .unwrap();

    // 权重相同时先注册者优先
    let best = registry.get_service_reference("Foo").unwrap();
    assert_eq!(best, c.reference());

    let all = registry.get_service_references(Some("Foo"), None);
    assert_eq!(all, vec![c.reference(), b.reference(), a.reference()]);

    // 注销最佳者后次优者接替
    c.unregister().unwrap();
    assert_eq!(registry.get_service_reference("Foo").unwrap(), b.reference());
}

#[test]
fn test_filtered_and_all_service_lookup() {
    let (_, registry) = setup();
    registry
        .register(
            PUBLISHER,
            &["Foo"],
            foo("en"),
            PropertyDictionary::new().with("lang", "en").with(SERVICE_RANKING, 1),
        )
        .unwrap();
    let bar = registry
        .register(
            PUBLISHER,
            &["Bar"],
            ServiceObject::single("Bar", 7u32),
            PropertyDictionary::new().with("lang", "de"),
        )
        .unwrap();

    let german = Filter::parse("(lang=de)").unwrap();
    assert_eq!(registry.get_service_references(None, Some(&german)), vec![bar.reference()]);
    assert!(registry.get_service_references(Some("Foo"), Some(&german)).is_empty());
    assert_eq!(registry.get_service_references(None, None).len(), 2);

    let wildcard = Filter::parse("(objectClass=B*)").unwrap();
    assert_eq!(registry.get_service_references(None, Some(&wildcard)), vec![bar.reference()]);
}

// ============================================================================
// 结束匹配
// ============================================================================

#[test]
fn test_end_match_delivered_once() {
    let (dispatcher, registry) = setup();
    let (seen, callback) = recorder();
    dispatcher
        .add_service_listener(CONSUMER, Some("(state=active)"), callback)
        .unwrap();

    let registration = registry
        .register(PUBLISHER, &["Foo"], foo("x"), PropertyDictionary::new().with("state", "active"))
        .unwrap();
    assert_eq!(*seen.lock(), vec![ServiceEventKind::Registered]);

    registration
        .set_properties(PropertyDictionary::new().with("state", "inactive"))
        .unwrap();
    registration
        .set_properties(PropertyDictionary::new().with("state", "inactive").with("extra", 1))
        .unwrap();
    assert_eq!(
        *seen.lock(),
        vec![ServiceEventKind::Registered, ServiceEventKind::ModifiedEndMatch]
    );

    // 再次匹配后恢复正常投递
    registration
        .set_properties(PropertyDictionary::new().with("state", "active"))
        .unwrap();
    registration.unregister().unwrap();
    assert_eq!(
        *seen.lock(),
        vec![
            ServiceEventKind::Registered,
            ServiceEventKind::ModifiedEndMatch,
            ServiceEventKind::Modified,
            ServiceEventKind::Unregistering,
        ]
    );
    assert_eq!(dispatcher.stats().end_matches, 1);
}

#[test]
fn test_unmatched_unregistering_not_delivered() {
    let (dispatcher, registry) = setup();
    let (seen, callback) = recorder();
    dispatcher
        .add_service_listener(CONSUMER, Some("(state=active)"), callback)
        .unwrap();

    let registration = registry
        .register(PUBLISHER, &["Foo"], foo("x"), PropertyDictionary::new().with("state", "idle"))
        .unwrap();
    registration.unregister().unwrap();
    assert!(seen.lock().is_empty());
}

// ============================================================================
// 注销
// ============================================================================

#[test]
fn test_get_service_during_unregistering() {
    let (dispatcher, registry) = setup();
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&outcomes);
    let lookup = registry.clone();
    dispatcher
        .add_service_listener(
            CONSUMER,
            Some("(ranking>=1)"),
            Arc::new(move |e: &ServiceEvent| {
                let ok = lookup.get_service(CONSUMER, &e.reference).is_ok();
                let ranking = e.reference.property("ranking");
                sink.lock().push((e.kind, ok, ranking.is_some()));
            }),
        )
        .unwrap();

    let registration = registry
        .register(PUBLISHER, &["Foo"], foo("x"), PropertyDictionary::new().with("ranking", 1))
        .unwrap();
    let reference = registration.reference();
    registration.unregister().unwrap();

    assert_eq!(
        *outcomes.lock(),
        vec![
            (ServiceEventKind::Registered, true, true),
            (ServiceEventKind::Unregistering, true, true),
        ]
    );
    assert!(matches!(
        registry.get_service(CONSUMER, &reference),
        Err(CoreError::ServiceUnregistered(id)) if id == reference.id()
    ));

    // 重复注销无副作用
    registration.unregister().unwrap();
    assert_eq!(outcomes.lock().len(), 2);
}

#[test]
fn test_only_owner_may_mutate() {
    let (_, registry) = setup();
    let registration = registry
        .register(PUBLISHER, &["Foo"], foo("x"), PropertyDictionary::new())
        .unwrap();

    assert!(matches!(
        registry.unregister(CONSUMER, registration.id()),
        Err(CoreError::PermissionDenied(_))
    ));
    assert!(matches!(
        registry.update_properties(CONSUMER, registration.id(), PropertyDictionary::new()),
        Err(CoreError::PermissionDenied(_))
    ));
    assert!(registration.reference().is_live());
}

#[test]
fn test_invalid_registrations_rejected() {
    let (_, registry) = setup();
    assert!(matches!(
        registry.register(PUBLISHER, &[], foo("x"), PropertyDictionary::new()),
        Err(CoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        registry.register(PUBLISHER, &["Bar"], foo("x"), PropertyDictionary::new()),
        Err(CoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        registry.get_service(CONSUMER, &Default::default()),
        Err(CoreError::InvalidArgument(_))
    ));
}

// ============================================================================
// 监听器隔离
// ============================================================================

#[test]
fn test_panicking_listener_isolated() {
    let (dispatcher, registry) = setup();
    dispatcher
        .add_service_listener(CONSUMER, None, Arc::new(|_: &ServiceEvent| panic!("listener boom")))
        .unwrap();
    let (seen, callback) = recorder();
    dispatcher.add_service_listener(CONSUMER, None, callback).unwrap();

    registry
        .register(PUBLISHER, &["Foo"], foo("x"), PropertyDictionary::new())
        .unwrap();

    assert_eq!(*seen.lock(), vec![ServiceEventKind::Registered]);
    let stats = dispatcher.stats();
    assert_eq!(stats.listener_failures, 1);
    assert_eq!(stats.delivered, 1);
}

#[test]
fn test_panic_on_unregistering_still_removes_service() {
    let (dispatcher, registry) = setup();
    dispatcher
        .add_service_listener(
            CONSUMER,
            None,
            Arc::new(|e: &ServiceEvent| {
                if e.kind == ServiceEventKind::Unregistering {
                    panic!("listener boom on unregistering");
                }
            }),
        )
        .unwrap();
    let (seen, callback) = recorder();
    dispatcher.add_service_listener(CONSUMER, None, callback).unwrap();

    let registration = registry
        .register(PUBLISHER, &["Foo"], foo("x"), PropertyDictionary::new())
        .unwrap();
    registration.unregister().unwrap();

    // 后续监听器照常收到事件，注册被完整移除
    assert_eq!(
        *seen.lock(),
        vec![ServiceEventKind::Registered, ServiceEventKind::Unregistering]
    );
    assert!(registry.is_empty());
    assert!(registry.get_service_reference("Foo").is_none());
    assert!(matches!(
        registry.get_service(CONSUMER, &registration.reference()),
        Err(CoreError::ServiceUnregistered(_))
    ));
    registration.unregister().unwrap();
    assert_eq!(dispatcher.stats().listener_failures, 1);
}

#[test]
fn test_listener_removing_itself() {
    let (dispatcher, registry) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let id_slot = Arc::new(Mutex::new(None));

    let counter = Arc::clone(&calls);
    let slot = Arc::clone(&id_slot);
    let remover = Arc::clone(&dispatcher);
    let id = dispatcher
        .add_service_listener(
            CONSUMER,
            None,
            Arc::new(move |_: &ServiceEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *slot.lock() {
                    remover.remove_listener(CONSUMER, id).unwrap();
                }
            }),
        )
        .unwrap();
    *id_slot.lock() = Some(id);

    registry.register(PUBLISHER, &["Foo"], foo("a"), PropertyDictionary::new()).unwrap();
    registry.register(PUBLISHER, &["Foo"], foo("b"), PropertyDictionary::new()).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.listener_count(), (0, 0));
}

// ============================================================================
// 接口短路
// ============================================================================

#[test]
fn test_single_class_listener_short_circuits_disjoint_registrations() {
    let (dispatcher, registry) = setup();
    let (seen, callback) = recorder();
    dispatcher
        .add_service_listener(CONSUMER, Some("(objectClass=B)"), callback)
        .unwrap();

    registry
        .register(PUBLISHER, &["A"], ServiceObject::single("A", 1u8), PropertyDictionary::new())
        .unwrap();
    assert!(seen.lock().is_empty());
    assert_eq!(dispatcher.stats().short_circuited, 1);

    // 多接口注册只要包含 B 就必须投递
    let both = ServiceObject::single("A", 2u8).with_interface("B", 3u8);
    let registration = registry
        .register(PUBLISHER, &["A", "B"], both, PropertyDictionary::new())
        .unwrap();
    registration.unregister().unwrap();

    assert_eq!(
        *seen.lock(),
        vec![ServiceEventKind::Registered, ServiceEventKind::Unregistering]
    );
    let stats = dispatcher.stats();
    assert_eq!(stats.short_circuited, 1);
    assert_eq!(stats.delivered, 2);
}

#[test]
fn test_or_of_classes_never_short_circuited() {
    let (dispatcher, registry) = setup();
    let (seen, callback) = recorder();
    dispatcher
        .add_service_listener(CONSUMER, Some("(|(objectClass=A)(objectClass=B))"), callback)
        .unwrap();

    registry
        .register(PUBLISHER, &["A"], ServiceObject::single("A", 1u8), PropertyDictionary::new())
        .unwrap();
    registry
        .register(PUBLISHER, &["B"], ServiceObject::single("B", 2u8), PropertyDictionary::new())
        .unwrap();
    registry
        .register(PUBLISHER, &["C"], ServiceObject::single("C", 3u8), PropertyDictionary::new())
        .unwrap();

    assert_eq!(
        *seen.lock(),
        vec![ServiceEventKind::Registered, ServiceEventKind::Registered]
    );
    assert_eq!(dispatcher.stats().short_circuited, 0);
}

#[test]
fn test_end_match_on_multi_interface_registration() {
    let (dispatcher, registry) = setup();
    let (seen, callback) = recorder();
    dispatcher
        .add_service_listener(CONSUMER, Some("(&(objectClass=B)(level=high))"), callback)
        .unwrap();

    let object = ServiceObject::single("A", 1u8).with_interface("B", 2u8);
    let registration = registry
        .register(PUBLISHER, &["A", "B"], object, PropertyDictionary::new().with("level", "high"))
        .unwrap();
    registration
        .set_properties(PropertyDictionary::new().with("level", "low"))
        .unwrap();

    assert_eq!(
        *seen.lock(),
        vec![ServiceEventKind::Registered, ServiceEventKind::ModifiedEndMatch]
    );
    let stats = dispatcher.stats();
    assert_eq!(stats.short_circuited, 0);
    assert_eq!(stats.end_matches, 1);
}

#[test]
fn test_short_circuit_can_be_disabled() {
    let dispatcher = Arc::new(EventDispatcher::new(DispatchConfig {
        object_class_short_circuit: false,
    }));
    let registry = ServiceRegistry::new(Arc::clone(&dispatcher));
    let (seen, callback) = recorder();
    dispatcher
        .add_service_listener(CONSUMER, Some("(objectClass=B)"), callback)
        .unwrap();

    registry
        .register(PUBLISHER, &["A"], ServiceObject::single("A", 1u8), PropertyDictionary::new())
        .unwrap();

    // 过滤器照常求值，结果相同但不计入短路
    assert!(seen.lock().is_empty());
    assert_eq!(dispatcher.stats().short_circuited, 0);
}

// ============================================================================
// 并发
// ============================================================================

#[test]
fn test_concurrent_register_unregister_and_query() {
    const WRITERS: u64 = 4;
    const PER_WRITER: usize = 50;
    const READERS: usize = 3;

    let (dispatcher, registry) = setup();
    let (seen, callback) = recorder();
    dispatcher
        .add_service_listener(CONSUMER, Some("(objectClass=Foo)"), callback)
        .unwrap();

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    for reference in registry.get_service_references(Some("Foo"), None) {
                        // 引用可能在读取途中被注销，此时只能得到 ServiceUnregistered
                        match registry.get_service(CONSUMER, &reference) {
                            Ok(object) => assert!(object.get::<String>("Foo").is_some()),
                            Err(e) => assert!(matches!(e, CoreError::ServiceUnregistered(_))),
                        }
                        let _ = registry.unget_service(CONSUMER, &reference);
                    }
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let registry = registry.clone();
            thread::spawn(move || {
                let owner = ModuleId::new(10 + w);
                let registrations: Vec<_> = (0..PER_WRITER)
                    .map(|i| {
                        registry
                            .register(owner, &["Foo"], foo(&format!("{w}-{i}")), PropertyDictionary::new())
                            .unwrap()
                    })
                    .collect();
                for registration in registrations.iter().step_by(2) {
                    registration.unregister().unwrap();
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    let remaining = registry.get_service_references(Some("Foo"), None);
    assert_eq!(remaining.len(), WRITERS as usize * PER_WRITER / 2);

    let events = seen.lock();
    let registered = events.iter().filter(|k| **k == ServiceEventKind::Registered).count();
    let unregistering = events.iter().filter(|k| **k == ServiceEventKind::Unregistering).count();
    assert_eq!(registered, WRITERS as usize * PER_WRITER);
    assert_eq!(unregistering, WRITERS as usize * PER_WRITER / 2);
}
