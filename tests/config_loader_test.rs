//! # 配置与目录加载集成测试
//!
//! 测试从磁盘启动运行时的完整流程：
//! - YAML / JSON 配置文件加载与合并
//! - 目录加载器发现并安装 module.yaml 描述的模块
//! - 配置中的自启动模块
//! - 基于 data_dir 的文件存储在两个框架实例之间恢复模块

use std::path::Path;
use std::sync::Arc;

use chips_runtime::module::{ModuleParser, MANIFEST_FILE};
use chips_runtime::{
    Activator, ActivatorTable, CoreConfig, CoreError, DirectoryLoader, Framework, ModuleContext,
    ModuleState, PropertyDictionary, ServiceObject,
};
use tempfile::TempDir;

// ============================================================================
// 测试辅助
// ============================================================================

struct Clock;

impl Activator for Clock {
    fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
        context.register_service(
            &["Clock"],
            ServiceObject::single("Clock", 0u64),
            PropertyDictionary::new().with("precision", "ms"),
        )?;
        Ok(())
    }

    fn stop(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

fn write_module(root: &Path, dir: &str, yaml: &str) {
    let path = root.join(dir);
    std::fs::create_dir_all(&path).unwrap();
    std::fs::write(path.join(MANIFEST_FILE), yaml).unwrap();
}

fn module_tree() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_module(
        dir.path(),
        "clock",
        r#"
symbolic_name: com.acme.clock
version: 1.2.0
name: Clock
activator: clock
properties:
  vendor: acme
"#,
    );
    write_module(
        dir.path(),
        "report",
        r#"
symbolic_name: com.acme.report
version: 0.3.0
requires:
  - name: com.acme.clock
    version: ">=1.0"
"#,
    );
    // 没有描述文件的目录会被忽略
    std::fs::create_dir_all(dir.path().join("scratch")).unwrap();
    dir
}

fn directory_loader() -> DirectoryLoader {
    let activators = ActivatorTable::new();
    activators.register("clock", || Arc::new(Clock) as Arc<dyn Activator>);
    DirectoryLoader::new(activators)
}

// ============================================================================
// 配置文件
// ============================================================================

#[tokio::test]
async fn test_yaml_config_loading() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    tokio::fs::write(
        &path,
        r#"
logging:
  level: debug
  json_format: true
modules:
  module_dirs:
    - ./modules
  auto_start:
    - com.acme.clock
dispatch:
  object_class_short_circuit: false
dev_mode: true
"#,
    )
    .await
    .unwrap();

    let config = CoreConfig::from_file(&path).await.unwrap();
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json_format);
    assert_eq!(config.logging.rotation, "daily");
    assert_eq!(config.modules.auto_start, vec!["com.acme.clock".to_string()]);
    assert!(!config.dispatch.object_class_short_circuit);
    assert!(config.dev_mode);
    assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
}

#[test]
fn test_json_config_and_merge() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{ "modules": { "module_dirs": ["/opt/modules"] }, "data_dir": "/var/lib/chips" }"#,
    )
    .unwrap();

    let overlay = CoreConfig::from_file_sync(&path).unwrap();
    let mut base = CoreConfig::builder()
        .module_dir("/usr/share/modules")
        .auto_start("com.acme.clock")
        .build();
    base.merge(overlay);

    assert_eq!(base.modules.module_dirs.len(), 2);
    assert_eq!(base.modules.auto_start, vec!["com.acme.clock".to_string()]);
    assert_eq!(base.data_dir.as_deref(), Some(Path::new("/var/lib/chips")));
    assert_eq!(base.logging.level, "info");
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.yaml");
    tokio::fs::write(&path, "modules: [not, a, map]").await.unwrap();
    assert!(matches!(CoreConfig::from_file(&path).await, Err(CoreError::Yaml(_))));

    let missing = dir.path().join("absent.yaml");
    assert!(matches!(
        CoreConfig::from_file(&missing).await,
        Err(CoreError::ConfigLoadFailed(_))
    ));
}

// ============================================================================
// 目录加载
// ============================================================================

#[tokio::test]
async fn test_parse_module_file() {
    let tree = module_tree();
    let descriptor = ModuleParser::parse_file(&tree.path().join("report").join(MANIFEST_FILE))
        .await
        .unwrap();
    assert_eq!(descriptor.symbolic_name, "com.acme.report");
    assert_eq!(descriptor.requires[0].version.as_deref(), Some(">=1.0"));
}

#[test]
fn test_discover_install_and_auto_start() {
    let tree = module_tree();
    let config = CoreConfig::builder()
        .module_dir(tree.path())
        .auto_start("com.acme.report")
        .build();
    let framework = Framework::builder()
        .config(config)
        .loader(Arc::new(directory_loader()))
        .build()
        .unwrap();

    let installed = framework.install_configured();
    assert_eq!(installed.len(), 2);

    // 只启动自启动列表中的模块；其依赖被解析但不启动
    let started = framework.start_configured();
    assert_eq!(started.len(), 1);
    let report = framework.module(started[0]).unwrap();
    assert_eq!(report.symbolic_name(), "com.acme.report");
    assert_eq!(report.version().to_string(), "0.3.0");

    let clock = framework.modules().find("com.acme.clock");
    assert_eq!(clock.len(), 1);
    assert_eq!(clock[0].state, ModuleState::Resolved);
    assert_eq!(clock[0].manifest.headers.get_str("vendor"), Some("acme"));

    framework.start(clock[0].id).unwrap();
    let reference = framework
        .system_context()
        .get_service_references(Some("Clock"), Some("(precision=ms)"))
        .unwrap();
    assert_eq!(reference.len(), 1);
}

#[test]
fn test_missing_directory_reports_load_error() {
    let tree = module_tree();
    let framework = Framework::new(CoreConfig::default(), Arc::new(directory_loader()));

    let absent = tree.path().join("absent");
    assert!(matches!(
        framework.install(&absent.to_string_lossy()),
        Err(CoreError::Load(_))
    ));

    let scratch = tree.path().join("scratch");
    assert!(matches!(
        framework.install(&scratch.to_string_lossy()),
        Err(CoreError::Manifest { .. })
    ));
}

// ============================================================================
// 持久化恢复
// ============================================================================

#[test]
fn test_restore_across_framework_instances() {
    let tree = module_tree();
    let data = TempDir::new().unwrap();
    let config = CoreConfig::builder()
        .module_dir(tree.path())
        .data_dir(data.path())
        .build();

    {
        let framework = Framework::builder()
            .config(config.clone())
            .loader(Arc::new(directory_loader()))
            .build()
            .unwrap();
        framework.install_configured();
        let clock = framework.modules().find("com.acme.clock")[0].id;
        framework.start(clock).unwrap();
        framework.shutdown();
    }

    let framework = Framework::builder()
        .config(config)
        .loader(Arc::new(directory_loader()))
        .build()
        .unwrap();
    let restored = framework.restore().unwrap();
    assert_eq!(restored.len(), 2);

    let clock = &framework.modules().find("com.acme.clock")[0];
    let report = &framework.modules().find("com.acme.report")[0];
    assert_eq!(clock.state, ModuleState::Active);
    assert_eq!(report.state, ModuleState::Installed);
    assert!(framework.services().get_service_reference("Clock").is_some());
}
