//! 基本使用示例
//!
//! 本示例展示了薯片模块运行时的基本使用方法，包括：
//!
//! - 用内存加载器登记模块与激活器
//! - 安装、解析并按依赖顺序启动模块
//! - 模块之间通过服务协作
//! - 带过滤器的服务监听器与结束匹配事件
//! - 关闭运行时
//!
//! # 运行示例
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use chips_runtime::module::metadata::{
    MODULE_ACTIVATOR, MODULE_REQUIRES, MODULE_SYMBOLIC_NAME, MODULE_VERSION,
};
use chips_runtime::{
    Activator, CoreConfig, Framework, ModuleContext, PropertyDictionary, ServiceObject,
    StaticLoader, Value,
};

/// 问候服务
struct Greeter {
    greeting: String,
}

impl Greeter {
    fn greet(&self, name: &str) -> String {
        format!("{}, {}!", self.greeting, name)
    }
}

/// 发布问候服务的激活器
struct GreeterActivator;

impl Activator for GreeterActivator {
    fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
        for (lang, greeting, ranking) in [("en", "Hello", 10), ("de", "Hallo", 5)] {
            context.register_service(
                &["Greeter"],
                ServiceObject::single(
                    "Greeter",
                    Greeter {
                        greeting: greeting.to_string(),
                    },
                ),
                PropertyDictionary::new()
                    .with("lang", lang)
                    .with("service.ranking", ranking),
            )?;
        }
        Ok(())
    }

    fn stop(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        println!("   [greeter] 停止，服务将被自动注销");
        Ok(())
    }
}

/// 使用问候服务的激活器
struct ClientActivator;

impl Activator for ClientActivator {
    fn start(&self, context: &ModuleContext) -> anyhow::Result<()> {
        for reference in context.get_service_references(Some("Greeter"), None)? {
            let object = context.get_service(&reference)?;
            if let Some(greeter) = object.get::<Greeter>("Greeter") {
                println!(
                    "   [client] {} (ranking={})",
                    greeter.greet("Chips"),
                    reference.ranking()
                );
            }
        }
        Ok(())
    }

    fn stop(&self, _context: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 主函数
///
/// 演示薯片模块运行时的基本用法。
fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== 薯片模块运行时基本使用示例 ===\n");

    // -------------------------------------------------------------------------
    // 1. 登记模块
    // -------------------------------------------------------------------------
    println!("1. 登记模块...");

    let loader = StaticLoader::new();
    loader.add_with_activator(
        "mem:greeter",
        PropertyDictionary::new()
            .with(MODULE_SYMBOLIC_NAME, "com.example.greeter")
            .with(MODULE_VERSION, "1.0.0")
            .with(MODULE_ACTIVATOR, "greeter"),
        || Arc::new(GreeterActivator) as Arc<dyn Activator>,
    );
    loader.add_with_activator(
        "mem:client",
        PropertyDictionary::new()
            .with(MODULE_SYMBOLIC_NAME, "com.example.client")
            .with(MODULE_VERSION, "0.1.0")
            .with(MODULE_ACTIVATOR, "client")
            .with(
                MODULE_REQUIRES,
                Value::StringList(vec!["com.example.greeter ^1".to_string()]),
            ),
        || Arc::new(ClientActivator) as Arc<dyn Activator>,
    );
    println!("   ✅ 已登记 2 个模块\n");

    // -------------------------------------------------------------------------
    // 2. 创建框架并添加监听器
    // -------------------------------------------------------------------------
    println!("2. 创建框架...");

    let framework = Framework::new(CoreConfig::default(), Arc::new(loader));
    framework.add_module_listener(|event| {
        println!("   [event] {} {}", event.kind, event.symbolic_name);
    })?;
    framework.add_service_listener(Some("(lang=de)"), |event| {
        println!("   [de-listener] {} {}", event.kind, event.reference);
    })?;
    println!("   ✅ 框架创建成功\n");

    // -------------------------------------------------------------------------
    // 3. 安装并启动
    // -------------------------------------------------------------------------
    println!("3. 安装并启动模块...");

    let client = framework.install("mem:client")?;
    framework.install("mem:greeter")?;
    let started = framework.start_all();
    println!("   ✅ 已启动 {} 个模块\n", started.len());

    // -------------------------------------------------------------------------
    // 4. 查找服务
    // -------------------------------------------------------------------------
    println!("4. 查找服务...");

    let context = framework.system_context();
    if let Some(best) = context.get_service_reference("Greeter")? {
        println!("   最佳服务: {} lang={:?}", best, best.property("lang"));
    }
    let german = context.get_service_references(Some("Greeter"), Some("(lang=de)"))?;
    println!("   德语服务: {:?}\n", german);

    // -------------------------------------------------------------------------
    // 5. 统计与关闭
    // -------------------------------------------------------------------------
    println!("5. 停止客户端并关闭...");

    framework.stop(client)?;
    let stats = framework.stats();
    println!("   统计: {}", serde_json::to_string_pretty(&stats)?);

    framework.shutdown();
    println!("\n=== 示例结束 ===");
    Ok(())
}
