//! Chips Runtime 命令行入口
//!
//! 薯片模块运行时的命令行工具，提供启动、检查和调试功能。
//!
//! # 命令概览
//!
//! - `start` - 安装配置目录下的模块，启动自启动模块，等待 Ctrl+C 后关闭
//! - `version` - 显示版本信息
//! - `check-config` - 验证配置文件
//! - `list-modules` - 列出模块目录下的模块描述
//! - `check-filter` - 解析过滤表达式并显示规范形式
//!
//! # 使用示例
//!
//! ```bash
//! # 启动运行时
//! chips-runtime start
//!
//! # 使用自定义配置文件启动
//! chips-runtime -c my-config.yaml start
//!
//! # 检查过滤表达式
//! chips-runtime check-filter "(&(objectClass=Greeter)(service.ranking>=10))"
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};

use chips_runtime::module::{DirectoryLoader, ModuleParser, MANIFEST_FILE};
use chips_runtime::{CoreConfig, Filter, Framework, Logger, LoggerConfig};

/// Chips Runtime - 薯片模块运行时
///
/// 进程内的模块与服务运行时，提供模块生命周期、服务注册表和事件分发。
#[derive(Parser)]
#[command(name = "chips-runtime")]
#[command(version, about = "薯片模块运行时", long_about = None)]
#[command(author = "Chips Team")]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// 日志级别 (trace, debug, info, warn, error)，覆盖配置文件
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// 开发模式（启用更详细的日志）
    #[arg(long, global = true)]
    dev: bool,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 启动运行时
    ///
    /// 安装 `module_dirs` 下的所有模块，启动 `auto_start` 列出的模块。
    /// 按 Ctrl+C 可优雅关闭。
    Start,

    /// 查看版本信息
    Version,

    /// 验证配置文件
    ///
    /// 检查配置文件是否有效，并显示解析后的配置内容。
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 列出模块目录下的模块
    ///
    /// 读取每个模块的描述文件，显示符号名、版本与依赖。
    ListModules {
        /// 模块目录（不指定则使用配置中的 module_dirs）
        #[arg(short, long)]
        dir: Vec<PathBuf>,
    },

    /// 检查过滤表达式
    CheckFilter {
        /// 过滤表达式，例如 `(objectClass=Greeter)`
        expr: String,
    },
}

/// 启动运行时
async fn run_start(config: CoreConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("启动薯片模块运行时...");

    let framework = Framework::builder()
        .config(config)
        .loader(std::sync::Arc::new(DirectoryLoader::default()))
        .build()?;

    let installed = framework.install_configured();
    let started = framework.start_configured();

    println!();
    println!("╔════════════════════════════════════════════════════════╗");
    println!("║        薯片模块运行时已启动 (Chips Runtime Started)    ║");
    println!("╠════════════════════════════════════════════════════════╣");
    println!("  版本:       {}", chips_runtime::VERSION);
    println!("  已安装模块: {}", installed.len());
    println!("  已启动模块: {}", started.len());
    println!();
    println!("  按 Ctrl+C 优雅关闭");
    println!("╚════════════════════════════════════════════════════════╝");
    println!();

    // 等待关闭信号
    signal::ctrl_c().await?;

    println!();
    info!("收到关闭信号，正在优雅关闭...");
    let stats = framework.stats();
    framework.shutdown();
    info!(
        delivered = stats.dispatch.delivered,
        listener_failures = stats.dispatch.listener_failures,
        "薯片模块运行时已关闭"
    );

    Ok(())
}

/// 检查配置文件
async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    if !path.exists() {
        println!("⚠️  警告: 配置文件不存在，将使用默认配置");
        println!();
        print_config(&CoreConfig::default());
        return Ok(());
    }

    match CoreConfig::from_file(path).await {
        Ok(config) => {
            println!("✅ 配置文件有效！");
            println!();
            print_config(&config);
            Ok(())
        }
        Err(e) => {
            println!("❌ 配置文件无效: {}", e);
            Err(Box::new(e))
        }
    }
}

fn print_config(config: &CoreConfig) {
    println!("配置内容:");
    println!("────────────────────────────────────────");
    println!("  [日志配置]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("    JSON 格式:      {}", if config.logging.json_format { "是" } else { "否" });
    println!("    轮转策略:       {}", config.logging.rotation);
    println!();
    println!("  [模块配置]");
    println!("    模块目录:       {:?}", config.modules.module_dirs);
    println!("    自启动模块:     {:?}", config.modules.auto_start);
    println!();
    println!("  [事件分发]");
    println!(
        "    接口短路:       {}",
        if config.dispatch.object_class_short_circuit { "是" } else { "否" }
    );
    println!();
    println!("  [其他]");
    println!("    开发模式:       {}", if config.dev_mode { "是" } else { "否" });
    if let Some(ref data_dir) = config.data_dir {
        println!("    数据目录:       {}", data_dir.display());
    }
    println!("────────────────────────────────────────");
}

/// 打印版本信息
fn print_version() {
    println!();
    println!("Chips Runtime - 薯片模块运行时");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", chips_runtime::VERSION);
    println!("  描述文件:         {}", MANIFEST_FILE);
    println!();
    println!("构建信息:");
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

/// 列出模块目录下的模块描述
async fn list_modules(dirs: &[PathBuf]) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("模块目录");
    println!("═══════════════════════════════════════");

    let found = DirectoryLoader::discover(dirs);
    if found.is_empty() {
        println!("  (未发现模块，检查目录: {:?})", dirs);
    }

    for path in found {
        match ModuleParser::parse_file(&path.join(MANIFEST_FILE)).await {
            Ok(descriptor) => {
                println!("  {} {}", descriptor.symbolic_name, descriptor.version);
                println!("    位置:   {}", path.display());
                if let Some(ref activator) = descriptor.activator {
                    println!("    激活器: {}", activator);
                }
                for require in &descriptor.requires {
                    println!(
                        "    依赖:   {} {}",
                        require.name,
                        require.version.as_deref().unwrap_or("*")
                    );
                }
            }
            Err(e) => {
                warn!(location = %path.display(), error = %e, "描述文件无效");
                println!("  ❌ {}: {}", path.display(), e);
            }
        }
    }
    println!("═══════════════════════════════════════");
    println!();
    Ok(())
}

/// 检查过滤表达式
fn check_filter(expr: &str) -> Result<(), Box<dyn std::error::Error>> {
    match Filter::parse(expr) {
        Ok(filter) => {
            println!("✅ 过滤表达式有效");
            println!("  规范形式: {}", filter);
            println!("  属性:     {:?}", filter.attributes());
            if let Some(class) = filter.required_object_class() {
                println!("  接口:     {}", class);
            }
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e);
            println!("  {}", e.filter());
            println!("  {}^", " ".repeat(e.offset()));
            Err(Box::new(e))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // 默认命令或 Start 命令：启动运行时
        Some(Commands::Start) | None => {
            let config = load_config(&cli.config, cli.dev).await?;
            let mut logger_config = LoggerConfig::from_log_config(&config.logging);
            if let Some(level) = cli.log_level {
                logger_config.level = level;
            }
            if config.dev_mode {
                logger_config.show_thread_ids = true;
                logger_config.show_file_line = true;
            }
            let _guard = Logger::try_init(logger_config);
            run_start(config).await?;
        }

        // 显示版本信息
        Some(Commands::Version) => {
            print_version();
        }

        // 检查配置文件
        Some(Commands::CheckConfig { config }) => {
            let config_path = config.unwrap_or(cli.config);
            check_config(&config_path).await?;
        }

        // 列出模块
        Some(Commands::ListModules { dir }) => {
            let dirs = if dir.is_empty() {
                load_config(&cli.config, cli.dev).await?.modules.module_dirs
            } else {
                dir
            };
            list_modules(&dirs).await?;
        }

        // 检查过滤表达式
        Some(Commands::CheckFilter { expr }) => {
            check_filter(&expr)?;
        }
    }

    Ok(())
}

/// 加载配置文件，不存在时使用默认配置
async fn load_config(config_path: &Path, dev_mode: bool) -> Result<CoreConfig, Box<dyn std::error::Error>> {
    let mut config = if config_path.exists() {
        let config = CoreConfig::from_file(config_path).await?;
        info!("已加载配置文件: {}", config_path.display());
        config
    } else {
        info!("配置文件不存在 ({})，使用默认配置", config_path.display());
        CoreConfig::default()
    };
    if dev_mode {
        config.dev_mode = true;
    }
    Ok(config)
}
