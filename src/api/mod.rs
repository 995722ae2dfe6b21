//! API 模块
//!
//! 对外提供的组合根 [`Framework`]。
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_runtime::{CoreConfig, Framework};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CoreConfig::builder()
//!         .module_dir("./modules")
//!         .auto_start("com.example.greeter")
//!         .build();
//!
//!     let framework = Framework::builder().config(config).build()?;
//!     framework.install_configured();
//!     framework.start_configured();
//!     framework.shutdown();
//!     Ok(())
//! }
//! ```

pub mod framework;

// 重导出主要类型
pub use framework::{Framework, FrameworkBuilder, FrameworkState, FrameworkStats, STORE_FILE};
