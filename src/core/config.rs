//! 运行时配置
//!
//! 定义运行时的配置结构和加载逻辑。配置文件按扩展名选择 JSON 或 YAML。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::{CoreError, Result};

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略（daily / hourly / minutely / never）
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
        }
    }
}

/// 模块配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// 模块目录列表（每个子目录包含一个 module.yaml）
    #[serde(default)]
    pub module_dirs: Vec<PathBuf>,

    /// 安装后自动启动的模块符号名
    #[serde(default)]
    pub auto_start: Vec<String>,
}

/// 事件分发配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// 过滤器只要求单个 `objectClass` 时，是否按接口哈希跳过不相交的注册
    #[serde(default = "default_true")]
    pub object_class_short_circuit: bool,
}

fn default_true() -> bool {
    true
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            object_class_short_circuit: true,
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 模块配置
    #[serde(default)]
    pub modules: ModuleConfig,

    /// 事件分发配置
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,

    /// 数据目录
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl CoreConfig {
    /// 创建配置构建器
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::new()
    }

    /// 从文件加载配置
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CoreError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
        Self::from_content(path, &content)
    }

    /// 从文件同步加载配置
    pub fn from_file_sync(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| CoreError::ConfigLoadFailed(format!("{}: {}", path.display(), e)))?;
        Self::from_content(path, &content)
    }

    fn from_content(path: PathBuf, content: &str) -> Result<Self> {
        let mut config: CoreConfig = if is_json(&path) {
            serde_json::from_str(content)?
        } else {
            serde_yaml::from_str(content)?
        };

        config.config_path = Some(path);
        Ok(config)
    }

    /// 合并另一个配置（用于覆盖）
    pub fn merge(&mut self, other: CoreConfig) {
        // 只覆盖非默认值的配置
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if other.logging.rotation != default_rotation() {
            self.logging.rotation = other.logging.rotation;
        }
        for dir in other.modules.module_dirs {
            if !self.modules.module_dirs.contains(&dir) {
                self.modules.module_dirs.push(dir);
            }
        }
        for name in other.modules.auto_start {
            if !self.modules.auto_start.contains(&name) {
                self.modules.auto_start.push(name);
            }
        }
        if !other.dispatch.object_class_short_circuit {
            self.dispatch.object_class_short_circuit = false;
        }
        if other.dev_mode {
            self.dev_mode = true;
        }
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().map(|e| e == "json").unwrap_or(false)
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct CoreConfigBuilder {
    config: CoreConfig,
}

impl CoreConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置配置文件路径
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.config_path = Some(path.into());
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 添加模块目录
    pub fn module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.modules.module_dirs.push(dir.into());
        self
    }

    /// 添加自动启动的模块
    pub fn auto_start(mut self, symbolic_name: impl Into<String>) -> Self {
        self.config.modules.auto_start.push(symbolic_name.into());
        self
    }

    /// 设置是否启用接口短路
    pub fn object_class_short_circuit(mut self, enabled: bool) -> Self {
        self.config.dispatch.object_class_short_circuit = enabled;
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 设置数据目录
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    /// 构建配置
    pub fn build(self) -> CoreConfig {
        self.config
    }
}
