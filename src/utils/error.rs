//! 模块运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型。生命周期与注册表操作的错误
//! 都以 `Result` 同步返回给调用方，不会跨越事件分发边界传播。

use thiserror::Error;

use crate::filter::InvalidSyntaxError;
use crate::module::loader::LoadError;
use crate::utils::id::{ListenerId, ModuleId, ServiceId};

/// 运行时核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 模块生命周期错误 ====================

    /// 模块描述信息缺失或格式错误
    #[error("模块描述无效: '{location}' - {reason}")]
    Manifest {
        location: String,
        reason: String,
    },

    /// 加载器无法加载模块
    #[error("模块加载失败: {0}")]
    Load(#[from] LoadError),

    /// 依赖未满足（可在安装依赖后重试）
    #[error("模块 '{module}' 依赖未满足: {missing:?}")]
    UnresolvedDependency {
        module: String,
        missing: Vec<String>,
    },

    /// 循环依赖
    #[error("检测到循环依赖: {0}")]
    CircularDependency(String),

    /// 激活器执行失败，模块已回滚
    #[error("模块 '{module}' 激活失败: {reason}")]
    ActivationFailed {
        module: String,
        reason: String,
    },

    /// 当前状态不允许该操作
    #[error("模块 {module} 处于 {state} 状态，不允许执行 {operation}")]
    IllegalState {
        module: ModuleId,
        state: String,
        operation: &'static str,
    },

    /// 模块未找到（或已卸载）
    #[error("模块未找到: {0}")]
    ModuleNotFound(ModuleId),

    // ==================== 服务与监听器错误 ====================

    /// 过滤表达式语法错误
    #[error(transparent)]
    InvalidFilter(#[from] InvalidSyntaxError),

    /// 服务已注销
    #[error("服务已注销: {0}")]
    ServiceUnregistered(ServiceId),

    /// 参数无效（默认构造的引用、空接口集合等）
    #[error("参数无效: {0}")]
    InvalidArgument(String),

    /// 权限被拒绝（修改不属于调用方的注册或监听器）
    #[error("权限被拒绝: {0}")]
    PermissionDenied(String),

    /// 监听器未找到
    #[error("监听器未找到: {0}")]
    ListenerNotFound(ListenerId),

    /// 模块上下文已失效（模块已停止）
    #[error("模块上下文已失效: {0}")]
    ContextInvalid(ModuleId),

    // ==================== 配置错误 ====================

    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    // ==================== IO 和序列化错误 ====================

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 版本解析错误
    #[error("版本解析错误: {0}")]
    VersionParse(#[from] semver::Error),

    // ==================== 通用错误 ====================

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 状态码常量
pub mod status_code {
    /// 成功
    pub const OK: u16 = 200;

    /// 请求格式错误
    pub const BAD_REQUEST: u16 = 400;

    /// 权限不足
    pub const FORBIDDEN: u16 = 403;

    /// 未找到
    pub const NOT_FOUND: u16 = 404;

    /// 冲突（状态不允许）
    pub const CONFLICT: u16 = 409;

    /// 资源已不存在
    pub const GONE: u16 = 410;

    /// 依赖未满足
    pub const FAILED_DEPENDENCY: u16 = 424;

    /// 内部错误
    pub const INTERNAL_ERROR: u16 = 500;
}

/// 错误码常量
pub mod error_code {
    // 模块错误 (MODULE-xxx)
    pub const MODULE_MANIFEST_INVALID: &str = "MODULE-001";
    pub const MODULE_LOAD_FAILED: &str = "MODULE-002";
    pub const MODULE_UNRESOLVED: &str = "MODULE-003";
    pub const MODULE_CIRCULAR_DEPENDENCY: &str = "MODULE-004";
    pub const MODULE_ACTIVATION_FAILED: &str = "MODULE-005";
    pub const MODULE_ILLEGAL_STATE: &str = "MODULE-006";
    pub const MODULE_NOT_FOUND: &str = "MODULE-007";

    // 服务错误 (SERVICE-xxx)
    pub const SERVICE_INVALID_FILTER: &str = "SERVICE-001";
    pub const SERVICE_UNREGISTERED: &str = "SERVICE-002";
    pub const SERVICE_INVALID_ARGUMENT: &str = "SERVICE-003";
    pub const SERVICE_LISTENER_NOT_FOUND: &str = "SERVICE-004";
    pub const SERVICE_CONTEXT_INVALID: &str = "SERVICE-005";

    // 权限错误 (PERMISSION-xxx)
    pub const PERMISSION_DENIED: &str = "PERMISSION-001";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
}

impl CoreError {
    /// 构造描述信息错误
    pub fn manifest(location: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Manifest {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::Manifest { .. } => error_code::MODULE_MANIFEST_INVALID,
            CoreError::Load(_) => error_code::MODULE_LOAD_FAILED,
            CoreError::UnresolvedDependency { .. } => error_code::MODULE_UNRESOLVED,
            CoreError::CircularDependency(_) => error_code::MODULE_CIRCULAR_DEPENDENCY,
            CoreError::ActivationFailed { .. } => error_code::MODULE_ACTIVATION_FAILED,
            CoreError::IllegalState { .. } => error_code::MODULE_ILLEGAL_STATE,
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::InvalidFilter(_) => error_code::SERVICE_INVALID_FILTER,
            CoreError::ServiceUnregistered(_) => error_code::SERVICE_UNREGISTERED,
            CoreError::InvalidArgument(_) => error_code::SERVICE_INVALID_ARGUMENT,
            CoreError::ListenerNotFound(_) => error_code::SERVICE_LISTENER_NOT_FOUND,
            CoreError::ContextInvalid(_) => error_code::SERVICE_CONTEXT_INVALID,
            CoreError::PermissionDenied(_) => error_code::PERMISSION_DENIED,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            _ => "UNKNOWN",
        }
    }

    /// 获取状态码
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Manifest { .. } | CoreError::InvalidFilter(_) => status_code::BAD_REQUEST,
            CoreError::InvalidArgument(_) => status_code::BAD_REQUEST,
            CoreError::PermissionDenied(_) => status_code::FORBIDDEN,
            CoreError::ModuleNotFound(_) | CoreError::ListenerNotFound(_) => {
                status_code::NOT_FOUND
            }
            CoreError::IllegalState { .. } => status_code::CONFLICT,
            CoreError::ServiceUnregistered(_) | CoreError::ContextInvalid(_) => status_code::GONE,
            CoreError::UnresolvedDependency { .. } | CoreError::CircularDependency(_) => {
                status_code::FAILED_DEPENDENCY
            }
            _ => status_code::INTERNAL_ERROR,
        }
    }

    /// 调用方是否可以在修正外部条件后重试
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::UnresolvedDependency { .. } | CoreError::ServiceUnregistered(_)
        )
    }
}
