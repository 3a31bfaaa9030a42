use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单个工作项（某个 URL 的某个 viewport）的分类错误
///
/// 截图与评分两个阶段共用这一套分类，重试策略只看分类做决定。
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StageError {
    /// 可重试：超时、限流、临时网络错误
    #[error("临时错误: {0}")]
    Transient(String),
    /// 不可重试：非法 URL、鉴权失败、响应格式错误
    #[error("永久错误: {0}")]
    Permanent(String),
    /// 重试次数耗尽，携带最后一次的底层错误
    #[error("重试 {attempts} 次后仍失败: {last}")]
    RetryExhausted { attempts: u32, last: Box<StageError> },
    /// 运行被取消（阈值中止或外部信号）
    #[error("已取消")]
    Cancelled,
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        StageError::Permanent(msg.into())
    }

    /// 单次截图超时，按临时错误处理
    pub fn timeout(timeout_ms: u64) -> Self {
        StageError::Transient(format!("timeout after {}ms", timeout_ms))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }

    /// 是否由超时导致（包括重试耗尽时最后一次是超时）
    pub fn is_timeout(&self) -> bool {
        match self {
            StageError::Transient(msg) => msg.starts_with("timeout after"),
            StageError::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

/// HTTP 状态码分类：429 与 5xx 可重试，其余 4xx 不可重试
pub fn classify_http_status(status: u16, detail: impl Into<String>) -> StageError {
    let detail = detail.into();
    match status {
        429 | 500..=599 => StageError::Transient(format!("HTTP {}: {}", status, detail)),
        400..=499 => StageError::Permanent(format!("HTTP {}: {}", status, detail)),
        _ => StageError::Transient(format!("HTTP {}: {}", status, detail)),
    }
}

/// 配置校验错误
///
/// 在任何工作开始之前返回，整个运行直接失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 未知的评分维度
    #[error("未知的评分维度: {name}")]
    UnknownDimension { name: String },
    /// 维度集合为空
    #[error("评分维度集合不能为空")]
    EmptyDimensions,
    /// viewport 集合为空或重名
    #[error("viewport 配置无效: {reason}")]
    InvalidViewport { reason: String },
    /// 数值范围不合法
    #[error("配置项 {field} 取值无效: {reason}")]
    InvalidValue { field: String, reason: String },
    /// 环境变量解析失败
    #[error("环境变量 {var_name} 解析失败: 值 '{value}' 无法转换为 {expected_type}")]
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    FileReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("TOML解析失败 ({path}): {source}")]
    TomlParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 浏览器相关错误
    #[error("浏览器错误: {0}")]
    Browser(#[from] chromiumoxide::error::CdpError),
    /// 文件操作错误
    #[error("文件错误 ({path}): {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 序列化失败
    #[error("JSON序列化失败: {0}")]
    Json(#[from] serde_json::Error),
    /// 其他错误
    #[error("错误: {0}")]
    Other(String),
}

impl AppError {
    /// 创建文件错误
    pub fn file(path: impl Into<String>, source: std::io::Error) -> Self {
        AppError::File {
            path: path.into(),
            source,
        }
    }
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
