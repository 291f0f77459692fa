use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("策略清单校验失败: {path} - {reason}")]
    ManifestValidation { path: String, reason: String },

    #[error("未找到策略或品种: {strategy_id}/{instrument}/{mode}")]
    NotFound {
        strategy_id: String,
        instrument: String,
        mode: String,
    },

    #[error("信号已过期: {signal_ref} (延迟 {age_ms}ms)")]
    StaleSignal { signal_ref: String, age_ms: i64 },

    #[error("持久化超时: 操作 '{operation}' 超时 ({timeout_ms}毫秒)")]
    PersistenceTimeout { operation: String, timeout_ms: u64 },

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("SQLite错误: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("预留泄漏: {key} - {detail}")]
    ReservationLeak { key: String, detail: String },

    #[error("审计日志损坏: 第{line}行 - {reason}")]
    AuditCorrupted { line: usize, reason: String },

    #[error("非法输入: {0}")]
    InvalidInput(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("配置加载错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON序列化错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML解析错误: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;

impl RouterError {
    pub fn manifest(path: impl Into<String>, reason: impl Into<String>) -> Self {
        RouterError::ManifestValidation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// 致命错误：必须中止运行或停止放行，不能局部恢复
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RouterError::ManifestValidation { .. }
                | RouterError::ReservationLeak { .. }
                | RouterError::AuditCorrupted { .. }
                | RouterError::ConfigError(_)
                | RouterError::Config(_)
        )
    }

    /// 判断错误是否可以由调用方重试
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::PersistenceTimeout { .. } => true,
            RouterError::Persistence(_) => true,
            RouterError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            RouterError::Io(_) => true,
            _ => false,
        }
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RouterError::NotFound { .. } => ErrorSeverity::Info,
            RouterError::StaleSignal { .. } => ErrorSeverity::Info,
            RouterError::PersistenceTimeout { .. } => ErrorSeverity::Warning,
            RouterError::Persistence(_) => ErrorSeverity::Warning,
            RouterError::Sqlite(_) => ErrorSeverity::Warning,
            RouterError::ReservationLeak { .. } => ErrorSeverity::Critical,
            RouterError::AuditCorrupted { .. } => ErrorSeverity::Critical,
            RouterError::ManifestValidation { .. } => ErrorSeverity::Critical,
            RouterError::ConfigError(_) | RouterError::Config(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }
}

/// 错误严重程度
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Info,     // 单个信号被丢弃，不影响其他信号
    Warning,  // 存储暂不可用，按拒绝处理
    Error,    // 一般错误
    Critical, // 风控账目可能被破坏，必须告警
}
