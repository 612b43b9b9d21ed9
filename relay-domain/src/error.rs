//! 领域层统一错误定义
//!
//! 聚焦 Outbox 管道的错误分类：输入校验、并发冲突、存储/总线不可用、
//! 毒事件/毒消息、重复投递，以及序列化等支撑性错误。
//! 通过 [`DomainError::class`] 将错误归入可重试/永久/重复三类，
//! 供订阅端决定是否提交位点、供处理器决定是否退避。
//!
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 命令/校验 ---
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
    #[error(
        "concurrent modification: aggregate={aggregate_id}, expected={expected}, actual={actual}"
    )]
    ConcurrentModification {
        aggregate_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("not found: {reason}")]
    NotFound { reason: String },

    // --- 基础设施 ---
    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },
    #[error("broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },
    #[error("broker rejected message: {reason}")]
    BrokerRejected { reason: String },
    #[error("no topic routed for event type: {event_type}")]
    UnknownTopic { event_type: String },

    // --- 毒事件/毒消息/重复 ---
    #[error("poison entry: id={entry_id}, reason={reason}")]
    PoisonEntry { entry_id: String, reason: String },
    #[error("poison message: {reason}")]
    PoisonMessage { reason: String },
    #[error("duplicate: {key}")]
    Duplicate { key: String },

    // --- Outbox 状态机 ---
    #[error("invalid outbox transition: id={entry_id}, from={from}, to={to}")]
    InvalidTransition {
        entry_id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("outbox lease lost: id={entry_id}, owner={owner}")]
    LeaseLost { entry_id: String, owner: String },

    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },
}

/// 错误分类：决定调用方是重试、跳过还是视为成功
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 瞬时故障（存储/总线不可用、并发冲突），稍后重试
    Retryable,
    /// 永久失败（校验失败、编码错误、程序缺陷），重试无意义
    Permanent,
    /// 幂等键已出现过，等价于成功
    Duplicate,
}

impl DomainError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn store_unavailable(reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            reason: reason.into(),
        }
    }

    pub fn broker_unavailable(reason: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            reason: reason.into(),
        }
    }

    pub fn poison_message(reason: impl Into<String>) -> Self {
        Self::PoisonMessage {
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound {
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::StoreUnavailable { .. }
            | Self::BrokerUnavailable { .. }
            | Self::ConcurrentModification { .. } => ErrorClass::Retryable,
            Self::Duplicate { .. } => ErrorClass::Duplicate,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

// 允许在基础设施层直接使用 `?` 将 sqlx 错误转换为 DomainError
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DomainError::NotFound {
                reason: "row not found".to_string(),
            },
            sqlx::Error::Database(db) if db.is_unique_violation() => DomainError::Duplicate {
                key: db.constraint().unwrap_or("unique").to_string(),
            },
            other => DomainError::StoreUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

impl From<chrono::OutOfRangeError> for DomainError {
    fn from(err: chrono::OutOfRangeError) -> Self {
        DomainError::InvalidInput {
            reason: err.to_string(),
        }
    }
}
