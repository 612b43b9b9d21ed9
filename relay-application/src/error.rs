use crate::config::ConfigError;
use relay_domain::error::{DomainError, ErrorClass};

#[non_exhaustive]
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("domain: {0}")]
    Domain(#[from] DomainError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    /// 启动期依赖不可达（存储、中间件）
    #[error("bootstrap failed: {component}: {reason}")]
    Bootstrap {
        component: &'static str,
        reason: String,
    },

    #[error("task join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AppError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Domain(e) => e.class(),
            _ => ErrorClass::Permanent,
        }
    }

    /// 还原为领域错误，供订阅端按错误分类处理
    pub fn into_domain(self) -> DomainError {
        match self {
            AppError::Domain(e) => e,
            other => DomainError::invalid_input(other.to_string()),
        }
    }
}
