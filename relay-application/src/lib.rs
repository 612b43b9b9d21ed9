//! 事务性 Outbox 应用层（relay-application）
//!
//! - `executor`：命令在单一事务内完成状态变更与 Outbox 追加；
//! - `dispatcher`：提交后的进程内事件分发；
//! - `subscription`：把订阅到的事件桥接为本服务的命令；
//! - `config`/`runtime`：配置加载与运行时装配。
//!
pub mod command;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod receipt;
pub mod runtime;
pub mod subscription;

pub use command::{Command, CommandEnvelope, Target};
pub use config::{ConfigError, RelayConfig};
pub use context::{AppContext, Causation};
pub use dispatcher::{DispatchReport, EventDispatcher, EventHandler, HandledEventType};
pub use error::AppError;
pub use executor::CommandExecutor;
pub use receipt::CommandReceipt;
pub use runtime::{RelayRuntime, RuntimeHandle};
pub use subscription::CommandBinding;
