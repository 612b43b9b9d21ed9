//! 持久化（persist）
//!
//! 定义聚合状态与 Outbox 的持久化模型与存储协议：
//! - 事件与聚合的规范序列化形态（`SerializedEvent`、`SerializedAggregate`）；
//! - Outbox 条目及其单向状态机（`OutboxEntry`/`OutboxStatus`）；
//! - 共享事务的存储协议（`TransactionManager` 及其派生协议）；
//! - 内存实现（`InMemoryStore`）与可选的 PostgreSQL 实现（`PgStore`，feature `postgres`）。
//!
mod outbox_entry;
mod serialized_aggregate;
mod serialized_event;
mod store;

#[cfg(feature = "eventing")]
mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use outbox_entry::{OutboxEntry, OutboxStatus};
pub use serialized_aggregate::SerializedAggregate;
pub use serialized_event::{SerializedEvent, serialize_events};
pub use store::{
    AggregateStore, IdempotencyStore, OutboxStore, ProcessedEventStore, RelayStore, StatusCounts,
    TransactionManager,
};

#[cfg(feature = "eventing")]
pub use in_memory::{InMemoryStore, InMemoryTx};
#[cfg(feature = "postgres")]
pub use postgres::PgStore;
