//! 事务性 Outbox 领域层（relay-domain）
//!
//! 提供把“状态变更”与“事件对外投递”可靠衔接起来的领域抽象与运行时：
//! - 聚合（`aggregate`）与实体（`entity`）建模，值类型的事件记录（`domain_event`）
//! - 聚合状态、Outbox 条目、幂等回执的持久化协议与实现（`persist`）
//! - 事件投递（`eventing`）：中间件端口、适配器、Outbox 处理器与订阅运行时
//! - 时钟（`clock`）、值对象（`value_object`）与统一错误（`error`）
//!
//! 投递语义为至少一次：同一聚合内严格按版本有序，跨聚合不保证顺序；
//! 订阅端按 `(eventType, aggregateId, eventVersion)` 去重。
//!
//! 典型用法：
//! 1. 定义聚合、命令与带判别字段的事件枚举，实现 `Aggregate::execute/apply`；
//! 2. 选择 `persist` 中的存储实现（内存或 Postgres）；
//! 3. 用 `eventing::OutboxProcessor` 投递 Outbox，用 `eventing::SubscriberLoop` 消费。
//!
pub mod aggregate;
pub mod clock;
pub mod domain_event;
pub mod entity;
pub mod error;
#[cfg(feature = "eventing")]
pub mod eventing;
pub mod persist;
pub mod value_object;
