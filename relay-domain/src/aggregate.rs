//! 聚合（Aggregate）抽象
//!
//! 约束一个聚合的核心行为：
//! - `execute` 校验命令并给出应记录的事件（不改变状态）；
//! - `apply` 将事件投影到状态（改变状态，同时推进版本）；
//! - 通过 `Entity` 约束聚合具备标识与版本。
//!
//! 聚合从不直接发布事件，也从不读取 Outbox。
//!
use crate::domain_event::DomainEvent;
use crate::entity::Entity;
use crate::error::DomainResult;
use crate::value_object::Version;
use serde::{Serialize, de::DeserializeOwned};

/// 聚合根接口
pub trait Aggregate: Entity + Serialize + DeserializeOwned + Send + Sync {
    /// 聚合类型（稳定字符串，写入 Outbox 的 `aggregate_type`）
    const TYPE: &'static str;

    /// 该聚合支持的命令（意图）类型
    type Command: Send;
    /// 该聚合产生的领域事件类型
    type Event: DomainEvent;

    /// 执行命令，返回应记录的事件列表；校验失败返回 `InvalidInput`
    fn execute(&self, command: Self::Command) -> DomainResult<Vec<Self::Event>>;

    /// 应用事件，更新聚合状态；`version` 为该事件在聚合内的版本
    fn apply(&mut self, event: &Self::Event, version: Version);
}
