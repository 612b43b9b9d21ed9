use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// 领域事件载荷需要满足的通用能力边界
///
/// 事件以带判别字段的枚举表达（`#[serde(tag = "type")]`），由聚合在产生事件时
/// 决定具体变体；`event_type` 返回该变体稳定的类型名，用于路由与订阅匹配。
pub trait DomainEvent:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync
{
    /// 事件类型（稳定字符串，如 `UserCreated`）
    fn event_type(&self) -> &'static str;
}
