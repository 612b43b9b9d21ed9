//! 事件持久化模型（SerializedEvent）
//!
//! 事件在 Outbox 与总线上的规范形态：字段名固定、对象键按字典序输出，
//! 同一事件多次序列化得到完全相同的字节序列。
//!
use crate::{
    aggregate::Aggregate,
    domain_event::{BusinessContext, EventEnvelope, Metadata},
    error::{DomainError, DomainResult},
    value_object::Version,
};
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedEvent {
    /// 事件唯一标识符（同时作为 Outbox 条目 ID）
    event_id: String,
    /// 事件类型（判别字段）
    event_type: String,
    /// 事件在聚合内的版本
    event_version: usize,
    /// 聚合 ID
    aggregate_id: String,
    /// 聚合类型
    aggregate_type: String,
    /// 事件发生时间
    occurred_at: DateTime<Utc>,
    /// 事件负载（带 `type` 判别字段的对象）
    payload: Value,
    /// 业务上下文
    #[builder(default)]
    context: BusinessContext,
}

impl SerializedEvent {
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_version(&self) -> usize {
        self.event_version
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn context(&self) -> &BusinessContext {
        &self.context
    }

    /// 订阅端幂等键：`eventType/aggregateId/eventVersion`
    pub fn natural_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.event_type, self.aggregate_id, self.event_version
        )
    }

    /// 规范编码
    pub fn to_bytes(&self) -> DomainResult<Vec<u8>> {
        // 经由 Value 中转：serde_json 的 Map 为有序映射，保证键顺序稳定
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_vec(&value)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> DomainResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// 将负载还原为具体的领域事件类型
    pub fn decode_payload<A>(&self) -> DomainResult<A::Event>
    where
        A: Aggregate,
    {
        if self.aggregate_type != A::TYPE {
            return Err(DomainError::TypeMismatch {
                expected: A::TYPE.to_string(),
                found: self.aggregate_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

impl<A> TryFrom<&EventEnvelope<A>> for SerializedEvent
where
    A: Aggregate,
{
    type Error = serde_json::Error;

    fn try_from(envelope: &EventEnvelope<A>) -> Result<Self, Self::Error> {
        use crate::domain_event::DomainEvent;

        Ok(SerializedEvent {
            event_id: envelope.metadata.event_id().to_string(),
            event_type: envelope.payload.event_type().to_string(),
            event_version: envelope.metadata.version().value(),
            aggregate_id: envelope.metadata.aggregate_id().to_string(),
            aggregate_type: envelope.metadata.aggregate_type().to_string(),
            occurred_at: *envelope.metadata.occurred_at(),
            payload: serde_json::to_value(&envelope.payload)?,
            context: envelope.context.clone(),
        })
    }
}

impl<A> TryFrom<&SerializedEvent> for EventEnvelope<A>
where
    A: Aggregate,
{
    type Error = DomainError;

    fn try_from(value: &SerializedEvent) -> Result<Self, Self::Error> {
        let payload = value.decode_payload::<A>()?;
        let metadata = Metadata::builder()
            .event_id(value.event_id.clone())
            .aggregate_id(value.aggregate_id.clone())
            .aggregate_type(value.aggregate_type.clone())
            .version(Version::from_value(value.event_version))
            .occurred_at(value.occurred_at)
            .build();

        Ok(EventEnvelope {
            metadata,
            payload,
            context: value.context.clone(),
        })
    }
}

pub fn serialize_events<A>(events: &[EventEnvelope<A>]) -> DomainResult<Vec<SerializedEvent>>
where
    A: Aggregate,
{
    let events = events
        .iter()
        .map(SerializedEvent::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}
