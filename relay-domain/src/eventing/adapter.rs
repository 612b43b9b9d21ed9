//! 中间件适配器（BrokerAdapter）
//!
//! 在 Outbox 条目与中间件消息之间转换：
//! - 主题：`eventType → topic` 的静态路由表（`TopicMap`）；
//! - 分区键：`aggregateId`；
//! - 消息体：条目中的规范编码负载，原样发送；
//! - 消息头：`eventType`、`eventVersion`、`aggregateId`、`aggregateType`、
//!   `occurredAt`（RFC-3339 UTC）、`outboxEntryId`。
//!
//! 发布在中间件确认后才返回；超过 `publish_timeout` 视为 `BrokerUnavailable`，
//! 重试可能导致重复投递，由订阅端去重。
//!
use crate::error::{DomainError, DomainResult as Result};
use crate::eventing::{BrokerMessage, MessageBroker, ReceivedMessage};
use crate::persist::{OutboxEntry, SerializedEvent};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

pub const HEADER_EVENT_TYPE: &str = "eventType";
pub const HEADER_EVENT_VERSION: &str = "eventVersion";
pub const HEADER_AGGREGATE_ID: &str = "aggregateId";
pub const HEADER_AGGREGATE_TYPE: &str = "aggregateType";
pub const HEADER_OCCURRED_AT: &str = "occurredAt";
pub const HEADER_OUTBOX_ENTRY_ID: &str = "outboxEntryId";

/// 事件类型到主题的路由表
#[derive(Debug, Clone, Default)]
pub struct TopicMap {
    routes: HashMap<String, String>,
    fallback: Option<String>,
}

impl TopicMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.routes.insert(event_type.into(), topic.into());
        self
    }

    /// 未显式路由的事件类型使用的主题
    pub fn fallback(mut self, topic: impl Into<String>) -> Self {
        self.fallback = Some(topic.into());
        self
    }

    pub fn topic_for(&self, event_type: &str) -> Result<&str> {
        self.routes
            .get(event_type)
            .or(self.fallback.as_ref())
            .map(String::as_str)
            .ok_or_else(|| DomainError::UnknownTopic {
                event_type: event_type.to_string(),
            })
    }
}

/// 订阅端解码得到的事件
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event: SerializedEvent,
    pub outbox_entry_id: String,
    pub topic: String,
    pub partition: usize,
    pub offset: u64,
}

impl InboundEvent {
    /// 订阅端幂等键：`eventType/aggregateId/eventVersion`
    pub fn natural_key(&self) -> String {
        self.event.natural_key()
    }
}

#[derive(Clone)]
pub struct BrokerAdapter {
    broker: Arc<dyn MessageBroker>,
    topics: TopicMap,
    publish_timeout: Duration,
}

impl BrokerAdapter {
    pub fn new(broker: Arc<dyn MessageBroker>, topics: TopicMap) -> Self {
        Self {
            broker,
            topics,
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }

    pub fn to_message(&self, entry: &OutboxEntry) -> Result<BrokerMessage> {
        let topic = self.topics.topic_for(&entry.event_type)?;

        let headers = BTreeMap::from([
            (HEADER_EVENT_TYPE.to_string(), entry.event_type.clone()),
            (
                HEADER_EVENT_VERSION.to_string(),
                entry.event_version.to_string(),
            ),
            (HEADER_AGGREGATE_ID.to_string(), entry.aggregate_id.clone()),
            (
                HEADER_AGGREGATE_TYPE.to_string(),
                entry.aggregate_type.clone(),
            ),
            (
                HEADER_OCCURRED_AT.to_string(),
                entry
                    .occurred_at
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            (HEADER_OUTBOX_ENTRY_ID.to_string(), entry.id.clone()),
        ]);

        Ok(BrokerMessage {
            topic: topic.to_string(),
            key: entry.aggregate_id.clone(),
            value: entry.payload.clone(),
            headers,
        })
    }

    /// 发布条目并等待确认，返回目标主题
    pub async fn publish(&self, entry: &OutboxEntry) -> Result<String> {
        let message = self.to_message(entry)?;
        match tokio::time::timeout(self.publish_timeout, self.broker.publish(&message)).await {
            Ok(result) => result.map(|()| message.topic),
            Err(_) => Err(DomainError::broker_unavailable(format!(
                "publish to {} timed out after {:?}",
                message.topic, self.publish_timeout
            ))),
        }
    }

    /// 解码收到的消息；缺失或与负载不一致的消息头视为毒消息
    pub fn decode(&self, received: &ReceivedMessage) -> Result<InboundEvent> {
        let message = &received.message;
        let event = SerializedEvent::from_bytes(&message.value)
            .map_err(|e| DomainError::poison_message(format!("undecodable payload: {e}")))?;

        let header = |name: &str| {
            message
                .header(name)
                .ok_or_else(|| DomainError::poison_message(format!("missing header {name}")))
        };

        let event_version: usize = header(HEADER_EVENT_VERSION)?
            .parse()
            .map_err(|_| DomainError::poison_message("eventVersion is not a number"))?;
        let occurred_at = DateTime::parse_from_rfc3339(header(HEADER_OCCURRED_AT)?)
            .map_err(|_| DomainError::poison_message("occurredAt is not RFC-3339"))?
            .with_timezone(&Utc);

        let consistent = header(HEADER_EVENT_TYPE)? == event.event_type()
            && header(HEADER_AGGREGATE_ID)? == event.aggregate_id()
            && header(HEADER_AGGREGATE_TYPE)? == event.aggregate_type()
            && event_version == event.event_version()
            // 存储层时间戳精度为微秒
            && occurred_at.trunc_subsecs(6) == event.occurred_at().trunc_subsecs(6)
            && message.key == event.aggregate_id();
        if !consistent {
            return Err(DomainError::poison_message(format!(
                "headers disagree with payload of {}",
                event.natural_key()
            )));
        }

        Ok(InboundEvent {
            outbox_entry_id: header(HEADER_OUTBOX_ENTRY_ID)?.to_string(),
            event,
            topic: message.topic.clone(),
            partition: received.partition,
            offset: received.offset,
        })
    }
}
