use crate::aggregate::Aggregate;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::business_context::BusinessContext;
use super::metadata::Metadata;
use crate::value_object::Version;

/// 事件信封，包含事件载荷、元数据与业务上下文
#[derive(Debug, Clone)]
pub struct EventEnvelope<A>
where
    A: Aggregate,
{
    pub metadata: Metadata,
    pub payload: A::Event,
    pub context: BusinessContext,
}

impl<A> EventEnvelope<A>
where
    A: Aggregate,
{
    pub fn new(
        aggregate_id: &A::Id,
        version: Version,
        payload: A::Event,
        occurred_at: DateTime<Utc>,
        context: BusinessContext,
    ) -> Self {
        let metadata = Metadata::builder()
            .event_id(Uuid::new_v4().to_string())
            .aggregate_id(aggregate_id.to_string())
            .aggregate_type(A::TYPE.to_string())
            .version(version)
            .occurred_at(occurred_at)
            .build();

        Self {
            metadata,
            payload,
            context,
        }
    }

    pub fn event_id(&self) -> &str {
        self.metadata.event_id()
    }

    pub fn version(&self) -> Version {
        self.metadata.version()
    }
}
