use crate::{
    aggregate::Aggregate,
    error::{DomainError, DomainResult as Result},
    value_object::Version,
};
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 聚合状态的持久化形态（行存储中的一行）
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct SerializedAggregate {
    aggregate_id: String,
    aggregate_type: String,
    version: Version,
    state: Value,
}

impl SerializedAggregate {
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// 将持久化状态还原为聚合实例
    pub fn to_aggregate<A>(&self) -> Result<A>
    where
        A: Aggregate,
    {
        if A::TYPE != self.aggregate_type {
            return Err(DomainError::TypeMismatch {
                expected: A::TYPE.to_string(),
                found: self.aggregate_type.clone(),
            });
        }

        let aggregate = serde_json::from_value(self.state.clone())?;
        Ok(aggregate)
    }

    /// 从聚合实例创建持久化状态
    pub fn from_aggregate<A>(aggregate: &A) -> Result<Self>
    where
        A: Aggregate,
    {
        Ok(Self {
            aggregate_id: aggregate.id().to_string(),
            aggregate_type: A::TYPE.to_string(),
            version: aggregate.version(),
            state: serde_json::to_value(aggregate)?,
        })
    }
}
