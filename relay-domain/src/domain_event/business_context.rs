use bon::Builder;
use serde::{Deserialize, Serialize};

/// 业务上下文：随命令进入、随事件落库并透传到总线
#[derive(Builder, Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessContext {
    /// 关联ID（同一业务操作链路共享）
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    /// 因果ID（触发本次操作的事件或请求）
    #[serde(skip_serializing_if = "Option::is_none")]
    causation_id: Option<String>,
    /// 触发事件的主体类型（如用户、系统、订阅者等）
    #[serde(skip_serializing_if = "Option::is_none")]
    actor_type: Option<String>,
    /// 触发事件的主体ID
    #[serde(skip_serializing_if = "Option::is_none")]
    actor_id: Option<String>,
}

impl BusinessContext {
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn actor_type(&self) -> Option<&str> {
        self.actor_type.as_deref()
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    /// 派生一个由上游事件引起的上下文：沿用关联ID，因果ID 指向上游事件
    pub fn caused_by(&self, event_id: impl Into<String>) -> Self {
        Self {
            causation_id: Some(event_id.into()),
            ..self.clone()
        }
    }
}
