use relay_domain::domain_event::BusinessContext;
use relay_domain::eventing::InboundEvent;
use tracing::Span;

/// 应用层上下文（Application Context）
///
/// 承载一次命令执行所需的横切信息：
/// - 业务语境（`BusinessContext`）：关联追踪 `correlation_id`、因果链 `causation_id`、
///   执行者类型/ID 等，随事件写入 Outbox；
/// - 幂等键（`idempotency_key`）：`(aggregate_type, key)` 唯一，重复提交返回首次结果；
/// - 因果键（`causation`）：由订阅端设置，已处理过的上游事件返回 `Duplicate`；
/// - 日志句柄（`span`）：整个工作单元在该 span 内执行。
///
/// 典型用法：
/// ```rust
/// use relay_application::context::AppContext;
/// use relay_domain::domain_event::BusinessContext;
///
/// let ctx = AppContext::new(
///     BusinessContext::builder()
///         .correlation_id("cor-123".into())
///         .actor_type("user".into())
///         .actor_id("u-1".into())
///         .build(),
/// )
/// .with_idempotency_key("idem-xyz");
/// assert_eq!(ctx.idempotency_key.as_deref(), Some("idem-xyz"));
/// ```
#[derive(Clone, Debug)]
pub struct AppContext {
    /// 业务语境（链路追踪、审计主体、操作因果）
    pub biz: BusinessContext,
    /// 幂等键（可选）
    pub idempotency_key: Option<String>,
    /// 触发本次命令的上游事件（可选）
    pub causation: Option<Causation>,
    pub span: Span,
}

/// 订阅端因果键：`consumer` 已处理过 `event_key` 时命令不再生效
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Causation {
    pub consumer: String,
    pub event_key: String,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new(BusinessContext::default())
    }
}

impl AppContext {
    pub fn new(biz: BusinessContext) -> Self {
        Self {
            biz,
            idempotency_key: None,
            causation: None,
            span: Span::none(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// 由订阅到的事件派生上下文：沿用上游业务语境，因果 ID 指向该事件
    pub fn caused_by(consumer: &str, event: &InboundEvent) -> Self {
        let key = event.natural_key();
        let span = tracing::info_span!("command", consumer = %consumer, cause = %key);

        Self {
            biz: event.event.context().caused_by(event.event.event_id()),
            idempotency_key: None,
            causation: Some(Causation {
                consumer: consumer.to_string(),
                event_key: key,
            }),
            span,
        }
    }
}
