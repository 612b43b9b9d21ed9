//! 领域事件（Domain Event）与事件记录
//!
//! 定义事件载荷需要实现的最小接口（`DomainEvent`）、将事件与元数据/上下文
//! 封装后的 `EventEnvelope`，以及工作单元持有的未提交事件记录 `EventRecord`。

mod business_context;
mod domain_event_trait;
mod event_envelope;
mod event_record;
mod metadata;

pub use business_context::BusinessContext;
pub use domain_event_trait::DomainEvent;
pub use event_envelope::EventEnvelope;
pub use event_record::EventRecord;
pub use metadata::Metadata;
