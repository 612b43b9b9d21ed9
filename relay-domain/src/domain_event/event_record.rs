use std::slice::Iter;
use std::vec::IntoIter;

use crate::aggregate::Aggregate;

use super::event_envelope::EventEnvelope;

/// 未提交事件记录
///
/// 由工作单元（命令执行器）持有的值类型缓冲区，而不是挂在聚合上的可变状态：
/// - 顺序与记录调用顺序一致，不做去重；
/// - 记录本身不会失败，所在工作单元失败时整体丢弃；
/// - 持久化成功后由执行器清空，聚合自身从不读取或发布它。
pub struct EventRecord<A>
where
    A: Aggregate,
{
    events: Vec<EventEnvelope<A>>,
}

impl<A> Default for EventRecord<A>
where
    A: Aggregate,
{
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<A> EventRecord<A>
where
    A: Aggregate,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条事件
    pub fn record(&mut self, envelope: EventEnvelope<A>) {
        self.events.push(envelope);
    }

    /// 已记录事件（按记录顺序）
    pub fn recorded_events(&self) -> &[EventEnvelope<A>] {
        &self.events
    }

    /// 清空记录
    pub fn clear_recorded(&mut self) {
        self.events.clear();
    }

    /// 取走全部记录并清空
    pub fn take(&mut self) -> Vec<EventEnvelope<A>> {
        std::mem::take(&mut self.events)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, EventEnvelope<A>> {
        self.events.iter()
    }
}

impl<A> IntoIterator for EventRecord<A>
where
    A: Aggregate,
{
    type Item = EventEnvelope<A>;
    type IntoIter = IntoIter<EventEnvelope<A>>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}
