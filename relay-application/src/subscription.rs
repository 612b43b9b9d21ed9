//! 订阅到命令的桥接（CommandBinding）
//!
//! 把订阅端收到的事件映射为本服务的命令，并在同一事务中写入“已处理事件”标记；
//! 重复投递的事件返回 `Duplicate`，订阅循环据此提交位点而不产生副作用。
//!
use crate::command::{Command, CommandEnvelope};
use crate::context::AppContext;
use crate::executor::CommandExecutor;
use async_trait::async_trait;
use relay_domain::aggregate::Aggregate;
use relay_domain::error::DomainResult;
use relay_domain::eventing::{InboundEvent, MessageHandler};
use relay_domain::persist::RelayStore;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

pub struct CommandBinding<S, A, F>
where
    S: RelayStore + 'static,
    A: Aggregate,
{
    name: String,
    executor: Arc<CommandExecutor<S>>,
    map: F,
    _aggregate: PhantomData<fn() -> A>,
}

impl<S, A, F> CommandBinding<S, A, F>
where
    S: RelayStore + 'static,
    A: Aggregate,
    A::Command: Command,
    F: Fn(&InboundEvent) -> DomainResult<Option<CommandEnvelope<A>>> + Send + Sync + 'static,
{
    /// `name` 同时作为已处理事件集合中的消费者名
    pub fn new(name: impl Into<String>, executor: Arc<CommandExecutor<S>>, map: F) -> Self {
        Self {
            name: name.into(),
            executor,
            map,
            _aggregate: PhantomData,
        }
    }
}

#[async_trait]
impl<S, A, F> MessageHandler for CommandBinding<S, A, F>
where
    S: RelayStore + 'static,
    A: Aggregate,
    A::Command: Command,
    F: Fn(&InboundEvent) -> DomainResult<Option<CommandEnvelope<A>>> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &InboundEvent) -> DomainResult<()> {
        let Some(cmd) = (self.map)(event)? else {
            debug!(
                binding = %self.name,
                key = %event.natural_key(),
                "event not mapped to a command"
            );
            return Ok(());
        };

        let ctx = AppContext::caused_by(&self.name, event);
        self.executor
            .execute(&ctx, cmd)
            .await
            .map(|_| ())
            .map_err(|e| e.into_domain())
    }
}
