//! 命令执行器（CommandExecutor）
//!
//! 一条命令在一个事务内完成：
//! 1. 开启事务；若命中幂等键返回首次回执，若上游事件已处理返回 `Duplicate`；
//! 2. 加载聚合（或以新 ID 分配）；
//! 3. 执行意图，聚合校验输入并给出事件，逐条应用并记录（版本单调递增）；
//! 4. 保存聚合状态（按版本乐观并发）；
//! 5. 将记录的事件规范序列化为 Outbox 条目，在同一事务内追加；
//! 6. 写入幂等回执与已处理事件标记，提交；
//! 7. 提交成功后把已序列化的事件交给进程内分发器；
//! 8. 返回回执。
//!
//! 提交失败时既没有状态变更也没有 Outbox 条目，分发器也不会收到事件。
//!
use crate::command::{Command, CommandEnvelope, Target};
use crate::context::AppContext;
use crate::dispatcher::EventDispatcher;
use crate::error::AppError;
use crate::receipt::CommandReceipt;
use bon::Builder;
use relay_domain::aggregate::Aggregate;
use relay_domain::clock::{Clock, SystemClock};
use relay_domain::domain_event::{EventEnvelope, EventRecord};
use relay_domain::entity::Entity;
use relay_domain::error::{DomainError, DomainResult};
use relay_domain::persist::{
    OutboxEntry, RelayStore, SerializedAggregate, SerializedEvent, serialize_events,
};
use relay_domain::value_object::Version;
use std::sync::Arc;
use tracing::{Instrument, debug, info, warn};

#[derive(Builder)]
pub struct CommandExecutor<S>
where
    S: RelayStore + 'static,
{
    store: Arc<S>,
    #[builder(default = Arc::new(EventDispatcher::default()))]
    dispatcher: Arc<EventDispatcher>,
    #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)]
    clock: Arc<dyn Clock>,
}

/// 事务内的执行结果
enum Outcome {
    Committed {
        receipt: CommandReceipt,
        events: Vec<SerializedEvent>,
    },
    Replayed(CommandReceipt),
}

impl<S> CommandExecutor<S>
where
    S: RelayStore + 'static,
{
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub async fn execute<A>(
        &self,
        ctx: &AppContext,
        cmd: CommandEnvelope<A>,
    ) -> Result<CommandReceipt, AppError>
    where
        A: Aggregate,
        A::Command: Command,
    {
        self.execute_traced(ctx, cmd)
            .instrument(ctx.span.clone())
            .await
    }

    async fn execute_traced<A>(
        &self,
        ctx: &AppContext,
        cmd: CommandEnvelope<A>,
    ) -> Result<CommandReceipt, AppError>
    where
        A: Aggregate,
        A::Command: Command,
    {
        let name = <A::Command as Command>::NAME;

        match self.execute_once(ctx, cmd).await {
            Ok(Outcome::Replayed(receipt)) => {
                info!(command = name, aggregate_id = %receipt.aggregate_id, "idempotent replay");
                Ok(receipt)
            }
            Ok(Outcome::Committed { receipt, events }) => {
                info!(
                    command = name,
                    aggregate_id = %receipt.aggregate_id,
                    version = %receipt.version,
                    events = events.len(),
                    "command committed"
                );
                self.dispatcher.dispatch(&events).await;
                Ok(receipt)
            }
            // 并发的同键提交在提交时才发现冲突：返回先提交者的回执
            Err(DomainError::Duplicate { key }) if ctx.causation.is_none() => {
                match self.replay::<A>(ctx).await? {
                    Some(receipt) => Ok(receipt),
                    None => Err(DomainError::Duplicate { key }.into()),
                }
            }
            Err(e) => {
                warn!(command = name, error = %e, "command failed");
                Err(e.into())
            }
        }
    }

    async fn execute_once<A>(
        &self,
        ctx: &AppContext,
        cmd: CommandEnvelope<A>,
    ) -> DomainResult<Outcome>
    where
        A: Aggregate,
    {
        let mut tx = self.store.begin().await?;
        match self.execute_in(&mut tx, ctx, cmd).await {
            Ok(Outcome::Committed { receipt, events }) => {
                self.store.commit(tx).await?;
                Ok(Outcome::Committed { receipt, events })
            }
            Ok(replayed) => {
                self.rollback(tx).await;
                Ok(replayed)
            }
            Err(e) => {
                self.rollback(tx).await;
                Err(e)
            }
        }
    }

    async fn execute_in<A>(
        &self,
        tx: &mut S::Tx,
        ctx: &AppContext,
        cmd: CommandEnvelope<A>,
    ) -> DomainResult<Outcome>
    where
        A: Aggregate,
    {
        if let Some(key) = &ctx.idempotency_key {
            if let Some(receipt) = self.store.find_receipt(tx, A::TYPE, key).await? {
                return Ok(Outcome::Replayed(decode_receipt(receipt)?));
            }
        }
        if let Some(causation) = &ctx.causation {
            if self
                .store
                .is_processed(tx, &causation.consumer, &causation.event_key)
                .await?
            {
                return Err(DomainError::Duplicate {
                    key: causation.event_key.clone(),
                });
            }
        }

        let mut aggregate = self.load::<A>(tx, cmd.target).await?;
        let expected = aggregate.version();
        let recorded = aggregate.execute(cmd.command)?;

        let now = self.clock.now();
        let mut record = EventRecord::<A>::new();
        let mut version = expected;
        for event in recorded {
            version = version.next();
            aggregate.apply(&event, version);
            record.record(EventEnvelope::new(
                aggregate.id(),
                version,
                event,
                now,
                ctx.biz.clone(),
            ));
        }

        let events = serialize_events(record.recorded_events())?;
        if !events.is_empty() {
            let state = SerializedAggregate::builder()
                .aggregate_id(aggregate.id().to_string())
                .aggregate_type(A::TYPE.to_string())
                .version(version)
                .state(serde_json::to_value(&aggregate)?)
                .build();
            self.store.save(tx, state, expected).await?;

            let entries = events
                .iter()
                .map(|e| OutboxEntry::pending(e, now))
                .collect::<DomainResult<Vec<_>>>()?;
            self.store.append_within(tx, entries).await?;
        }

        let receipt = CommandReceipt {
            aggregate_id: aggregate.id().to_string(),
            aggregate_type: A::TYPE.to_string(),
            version,
            event_ids: events.iter().map(|e| e.event_id().to_string()).collect(),
            replayed: false,
        };

        if let Some(key) = &ctx.idempotency_key {
            self.store
                .save_receipt(tx, A::TYPE, key, serde_json::to_value(&receipt)?)
                .await?;
        }
        if let Some(causation) = &ctx.causation {
            self.store
                .mark_processed(tx, &causation.consumer, &causation.event_key)
                .await?;
        }

        Ok(Outcome::Committed { receipt, events })
    }

    async fn load<A>(&self, tx: &mut S::Tx, target: Target<A::Id>) -> DomainResult<A>
    where
        A: Aggregate,
    {
        match target {
            Target::New => {
                let minted = uuid::Uuid::new_v4().to_string();
                let id = minted.parse::<A::Id>().map_err(|_| {
                    DomainError::invalid_input(format!("{} ids cannot be minted", A::TYPE))
                })?;
                Ok(A::new(id, Version::new()))
            }
            Target::Create(id) => {
                let key = id.to_string();
                if let Some(row) = self.store.load(tx, A::TYPE, &key).await? {
                    return Err(DomainError::invalid_input(format!(
                        "{} {key} already exists at version {}",
                        A::TYPE,
                        row.version()
                    )));
                }
                Ok(A::new(id, Version::new()))
            }
            Target::Existing(id) => {
                let key = id.to_string();
                let row = self
                    .store
                    .load(tx, A::TYPE, &key)
                    .await?
                    .ok_or_else(|| DomainError::not_found(format!("{} {key}", A::TYPE)))?;
                row.to_aggregate::<A>()
            }
        }
    }

    async fn replay<A>(&self, ctx: &AppContext) -> DomainResult<Option<CommandReceipt>>
    where
        A: Aggregate,
    {
        let Some(key) = &ctx.idempotency_key else {
            return Ok(None);
        };
        let mut tx = self.store.begin().await?;
        let found = self.store.find_receipt(&mut tx, A::TYPE, key).await;
        self.rollback(tx).await;
        found?.map(decode_receipt).transpose()
    }

    async fn rollback(&self, tx: S::Tx) {
        if let Err(e) = self.store.rollback(tx).await {
            debug!(error = %e, "rollback failed");
        }
    }
}

fn decode_receipt(value: serde_json::Value) -> DomainResult<CommandReceipt> {
    let mut receipt: CommandReceipt = serde_json::from_value(value)?;
    receipt.replayed = true;
    Ok(receipt)
}
