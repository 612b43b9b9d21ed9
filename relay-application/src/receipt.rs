use relay_domain::value_object::Version;
use serde::{Deserialize, Serialize};

/// 命令执行结果（调用方可见）
///
/// 携带幂等键时回执与状态同事务保存，重复提交原样返回并置 `replayed`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReceipt {
    pub aggregate_id: String,
    pub aggregate_type: String,
    /// 执行后的聚合版本
    pub version: Version,
    /// 本次记录的事件 ID（按版本顺序）
    pub event_ids: Vec<String>,
    #[serde(skip)]
    pub replayed: bool,
}

impl CommandReceipt {
    pub fn event_count(&self) -> usize {
        self.event_ids.len()
    }
}
