use relay_domain::aggregate::Aggregate;

/// 应用层命令（Command）
///
/// 表达“意图”的写操作请求，作为聚合的 `Aggregate::Command` 使用。
/// - 建议保持语义化的“动宾结构”命名，如 `CreateUser`、`CloseOrder`。
///
/// 关联常量：
/// - `NAME`：命令的稳定名称，用于日志与追踪。避免依赖 `type_name::<T>()`。
pub trait Command: Send + 'static {
    /// 命令的稳定名称（建议常量字符串，不随重构变化）
    const NAME: &'static str;
}

/// 命令作用的聚合
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target<Id> {
    /// 新建聚合，ID 由服务端生成
    New,
    /// 以调用方给定的 ID 新建聚合；ID 已存在时失败
    Create(Id),
    /// 已存在的聚合
    Existing(Id),
}

/// 命令信封：目标聚合 + 意图与输入
#[derive(Debug, Clone)]
pub struct CommandEnvelope<A>
where
    A: Aggregate,
{
    pub target: Target<A::Id>,
    pub command: A::Command,
}

impl<A> CommandEnvelope<A>
where
    A: Aggregate,
{
    pub fn new(command: A::Command) -> Self {
        Self {
            target: Target::New,
            command,
        }
    }

    pub fn create(id: A::Id, command: A::Command) -> Self {
        Self {
            target: Target::Create(id),
            command,
        }
    }

    pub fn existing(id: A::Id, command: A::Command) -> Self {
        Self {
            target: Target::Existing(id),
            command,
        }
    }
}
