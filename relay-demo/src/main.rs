//! 端到端演示：创建用户 → Outbox → 中间件 → 订阅端排队欢迎邮件
//!
//! 运行：`cargo run -p relay-demo -- --config relay-demo/relay.toml`
//! 日志级别由 `RUST_LOG` 控制，`--json` 输出结构化日志。
//!
use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use relay_application::{
    AppContext, Command, CommandBinding, CommandEnvelope, CommandExecutor, EventDispatcher,
    EventHandler, HandledEventType, RelayConfig, RelayRuntime,
};
use relay_domain::aggregate::Aggregate;
use relay_domain::domain_event::{BusinessContext, DomainEvent};
use relay_domain::entity::Entity;
use relay_domain::error::{DomainError, DomainResult};
use relay_domain::eventing::{CountingMetrics, InMemoryBroker, InboundEvent, TopicMap};
use relay_domain::persist::{InMemoryStore, OutboxStore, SerializedEvent};
use relay_domain::value_object::Version;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "relay-demo", about = "Transactional outbox pipeline demo")]
struct Args {
    /// TOML 配置文件；缺省时使用内置默认值
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// 以 JSON 输出日志
    #[arg(long)]
    json: bool,

    /// 要创建的用户 ID
    #[arg(long, default_value = "u1")]
    user: String,

    #[arg(long, default_value = "u1@example.com")]
    email: String,

    /// 等待管道排空的上限（秒）
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct User {
    id: String,
    version: Version,
    email: String,
}

#[derive(Debug)]
enum UserCommand {
    Create { email: String },
}

impl Command for UserCommand {
    const NAME: &'static str = "UserCommand";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum UserEvent {
    UserCreated { email: String },
}

impl DomainEvent for UserEvent {
    fn event_type(&self) -> &'static str {
        "UserCreated"
    }
}

impl Entity for User {
    type Id = String;

    fn new(id: Self::Id, version: Version) -> Self {
        Self {
            id,
            version,
            ..Default::default()
        }
    }

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> Version {
        self.version
    }
}

impl Aggregate for User {
    const TYPE: &'static str = "user";
    type Command = UserCommand;
    type Event = UserEvent;

    fn execute(&self, command: Self::Command) -> DomainResult<Vec<Self::Event>> {
        match command {
            UserCommand::Create { email } if email.contains('@') => {
                Ok(vec![UserEvent::UserCreated { email }])
            }
            UserCommand::Create { email } => {
                Err(DomainError::invalid_input(format!("invalid email: {email}")))
            }
        }
    }

    fn apply(&mut self, event: &Self::Event, version: Version) {
        match event {
            UserEvent::UserCreated { email } => self.email = email.clone(),
        }
        self.version = version;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Mailbox {
    id: String,
    version: Version,
    queued: Vec<String>,
}

#[derive(Debug)]
struct QueueWelcome {
    email: String,
}

impl Command for QueueWelcome {
    const NAME: &'static str = "QueueWelcome";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum MailboxEvent {
    WelcomeQueued { email: String },
}

impl DomainEvent for MailboxEvent {
    fn event_type(&self) -> &'static str {
        "WelcomeQueued"
    }
}

impl Entity for Mailbox {
    type Id = String;

    fn new(id: Self::Id, version: Version) -> Self {
        Self {
            id,
            version,
            ..Default::default()
        }
    }

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> Version {
        self.version
    }
}

impl Aggregate for Mailbox {
    const TYPE: &'static str = "mailbox";
    type Command = QueueWelcome;
    type Event = MailboxEvent;

    fn execute(&self, command: Self::Command) -> DomainResult<Vec<Self::Event>> {
        Ok(vec![MailboxEvent::WelcomeQueued {
            email: command.email,
        }])
    }

    fn apply(&mut self, event: &Self::Event, version: Version) {
        match event {
            MailboxEvent::WelcomeQueued { email } => self.queued.push(email.clone()),
        }
        self.version = version;
    }
}

/// 进程内审计日志
struct AuditLog;

#[async_trait]
impl EventHandler for AuditLog {
    fn handler_name(&self) -> &str {
        "audit-log"
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::All
    }

    async fn handle(&self, event: &SerializedEvent) -> anyhow::Result<()> {
        info!(
            event_type = %event.event_type(),
            aggregate_id = %event.aggregate_id(),
            version = event.event_version(),
            "audit"
        );
        Ok(())
    }
}

fn welcome(inbound: &InboundEvent) -> DomainResult<Option<CommandEnvelope<Mailbox>>> {
    match inbound.event.decode_payload::<User>()? {
        UserEvent::UserCreated { email } => Ok(Some(CommandEnvelope::create(
            format!("mailbox-{}", inbound.event.aggregate_id()),
            QueueWelcome { email },
        ))),
    }
}

fn init_tracing(json: bool) {
    let builder = fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        warn!(error = %e, "tracing init failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json);

    let config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    };

    let store = Arc::new(InMemoryStore::new());
    let broker = Arc::new(InMemoryBroker::default());
    let metrics = Arc::new(CountingMetrics::new());

    let dispatcher = Arc::new(EventDispatcher::new(metrics.clone()));
    dispatcher.register_handler(Arc::new(AuditLog));
    let executor = Arc::new(
        CommandExecutor::builder()
            .store(store.clone())
            .dispatcher(dispatcher)
            .build(),
    );

    let handle = RelayRuntime::bootstrap(config, store.clone(), broker.clone())
        .await?
        .topics(
            TopicMap::new()
                .route("UserCreated", "user.created")
                .route("WelcomeQueued", "mailbox.events"),
        )
        .metrics(metrics.clone())
        .subscribe(
            "user.created",
            Arc::new(CommandBinding::new("welcome-mailer", executor.clone(), welcome)),
        )
        .start();

    let ctx = AppContext::new(
        BusinessContext::builder()
            .correlation_id(uuid::Uuid::new_v4().to_string())
            .actor_type("cli".into())
            .build(),
    )
    .with_span(tracing::info_span!("demo", user = %args.user));
    let signup = CommandEnvelope::<User>::create(
        args.user.clone(),
        UserCommand::Create { email: args.email },
    );
    let receipt = executor.execute(&ctx, signup).await?;
    info!(aggregate_id = %receipt.aggregate_id, version = %receipt.version, "user created");

    let drained = async {
        loop {
            match store.status_counts().await {
                Ok(counts) if counts.outstanding() == 0 && counts.published >= 2 => break,
                Ok(_) => {}
                Err(e) => warn!(error = %e, "status query failed"),
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => warn!("interrupted"),
        result = tokio::time::timeout(Duration::from_secs(args.timeout), drained) => {
            if result.is_err() {
                warn!(timeout = args.timeout, "pipeline did not drain in time");
            }
        }
    }

    for topic in ["user.created", "mailbox.events"] {
        for received in broker.messages(topic).await {
            info!(
                topic,
                key = %received.message.key,
                partition = received.partition,
                offset = received.offset,
                event_type = received.message.header("eventType").unwrap_or_default(),
                "delivered"
            );
        }
    }
    info!(metrics = ?metrics.snapshot(), counts = ?store.status_counts().await?, "pipeline state");

    handle.shutdown();
    handle.join().await?;
    Ok(())
}
