//! infer - agentic chat in the terminal
//!
//! - `infer` / `infer chat` - interactive session with tool approvals
//! - `infer agent "<task>"` - unattended run of a single task

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use infer_core::agent::{
    policy_for_mode, AgentMode, AgentOrchestrator, AgentServices, ChannelPublisher, ChatEvent,
    EventApprovalService, EventPublisher, OrchestratorConfig, RegistryExecutor,
};
use infer_core::ai::GatewayClient;
use infer_core::conversation::InMemoryConversation;
use infer_core::shells::BackgroundShellService;
use infer_core::tools::{register_builtin_tools, ToolRegistry};
use infer_core::{paths, InferConfig};

mod render;
mod repl;

/// infer - agentic chat CLI
#[derive(Parser)]
#[command(name = "infer")]
#[command(about = "Chat with a model that can read, write and run things", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.infer/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model override
    #[arg(long, global = true)]
    model: Option<String>,

    /// Approval mode: standard, plan or auto_accept
    #[arg(long, global = true)]
    mode: Option<AgentMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (the default)
    Chat,

    /// Run one task without a human in the loop
    ///
    /// Tool calls are never prompted for; calls a policy would still
    /// gate are rejected.
    Agent {
        /// What the agent should do
        task: String,
    },
}

/// Everything one session runs on
pub(crate) struct Session {
    pub orchestrator: AgentOrchestrator,
    pub shells: Arc<BackgroundShellService>,
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
    pub config: InferConfig,
}

impl Session {
    async fn build(config: InferConfig, mode: AgentMode, is_chat_mode: bool) -> Result<Self> {
        let (publisher, events) = ChannelPublisher::new();
        let publisher: Arc<dyn EventPublisher> = Arc::new(publisher);

        let shells = Arc::new(
            BackgroundShellService::new(config.shells.clone()).with_events(publisher.clone()),
        );
        shells.start_cleanup_routine();

        let registry = Arc::new(ToolRegistry::new().with_timeout(config.agent.tool_timeout()));
        register_builtin_tools(&registry).await;

        let working_dir = std::env::current_dir().context("Failed to read working directory")?;
        let executor = RegistryExecutor::new(registry, working_dir)
            .with_shells(shells.clone())
            .with_timeout(config.agent.tool_timeout())
            .with_max_output_chars(config.agent.max_tool_output_chars);

        let services = AgentServices::builder()
            .chat(Arc::new(GatewayClient::new(&config.gateway)?))
            .tools(Arc::new(executor))
            .approvals(Arc::new(EventApprovalService::new(
                publisher.clone(),
                config.agent.approval_timeout(),
            )))
            .conversation(Arc::new(InMemoryConversation::new()))
            .events(publisher)
            .build()?;

        let orchestrator_config = OrchestratorConfig {
            is_chat_mode,
            ..OrchestratorConfig::from_config(&config)
        };
        let policy = policy_for_mode(mode, &config.approval);
        tracing::info!(
            model = %orchestrator_config.model,
            mode = %mode,
            chat = is_chat_mode,
            "Session ready"
        );

        Ok(Self {
            orchestrator: AgentOrchestrator::new(services, orchestrator_config, policy),
            shells,
            events,
            config,
        })
    }
}

fn init_logging() -> Result<()> {
    let log_dir = paths::logs_dir();
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("Failed to create log directory: {}", e);
    }

    #[cfg(unix)]
    let null_device = "/dev/null";
    #[cfg(windows)]
    let null_device = "NUL";

    let log_file = match std::fs::File::create(log_dir.join("infer.log")) {
        Ok(file) => file,
        Err(e) => {
            eprintln!(
                "Failed to create log file: {}, falling back to null device",
                e
            );
            std::fs::File::create(null_device)
                .with_context(|| format!("Failed to open null device {}", null_device))?
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let mut config = InferConfig::load(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.agent.model = model;
    }
    let mode = cli.mode.unwrap_or(config.approval.mode);

    let result = match cli.command {
        Some(Commands::Agent { task }) => {
            let mut session = Session::build(config, mode, false).await?;
            let result = repl::run_task(&mut session, task).await;
            session.shells.stop().await;
            result
        }
        Some(Commands::Chat) | None => {
            let mut session = Session::build(config, mode, true).await?;
            let result = repl::run(&mut session, mode).await;
            session.shells.stop().await;
            result
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "infer exited with an error");
    }
    result
}
