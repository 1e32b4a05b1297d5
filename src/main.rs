//! Steward - main entry point.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use steward::agent::{Agent, AgentDeps, DebateOrchestrator, SessionManager, SubagentDispatcher};
use steward::channels::ChannelManager;
use steward::config::Config;
use steward::history::{FileJobStore, FileTranscriptStore, FileTurnLog, TurnLog};
use steward::llm::{FallbackChain, ProviderRegistry};
use steward::scheduler::{Scheduler, spawn_scheduler};

#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(about = "Personal AI assistant runtime with multi-backend routing and scheduling")]
#[command(version)]
struct Args {
    /// Configuration file path (default: ~/.steward/config.json)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Disable the job scheduler for this run
    #[arg(long)]
    no_scheduler: bool,

    /// Answer a single prompt on the default model and exit
    #[arg(short, long)]
    prompt: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("steward=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    tracing::info!("Starting steward...");

    let mut config = Config::load(args.config.as_deref())?;
    if args.no_scheduler {
        config.scheduler.enabled = false;
    }
    config.ensure_data_dir()?;

    let registry = Arc::new(ProviderRegistry::from_descriptors(
        config.backend_descriptors()?,
    )?);
    tracing::info!(
        default_provider = %registry.default_provider(),
        backends = registry.overview().len(),
        "provider registry initialized"
    );

    let chain = Arc::new(FallbackChain::new(
        Arc::clone(&registry),
        config.fallbacks.clone(),
    ));

    let turn_log: Arc<dyn TurnLog> = Arc::new(FileTurnLog::open(&config.data_dir).await?);
    let job_store = Arc::new(FileJobStore::open(&config.data_dir).await?);
    let transcripts = Arc::new(FileTranscriptStore::open(&config.data_dir).await?);

    let subagents = Arc::new(SubagentDispatcher::new(
        Arc::clone(&registry),
        config.subagent_system_prompt.clone(),
        Vec::new(),
        config.subagent_timeout,
    ));
    let debates = Arc::new(DebateOrchestrator::new(
        Arc::clone(&subagents),
        Arc::clone(&registry),
        transcripts,
    ));

    let channels = Arc::new(ChannelManager::new());

    let agent = Arc::new(Agent::new(AgentDeps {
        registry: Arc::clone(&registry),
        chain,
        sessions: Arc::new(SessionManager::new()),
        turn_log,
        channels: Arc::clone(&channels),
        subagents,
        debates,
        subagents_enabled: config.subagents_enabled,
        context_quota: config.context_quota,
        system_prompt: config.system_prompt.clone(),
        tools: Vec::new(),
    }));

    let restored = agent.restore_sessions().await?;
    tracing::info!(sessions = restored, "agent initialized");

    if let Some(prompt) = args.prompt {
        // One-shot mode: run a single turn on an ad-hoc CLI channel
        let reply = agent
            .handle_message(steward::channels::IncomingMessage::new("cli", prompt))
            .await?;
        println!("{}", reply.content);
        return Ok(());
    }

    let scheduler = Arc::new(Scheduler::new(
        job_store,
        Arc::clone(&agent) as Arc<dyn steward::scheduler::JobRunner>,
        config.scheduler.clone(),
    ));
    let scheduler_handle = spawn_scheduler(scheduler);

    tracing::info!("steward running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    scheduler_handle.abort();

    Ok(())
}
