mod bus;
mod collaborators;
mod config;
mod exec;
mod gateway;
mod store;
mod workflow;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use bus::BroadcastBus;
use config::OrchestratorConfig;
use exec::{
    FsContextGatherer, MemorySubtaskSink, MemoryTaskStatusSink, ShellCommandExecutor,
    ShellQualityAnalyzer, ShellTestRunner, UnconfiguredFileEditor, YamlPlanner,
};
use gateway::{ChannelListener, EventFanOutGateway, ListenerTransport, StaticTokenAuthenticator};
use store::{FileStateStore, MemoryStateCache};
use workflow::{Collaborators, TaskOrchestrator, WorkflowService, WorkflowStateMachine};

#[derive(Parser)]
#[command(name = "autodev")]
#[command(about = "Autonomous coding task orchestrator")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file (defaults apply without one)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a task's plan against a repository
    Run {
        #[arg(long)]
        task_id: String,
        /// Repository root the task operates on
        #[arg(long)]
        repo: PathBuf,
        /// YAML file mapping task ids to execution plans
        #[arg(long)]
        plan: PathBuf,
    },
    /// Print the current progress aggregate for a task
    Status {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        plan: PathBuf,
    },
    /// Retry a failed task from the top (resets the retry counter)
    Retry {
        #[arg(long)]
        task_id: String,
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("autodev=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            task_id,
            repo,
            plan,
        } => {
            let service = build_service(&config, &repo, &plan).await?;
            run_and_watch(&service, &config, &task_id, &repo, false).await
        }
        Command::Status {
            task_id,
            repo,
            plan,
        } => {
            let service = build_service(&config, &repo, &plan).await?;
            let progress = service.workflow_status(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(())
        }
        Command::Retry {
            task_id,
            repo,
            plan,
        } => {
            let service = build_service(&config, &repo, &plan).await?;
            run_and_watch(&service, &config, &task_id, &repo, true).await
        }
    }
}

struct Service {
    workflow: WorkflowService,
    gateway: Arc<EventFanOutGateway>,
}

impl Service {
    async fn workflow_status(&self, task_id: &str) -> Result<workflow::TaskProgress> {
        Ok(self.workflow.workflow_status(task_id).await?)
    }
}

async fn build_service(
    config: &OrchestratorConfig,
    repo: &std::path::Path,
    plan: &std::path::Path,
) -> Result<Service> {
    let store = Arc::new(FileStateStore::new(repo.join(&config.state_dir)));
    let cache = Arc::new(MemoryStateCache::new());
    let bus = Arc::new(BroadcastBus::new());
    let task_status = Arc::new(MemoryTaskStatusSink::new());

    let state_machine = Arc::new(WorkflowStateMachine::new(
        store,
        cache,
        bus.clone(),
        task_status,
        Duration::from_secs(config.cache_ttl_secs),
    ));

    let gateway = Arc::new(EventFanOutGateway::new(Arc::new(
        StaticTokenAuthenticator::new(config.auth_token.clone()),
    )));
    gateway.bridge_bus(bus.as_ref()).await?;

    let command_timeout = Duration::from_secs(config.command_timeout_secs);
    let collaborators = Collaborators {
        planner: Arc::new(YamlPlanner::new(plan.to_path_buf())),
        subtasks: Arc::new(MemorySubtaskSink::new()),
        editor: Arc::new(UnconfiguredFileEditor),
        commands: Arc::new(ShellCommandExecutor::new(command_timeout)),
        tests: Arc::new(ShellTestRunner::new(
            config.test_command.clone(),
            command_timeout,
        )),
        quality: Arc::new(ShellQualityAnalyzer::new(
            config.lint_command.clone(),
            config.format_command.clone(),
            command_timeout,
        )),
        context: Arc::new(FsContextGatherer),
    };

    let orchestrator = Arc::new(TaskOrchestrator::new(
        state_machine,
        collaborators,
        bus,
        gateway.clone(),
        config.max_retries,
        config.quality_format_threshold,
    ));

    Ok(Service {
        workflow: WorkflowService::new(orchestrator),
        gateway,
    })
}

/// Launches (or retries) the task, mirrors its live events to stdout, and
/// prints the final progress aggregate.
async fn run_and_watch(
    service: &Service,
    config: &OrchestratorConfig,
    task_id: &str,
    repo: &std::path::Path,
    retry: bool,
) -> Result<()> {
    let (listener, mut events) = ChannelListener::new(format!("cli-{}", uuid::Uuid::new_v4()));
    let credentials = config.auth_token.clone().unwrap_or_default();
    service
        .gateway
        .on_connect(listener.clone(), &credentials)
        .await?;
    service.gateway.subscribe(listener.id(), task_id).await;

    let printer = tokio::spawn(async move {
        while let Some(pushed) = events.recv().await {
            println!("[{}] {}", pushed.event, pushed.payload);
        }
    });

    let (receipt, handle) = if retry {
        service.workflow.retry_workflow(task_id, repo).await?
    } else {
        service.workflow.start_workflow(task_id, repo)
    };
    tracing::info!(task_id = %receipt.task_id, "{}", receipt.message);

    handle.await?;

    service.gateway.on_disconnect(listener.id()).await;
    printer.abort();

    let progress = service.workflow_status(task_id).await?;
    println!("{}", serde_json::to_string_pretty(&progress)?);
    Ok(())
}
