//! `turncode`
//!
//! Runs Claude Code turns from the command line. Session chains are kept in
//! a JSON state file so successive invocations continue the same
//! conversations. Results go to stdout as JSON, logs to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use turncode_core::config::{self, Config, ResolverConfig};
use turncode_core::tracing_init::{default_filter, init_tracing};
use turncode_runner::{
    AgentId, ExecutionOptions, ExecutionRequest, Orchestrator, SessionSnapshot, SessionTracker,
};

#[derive(Parser, Debug)]
#[command(name = "turncode")]
#[command(version, about = "Run Claude Code turns with chained sessions")]
struct Cli {
    /// Project directory whose `.turncode/settings.json` is merged into the
    /// configuration (defaults to the current directory)
    #[arg(long, global = true, env = "TURNCODE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Run this `claude` executable directly instead of through the shell
    #[arg(long, global = true)]
    claude_path: Option<PathBuf>,

    /// Maximum concurrent Claude processes
    #[arg(long, global = true)]
    max_parallel: Option<usize>,

    /// Attempts per request, including the first
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Default per-turn timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Log level filter (e.g. "info", "debug")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, global = true, env = "TURNCODE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one turn for one agent
    Run(RunArgs),
    /// Run a JSON array of requests concurrently
    Batch {
        /// File containing `[{"agent_id", "prompt", "working_directory", ...}]`
        file: PathBuf,
        /// Session state file to resume from and update
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Print recorded session chains
    Chain {
        /// Session state file
        #[arg(long)]
        state: PathBuf,
        /// Only this agent's tokens
        #[arg(long)]
        agent: Option<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Agent identity
    #[arg(long)]
    agent: String,

    /// Working directory owned by the agent
    #[arg(long)]
    dir: PathBuf,

    /// Session state file to resume from and update
    #[arg(long)]
    state: Option<PathBuf>,

    /// Text appended to the system prompt
    #[arg(long)]
    system_prompt: Option<String>,

    /// Tool to pre-approve (repeatable)
    #[arg(long = "allowed-tool")]
    allowed_tools: Vec<String>,

    /// Tool to forbid (repeatable)
    #[arg(long = "disallowed-tool")]
    disallowed_tools: Vec<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    max_turns: Option<u32>,

    /// MCP server configuration file for this turn
    #[arg(long)]
    mcp_config: Option<PathBuf>,

    /// Prompt for this turn
    prompt: String,
}

impl Cli {
    /// Flags override every other configuration layer.
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(path) = &self.claude_path {
            config.executor.resolver = ResolverConfig::ExplicitPath { path: path.clone() };
        }
        if let Some(n) = self.max_parallel {
            config.concurrency.max_parallel = n;
        }
        if let Some(n) = self.max_attempts {
            config.retry.max_attempts = n;
        }
        if let Some(n) = self.timeout_secs {
            config.executor.default_timeout_secs = n;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let project_dir = cli
        .project_dir
        .clone()
        .or_else(|| std::env::current_dir().ok());
    let mut config = config::load_config(project_dir.as_deref())?;
    cli.apply_overrides(&mut config);
    config::validate(&config)?;

    init_tracing(&default_filter(&config.log_level), cli.log_json);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting turncode");

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Batch { file, state } => batch(config, &file, state.as_deref()).await,
        Command::Chain { state, agent } => chain(&state, agent),
    }
}

async fn run(config: Config, args: RunArgs) -> anyhow::Result<ExitCode> {
    let tracker = load_tracker(args.state.as_deref())?;
    let orchestrator = Arc::new(Orchestrator::with_tracker(config, tracker)?);
    shutdown_on_ctrl_c(&orchestrator);

    let options = ExecutionOptions {
        system_prompt: args.system_prompt,
        allowed_tools: args.allowed_tools,
        disallowed_tools: args.disallowed_tools,
        model: args.model,
        max_turns: args.max_turns,
        mcp_config: args.mcp_config,
        ..ExecutionOptions::default()
    };
    let result = orchestrator
        .execute(args.agent, args.prompt, args.dir, options)
        .await;

    if let Some(path) = &args.state {
        save_snapshot(path, &orchestrator.session_snapshot().await)?;
    }
    print_json(&result)?;
    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn batch(config: Config, file: &Path, state: Option<&Path>) -> anyhow::Result<ExitCode> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read batch file {}", file.display()))?;
    let requests: Vec<ExecutionRequest> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse batch file {}", file.display()))?;

    let tracker = load_tracker(state)?;
    let orchestrator = Arc::new(Orchestrator::with_tracker(config, tracker)?);
    shutdown_on_ctrl_c(&orchestrator);

    let results = orchestrator.execute_batch(requests).await;

    if let Some(path) = state {
        save_snapshot(path, &orchestrator.session_snapshot().await)?;
    }
    print_json(&results)?;
    Ok(if results.all_succeeded() && !results.was_cancelled() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn chain(state: &Path, agent: Option<String>) -> anyhow::Result<ExitCode> {
    let snapshot = read_snapshot(state)?.unwrap_or_default();
    match agent {
        Some(agent) => {
            let tokens: Vec<String> = snapshot
                .agents
                .get(&AgentId::new(agent))
                .map(|entries| entries.iter().map(|e| e.token.clone()).collect())
                .unwrap_or_default();
            print_json(&tokens)?;
        }
        None => print_json(&snapshot)?,
    }
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::print_stdout)]
fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn shutdown_on_ctrl_c(orchestrator: &Arc<Orchestrator>) {
    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling running executions");
            orchestrator.shutdown();
        }
    });
}

fn read_snapshot(path: &Path) -> anyhow::Result<Option<SessionSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    let snapshot = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse state file {}", path.display()))?;
    Ok(Some(snapshot))
}

fn load_tracker(path: Option<&Path>) -> anyhow::Result<SessionTracker> {
    let snapshot = match path {
        Some(path) => read_snapshot(path)?.unwrap_or_default(),
        None => SessionSnapshot::default(),
    };
    Ok(SessionTracker::from_snapshot(snapshot))
}

/// Write through a temporary file so an interrupted save keeps the old state.
fn save_snapshot(path: &Path, snapshot: &SessionSnapshot) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)
        .with_context(|| format!("Failed to write state file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace state file {}", path.display()))?;
    Ok(())
}
