//! Recursive investigation agent CLI.
//!
//! `planter solve` runs one session against a workspace and streams its
//! progress; `planter sessions` and `planter events` read the session files
//! under `<workspace>/<session_dir>/`.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use planter::core::provider::ProviderChoice;
use planter::core::types::{DeltaKind, ReasoningEffort, SolveStatus, StepRecord};
use planter::engine::build_engine;
use planter::exit_codes;
use planter::io::config::AgentConfig;
use planter::io::session_store::SessionStore;
use planter::logging;
use planter::runtime::SessionRuntime;
use planter::runtime::manager::{SessionCallbacks, SessionManager};

#[derive(Parser)]
#[command(name = "planter", version, about = "Recursive investigation agent")]
struct Cli {
    /// Log engine diagnostics to stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Investigate an objective and print the final answer.
    Solve(SolveArgs),
    /// List sessions, most recent first.
    Sessions {
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print a session's event log as JSON lines.
    Events {
        session_id: String,
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
}

#[derive(Args)]
struct SolveArgs {
    objective: String,
    /// Workspace root the sandbox is confined to (default: current directory).
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// openai, anthropic, openrouter, cerebras or auto.
    #[arg(long)]
    provider: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// low, medium or high.
    #[arg(long)]
    reasoning_effort: Option<String>,
    /// Session id to create, or to continue with --resume.
    #[arg(long)]
    session: Option<String>,
    #[arg(long, requires = "session")]
    resume: bool,
    #[arg(long)]
    max_depth: Option<u32>,
    #[arg(long)]
    max_steps: Option<u32>,
    /// Wall-clock limit for the whole session; 0 means unbounded.
    #[arg(long)]
    max_seconds: Option<u64>,
    /// Disable subtask delegation.
    #[arg(long)]
    no_recursion: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Solve(args) => cmd_solve(args),
        Command::Sessions { workspace, limit } => cmd_sessions(workspace, limit),
        Command::Events {
            session_id,
            workspace,
        } => cmd_events(workspace, &session_id),
    }
}

fn cmd_solve(args: SolveArgs) -> Result<i32> {
    let workspace = workspace_or_cwd(args.workspace)?;
    let mut config = AgentConfig::from_env(&workspace).context("load configuration")?;
    if let Some(provider) = args.provider.as_deref() {
        config.provider = provider
            .parse::<ProviderChoice>()
            .map_err(|err| anyhow!(err))?;
    }
    if let Some(model) = args.model {
        config.model = model;
    }
    if let Some(effort) = args.reasoning_effort.as_deref() {
        config.reasoning_effort =
            ReasoningEffort::parse_optional(effort).map_err(|err| anyhow!(err))?;
    }
    if let Some(max_depth) = args.max_depth {
        config.budget.max_depth = max_depth;
    }
    if let Some(max_steps) = args.max_steps {
        config.budget.max_steps_per_call = max_steps;
    }
    if let Some(max_seconds) = args.max_seconds {
        config.budget.max_solve_seconds = max_seconds;
    }
    if args.no_recursion {
        config.budget.recursive = false;
    }
    config.validate().context("validate configuration")?;

    let engine = build_engine(&config)?;
    let runtime = SessionRuntime::bootstrap(engine, &config, args.session.as_deref(), args.resume)?;
    eprintln!("session {}", runtime.session_id());

    let manager = SessionManager::new();
    let callbacks = SessionCallbacks {
        on_event: Box::new(|message: &str| eprintln!("  {message}")),
        on_step: Box::new(|record: &StepRecord| eprintln!("{}", record.summary())),
        on_content_delta: Box::new(|kind: DeltaKind, text: &str| {
            if kind == DeltaKind::Text {
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
            }
        }),
    };
    let handle = manager.spawn(runtime, args.objective, callbacks)?;
    let result = handle
        .join()
        .map_err(|_| anyhow!("session thread panicked"))??;

    println!("\n\n== {} ==\n{}", result.status.as_str(), result.answer.trim());
    if let Some(error) = &result.error {
        eprintln!("error: {error}");
    }
    Ok(match result.status {
        SolveStatus::Complete => exit_codes::OK,
        SolveStatus::Failed => exit_codes::FAILED,
        SolveStatus::BudgetExhausted | SolveStatus::Stopped => exit_codes::INCOMPLETE,
    })
}

fn cmd_sessions(workspace: Option<PathBuf>, limit: usize) -> Result<i32> {
    let store = session_store(workspace)?;
    for session in store.list_sessions(limit)? {
        println!(
            "{}\t{}\t{}\t{}",
            session.id,
            session.status.as_str(),
            session.created_at,
            session.objective.as_deref().unwrap_or("-")
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_events(workspace: Option<PathBuf>, session_id: &str) -> Result<i32> {
    let store = session_store(workspace)?;
    let mut stdout = std::io::stdout().lock();
    for envelope in store.events(session_id)? {
        let line = serde_json::to_string(&envelope).context("serialize event")?;
        writeln!(stdout, "{line}").context("write event")?;
    }
    Ok(exit_codes::OK)
}

fn session_store(workspace: Option<PathBuf>) -> Result<SessionStore> {
    let workspace = workspace_or_cwd(workspace)?;
    let config = AgentConfig::from_env(&workspace).context("load configuration")?;
    Ok(SessionStore::new(config.session_root()))
}

fn workspace_or_cwd(workspace: Option<PathBuf>) -> Result<PathBuf> {
    match workspace {
        Some(path) => Ok(path),
        None => std::env::current_dir().context("read current directory"),
    }
}
