use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use rekon_core::{ApplyReport, ExecuteOptions, Outcome, Plan, Reconciler, ResourceGraph, RetryPolicy, RunOptions, StateKey, VersionId};
use rekon_local::{LocalBackend, LocalProvider};
use rekon_policy::Policy;

mod stack;

#[derive(Parser, Debug)]
#[command(author, version, about = "rekon: reconcile declared resources against recorded state")]
struct Cli {
    /// Stack file, directory of YAML files, or .age-encrypted file
    #[arg(short, long, default_value = "rekon.yaml", global = true)]
    file: PathBuf,

    /// AGE identities (for .age files)
    #[arg(long = "age-identity", global = true)]
    age_ids: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    /// More log output (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Recorded on the lock; defaults to $USER and the process id
    #[arg(long, global = true)]
    holder: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, ValueEnum)]
enum LogFormat { Json, Text }

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Maximum concurrent provider calls
    #[arg(long)]
    parallelism: Option<usize>,
    /// Per-action timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    /// Read every recorded resource from the provider before planning
    #[arg(long)]
    refresh: bool,
    /// Allow replacing resources the policy marks high-risk
    #[arg(long)]
    allow_high_risk: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show what apply would do. Exits 2 when changes are pending.
    Plan(RunArgs),
    /// Converge recorded state to the declarations.
    Apply(RunArgs),
    /// Remove a stale lock left by a crashed run.
    ForceUnlock { lock_id: String },
    #[command(subcommand)]
    State(StateCmd),
}

#[derive(Subcommand, Debug)]
enum StateCmd {
    /// List saved versions, oldest first.
    Versions,
    /// Print a saved snapshot (latest by default).
    Show {
        #[arg(long)]
        version: Option<u64>,
    },
}

fn init_logging(format: LogFormat, verbose: u8) {
    let default = match verbose { 0 => "info", 1 => "debug", _ => "trace" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().with_span_events(FmtSpan::CLOSE).init(),
        LogFormat::Text => builder.init(),
    }
}

fn default_holder() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    format!("{user}:{}", std::process::id())
}

fn plan_exit_code(plan: &Plan) -> u8 {
    if plan.has_changes() { 2 } else { 0 }
}

fn apply_exit_code(report: &ApplyReport) -> u8 {
    match report.worst() {
        Outcome::NoOp | Outcome::Applied => 0,
        Outcome::Skipped(_) => 3,
        Outcome::Failed { .. } | Outcome::TimedOut => 1,
    }
}

fn run_options(cli: &Cli, settings: &stack::Settings, policy: &Policy, args: &RunArgs) -> RunOptions {
    RunOptions {
        holder: cli.holder.clone().unwrap_or_else(default_holder),
        refresh: args.refresh || settings.refresh,
        allow_high_risk: args.allow_high_risk || policy.allow_high_risk,
        execute: ExecuteOptions {
            parallelism: args.parallelism.unwrap_or(settings.parallelism).max(1),
            action_timeout: Duration::from_secs(args.timeout.unwrap_or(settings.action_timeout_secs)),
        },
    }
}

/// Flips the cancel flag on Ctrl-C. In-flight actions finish; nothing new starts.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, waiting for in-flight actions");
            let _ = tx.send(true);
        }
    });
    rx
}

async fn run(cli: Cli) -> Result<u8> {
    let stack = stack::load(&cli.file, &cli.age_ids)?;
    let key = StateKey(stack.state_key());
    let policy = Arc::new(Policy::from_config(&stack.policy)?);
    let backend = LocalBackend::new(&stack.backend.path);
    let provider = LocalProvider::new(&stack.backend.path);
    let retry = RetryPolicy {
        attempts: stack.settings.retry_attempts.max(1),
        base_delay: Duration::from_millis(stack.settings.retry_base_ms),
        ..RetryPolicy::default()
    };
    let engine = Reconciler::new(Arc::new(backend.clone()), Arc::new(backend), Arc::new(provider), policy.clone())
        .with_retry(retry);
    tracing::debug!(project = ?stack.project, key = %key, backend = %stack.backend.path.display(), "stack loaded");

    let build_graph = || -> Result<ResourceGraph> {
        Ok(ResourceGraph::from_declarations(stack.declarations()?)?)
    };

    match &cli.cmd {
        Cmd::Plan(args) => {
            let graph = build_graph()?;
            let opts = run_options(&cli, &stack.settings, &policy, args);
            let plan = engine.plan(&key, &graph, &opts).await?;
            print!("{plan}");
            Ok(plan_exit_code(&plan))
        }
        Cmd::Apply(args) => {
            let graph = build_graph()?;
            let opts = run_options(&cli, &stack.settings, &policy, args);
            let out = engine.apply(&key, &graph, &opts, cancel_on_ctrl_c()).await?;
            print!("{}", out.plan);
            print!("{}", out.report);
            match out.saved {
                Some(v) => println!("State saved as {v}."),
                None => println!("State unchanged."),
            }
            Ok(apply_exit_code(&out.report))
        }
        Cmd::ForceUnlock { lock_id } => {
            let removed = engine.force_unlock(&key, lock_id).await?;
            println!(
                "Released lock {} on '{key}' held by {} ({}) since {}.",
                removed.id, removed.holder, removed.operation, removed.acquired_at
            );
            Ok(0)
        }
        Cmd::State(StateCmd::Versions) => {
            for v in engine.versions(&key).await? {
                println!("{v}");
            }
            if let Some(lock) = engine.current_lock(&key).await? {
                println!("locked by {} ({}) since {}, lock id {}", lock.holder, lock.operation, lock.acquired_at, lock.id);
            }
            Ok(0)
        }
        Cmd::State(StateCmd::Show { version }) => {
            let snap = engine.snapshot(&key, version.map(VersionId)).await?;
            println!("{}", serde_json::to_string_pretty(&snap).context("rendering snapshot")?);
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.verbose);
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "run failed");
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}
