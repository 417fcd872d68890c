//! opsrun — local-first runbook executor.

mod console;
mod settings;

use clap::{Parser, Subcommand};
use console::{ConsoleInteractor, ConsolePrompter};
use opsrun_engine::{
    AutoInteractor, BuiltinPlugin, EngineConfig, Executor, Interactor, NoPrompter, Prompter,
    RunStatus, SqliteStore, StaticRegistry, TokioProcessRunner, exit_code,
};
use settings::Settings;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "opsrun", version, about = "Local-first runbook executor")]
struct Cli {
    /// Path of the run store database (overrides OPSRUN__STORE_PATH).
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::Args)]
struct ExecArgs {
    /// The runbook file.
    file: PathBuf,

    /// Variable overrides, KEY=VALUE (highest precedence).
    #[arg(short = 'v', long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,

    /// TOML file with variable values.
    #[arg(long)]
    var_file: Option<PathBuf>,

    /// Run independent nodes concurrently.
    #[arg(long)]
    parallel: bool,

    /// Never prompt; apply automatic retry/skip policy.
    #[arg(long)]
    non_interactive: bool,

    /// Extra attempts allowed per node after the first.
    #[arg(long, default_value_t = 2)]
    max_retries: u32,

    /// Default per-node timeout in seconds.
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a runbook from the start.
    Run(ExecArgs),
    /// Resume an aborted run.
    Resume {
        #[command(flatten)]
        exec: ExecArgs,
        /// Run to resume (latest if omitted).
        #[arg(long)]
        run_id: Option<i64>,
    },
    /// Parse and plan a runbook without executing it.
    Validate {
        /// The runbook file.
        file: PathBuf,
    },
    /// Override a run's status (repair an orphaned RUNNING run).
    SetStatus {
        workflow: String,
        run_id: i64,
        /// One of: running, ok, nok, aborted.
        status: String,
    },
    /// Show the latest run of a workflow and its attempts.
    Info { workflow: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("invalid settings: {e}");
            return 3;
        }
    };
    if let Some(store) = cli.store {
        settings.store_path = store;
    }

    match cli.command {
        Command::Validate { file } => match opsrun_engine::validate(&file) {
            Ok((runbook, plan)) => {
                println!(
                    "'{}' is valid: {} nodes, order: {}",
                    runbook.name,
                    runbook.nodes.len(),
                    plan.order()
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(" -> ")
                );
                0
            }
            Err(e) => {
                error!(code = e.code(), "{e}");
                e.exit_code()
            }
        },
        Command::Run(exec) => {
            let executor = match build_executor(&settings, &exec).await {
                Ok(executor) => executor,
                Err(code) => return code,
            };
            wire_interrupt(&executor);
            let options = match run_options(&settings, &exec) {
                Ok(options) => options,
                Err(code) => return code,
            };
            let result = executor.run(&exec.file, &options).await;
            report(&result)
        }
        Command::Resume { exec, run_id } => {
            let executor = match build_executor(&settings, &exec).await {
                Ok(executor) => executor,
                Err(code) => return code,
            };
            wire_interrupt(&executor);
            let options = match run_options(&settings, &exec) {
                Ok(options) => options,
                Err(code) => return code,
            };
            let result = executor.resume(&exec.file, run_id, &options).await;
            report(&result)
        }
        Command::SetStatus {
            workflow,
            run_id,
            status,
        } => {
            let Some(status) = RunStatus::parse(&status) else {
                error!("unknown status '{status}' (use running, ok, nok, or aborted)");
                return 3;
            };
            let executor = match plain_executor(&settings).await {
                Ok(executor) => executor,
                Err(code) => return code,
            };
            match executor.set_status(&workflow, run_id, status).await {
                Ok(()) => {
                    println!("{workflow}/{run_id} set to {status}");
                    0
                }
                Err(e) => {
                    error!(code = e.code(), "{e}");
                    e.exit_code()
                }
            }
        }
        Command::Info { workflow } => {
            let executor = match plain_executor(&settings).await {
                Ok(executor) => executor,
                Err(code) => return code,
            };
            match executor.latest(&workflow).await {
                Ok(Some((run, executions))) => {
                    println!(
                        "run {}/{} [{}] trigger={} ok={} nok={} skipped={}",
                        run.workflow_name,
                        run.run_id,
                        run.status,
                        run.trigger,
                        run.nodes_ok,
                        run.nodes_nok,
                        run.nodes_skipped
                    );
                    if run.status == RunStatus::Running && run.end_time.is_none() {
                        warn!(
                            "run is RUNNING; if no executor is alive it is orphaned \
                             (repair with set-status)"
                        );
                    }
                    for row in executions {
                        println!(
                            "  {} #{} [{}] decision={} exit={} {}",
                            row.node_id,
                            row.attempt,
                            row.status,
                            row.operator_decision,
                            row.exit_code
                                .map_or_else(|| "-".to_string(), |c| c.to_string()),
                            row.exception.as_deref().unwrap_or("")
                        );
                    }
                    0
                }
                Ok(None) => {
                    println!("no runs recorded for '{workflow}'");
                    0
                }
                Err(e) => {
                    error!(code = e.code(), "{e}");
                    e.exit_code()
                }
            }
        }
    }
}

/// Prints the run summary and maps the result onto the exit code.
fn report(result: &Result<opsrun_engine::RunReport, opsrun_engine::OpsError>) -> i32 {
    match result {
        Ok(report) => {
            println!(
                "run {}/{} finished: {} (ok={} nok={} skipped={})",
                report.workflow_name,
                report.run_id,
                report.status,
                report.counters.ok,
                report.counters.nok,
                report.counters.skipped
            );
        }
        Err(e) => {
            error!(code = e.code(), "{e}");
        }
    }
    exit_code(result)
}

async fn build_executor(
    settings: &Settings,
    exec: &ExecArgs,
) -> Result<Executor<SqliteStore>, i32> {
    let interactive = !exec.non_interactive && std::io::stdin().is_terminal();

    let interactor: Arc<dyn Interactor> = if interactive {
        Arc::new(ConsoleInteractor)
    } else {
        Arc::new(AutoInteractor)
    };
    let prompter: Arc<dyn Prompter> = if interactive {
        Arc::new(ConsolePrompter)
    } else {
        Arc::new(NoPrompter)
    };

    let config = EngineConfig {
        max_retries: exec.max_retries,
        default_timeout: exec.timeout.map(Duration::from_secs),
        parallel: exec.parallel,
        interactive,
        interactive_timeout: Duration::from_secs(settings.interactive_timeout_secs),
        workers: None,
    };

    executor_with(settings, interactor, prompter, config).await
}

async fn plain_executor(settings: &Settings) -> Result<Executor<SqliteStore>, i32> {
    executor_with(
        settings,
        Arc::new(AutoInteractor),
        Arc::new(NoPrompter),
        EngineConfig::default(),
    )
    .await
}

async fn executor_with(
    settings: &Settings,
    interactor: Arc<dyn Interactor>,
    prompter: Arc<dyn Prompter>,
    config: EngineConfig,
) -> Result<Executor<SqliteStore>, i32> {
    let store = match SqliteStore::open(&settings.store_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("cannot open run store at {}: {e}", settings.store_path.display());
            return Err(1);
        }
    };

    let mut registry = StaticRegistry::new();
    registry.register(Arc::new(BuiltinPlugin::new()));

    Ok(Executor::new(
        store,
        interactor,
        prompter,
        Arc::new(registry),
        Arc::new(TokioProcessRunner::new()),
        config,
    ))
}

/// Ctrl-C sets the run-wide cancellation token; the engine drains workers
/// and aborts the run.
fn wire_interrupt(executor: &Executor<SqliteStore>) {
    let cancel = executor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; aborting run");
            cancel.cancel();
        }
    });
}

fn run_options(
    settings: &Settings,
    exec: &ExecArgs,
) -> Result<opsrun_engine::RunOptions, i32> {
    let overrides = match parse_overrides(&exec.vars) {
        Ok(overrides) => overrides,
        Err(bad) => {
            error!("malformed variable override '{bad}' (expected KEY=VALUE)");
            return Err(4);
        }
    };
    Ok(opsrun_engine::RunOptions {
        overrides,
        var_file: exec.var_file.clone(),
        env_prefix: Some(settings.var_prefix.clone()),
    })
}

fn parse_overrides(raw: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut overrides = BTreeMap::new();
    for entry in raw {
        let Some((key, value)) = entry.split_once('=') else {
            return Err(entry.clone());
        };
        if key.is_empty() {
            return Err(entry.clone());
        }
        overrides.insert(key.to_string(), value.to_string());
    }
    Ok(overrides)
}
