//! Provisioner CLI
//!
//! Validates, plans, applies and destroys a declared topology against Azure
//! Resource Manager or the in-process simulated cloud.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lornu_provisioner::config::{ArmSettings, ProviderKind};
use lornu_provisioner::declaration::{parse_assignment, VariableSources};
use lornu_provisioner::graph::render_dot;
use lornu_provisioner::provider::{
    ArmCloud, AzureCliCredentials, CloudApi, LocalResources, ProviderRegistry, SimulatedCloud,
};
use lornu_provisioner::report::display_output;
use lornu_provisioner::state::{FileLock, FileStateStore, NoopLock, StateLock};
use lornu_provisioner::{AbortPolicy, Engine, EngineConfig, EngineError, Prepared};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Dependency-ordered provisioning of a declared cloud topology
#[derive(Parser, Debug)]
#[command(name = "provisioner", version, about)]
struct Args {
    /// Declaration file (JSON)
    #[arg(short, long, global = true, env = "PROVISIONER_DECLARATION", default_value = "deploy/three-tier.json")]
    declaration: PathBuf,

    /// State file
    #[arg(long, global = true, env = "PROVISIONER_STATE", default_value = "provisioner.state.json")]
    state: PathBuf,

    /// Variable assignment, `name=value`. Repeatable; wins over --var-file.
    #[arg(long = "var", global = true, value_parser = parse_assignment)]
    vars: Vec<(String, String)>,

    /// JSON object of variable values
    #[arg(long, global = true)]
    var_file: Option<PathBuf>,

    /// Upper bound on concurrently dispatched resources
    #[arg(long, global = true, env = "PROVISIONER_MAX_CONCURRENCY", default_value = "10")]
    max_concurrency: usize,

    /// What to do with in-flight resources on Ctrl-C
    #[arg(long, global = true, value_enum, default_value = "drain")]
    abort_policy: AbortPolicy,

    /// Proceed even if resources changed outside of provisioning
    #[arg(long, global = true, default_value = "false")]
    accept_drift: bool,

    /// Skip the state lock
    #[arg(long, global = true, default_value = "false")]
    no_lock: bool,

    /// Cloud backend
    #[arg(long, global = true, value_enum, env = "PROVISIONER_PROVIDER", default_value = "arm")]
    provider: ProviderKind,

    /// Persist the simulated cloud here so repeated runs see the same resources
    #[arg(long, global = true)]
    simulated_state: Option<PathBuf>,

    /// Azure subscription (defaults to the Azure CLI's current subscription)
    #[arg(long, global = true, env = "AZURE_SUBSCRIPTION_ID")]
    subscription_id: Option<String>,

    /// Print reports as JSON on stdout
    #[arg(long, global = true, default_value = "false")]
    json: bool,

    #[arg(long, global = true, value_enum, env = "PROVISIONER_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and check the declaration without contacting the cloud
    Validate,
    /// Show what apply would change
    Plan,
    /// Converge the cloud on the declaration
    Apply,
    /// Destroy every recorded resource
    Destroy,
    /// Print the realized dependency graph as DOT
    Graph,
    /// Print the outputs of the last successful apply
    Outputs,
    /// Remove a stale state lock
    ForceUnlock {
        /// Id of the held lock
        lock_id: String,
    },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_format);

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command fully succeeded.
async fn run(args: Args) -> Result<bool> {
    match &args.command {
        Command::Validate => {
            let prepared = prepare(&args)?;
            println!(
                "{} is valid: {} resources, {} disabled",
                args.declaration.display(),
                prepared.realized.graph.len(),
                prepared.realized.pruned.len()
            );
            Ok(true)
        }
        Command::Graph => {
            let prepared = prepare(&args)?;
            print!("{}", render_dot(&prepared.realized.graph));
            Ok(true)
        }
        Command::ForceUnlock { lock_id } => {
            let released = FileLock::for_state(&args.state)
                .force_unlock(lock_id)
                .context("Failed to force-unlock state")?;
            println!(
                "Released lock {} held by {} for {}",
                released.id, released.holder, released.operation
            );
            Ok(true)
        }
        Command::Outputs => {
            let engine = build_engine(&args)?;
            let outputs = engine.outputs().context("Failed to read state")?;
            if args.json {
                let redacted = lornu_provisioner::report::redacted(&outputs);
                println!("{}", serde_json::to_string_pretty(&redacted)?);
            } else {
                for (name, output) in &outputs {
                    println!("{name} = {}", display_output(output));
                }
            }
            Ok(true)
        }
        Command::Plan => {
            let prepared = prepare(&args)?;
            let engine = build_engine(&args)?;
            let plan = engine.plan(&prepared).await.context("Plan failed")?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print!("{}", plan.display());
            }
            Ok(true)
        }
        Command::Apply => {
            let prepared = prepare(&args)?;
            let engine = build_engine(&args)?;
            cancel_on_ctrl_c(&engine);
            let report = match engine.apply(&prepared).await {
                Ok(report) => report,
                Err(EngineError::DriftUnconfirmed { conflicts }) => {
                    for conflict in &conflicts {
                        eprintln!("! {conflict}");
                    }
                    bail!(
                        "{} resources changed outside of provisioning; review with `plan` and rerun with --accept-drift",
                        conflicts.len()
                    );
                }
                Err(e) => return Err(e).context("Apply failed"),
            };
            print_report(&args, &report)?;
            Ok(report.succeeded())
        }
        Command::Destroy => {
            let engine = build_engine(&args)?;
            cancel_on_ctrl_c(&engine);
            let report = engine.destroy().await.context("Destroy failed")?;
            print_report(&args, &report)?;
            Ok(report.succeeded())
        }
    }
}

fn prepare(args: &Args) -> Result<Prepared> {
    let mut sources = VariableSources::from_env();
    if let Some(path) = &args.var_file {
        sources = sources
            .with_file(path)
            .with_context(|| format!("Failed to load variables from {}", path.display()))?;
    }
    let sources = sources.with_cli(args.vars.clone());
    Prepared::load(&args.declaration, &sources)
        .with_context(|| format!("Invalid declaration {}", args.declaration.display()))
}

fn build_engine(args: &Args) -> Result<Engine> {
    let config = EngineConfig {
        max_concurrency: args.max_concurrency.max(1),
        abort_policy: args.abort_policy,
        accept_drift: args.accept_drift,
        ..EngineConfig::default()
    };

    let credentials = Arc::new(AzureCliCredentials::new(args.subscription_id.clone()));
    let remote: Arc<dyn CloudApi> = match args.provider {
        ProviderKind::Arm => {
            let settings = ArmSettings {
                subscription_id: args.subscription_id.clone(),
                ..ArmSettings::default()
            };
            Arc::new(ArmCloud::new(settings, credentials.clone()).context("Failed to build ARM client")?)
        }
        ProviderKind::Simulated => match &args.simulated_state {
            Some(path) => Arc::new(
                SimulatedCloud::persistent(path)
                    .with_context(|| format!("Failed to load simulated cloud {}", path.display()))?,
            ),
            None => {
                warn!("Simulated cloud is in-memory; resources vanish when the process exits");
                Arc::new(SimulatedCloud::new())
            }
        },
    };
    let local = Arc::new(LocalResources::new(credentials));
    let api = Arc::new(ProviderRegistry::new(remote, local).with_retry(config.retry));

    info!(
        provider = ?args.provider,
        state = %args.state.display(),
        max_concurrency = config.max_concurrency,
        "Engine configured"
    );
    Ok(Engine::new(
        api,
        Arc::new(FileStateStore::new(&args.state)),
        state_lock(&args.state, args.no_lock),
        config,
    ))
}

fn state_lock(state: &Path, disabled: bool) -> Arc<dyn StateLock> {
    if disabled {
        warn!("State locking disabled");
        Arc::new(NoopLock)
    } else {
        Arc::new(FileLock::for_state(state))
    }
}

/// First Ctrl-C cancels the run under the configured abort policy.
fn cancel_on_ctrl_c(engine: &Engine) {
    let token = engine.cancellation_token();
    let policy = engine.config().abort_policy;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(abort_policy = ?policy, "Interrupted, cancelling run");
            token.cancel();
        }
    });
}

fn print_report(args: &Args, report: &lornu_provisioner::RunReport) -> Result<()> {
    if args.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        for warning in &report.drift {
            println!("drift: {warning}");
        }
        print!("{}", report.display());
    }
    Ok(())
}
