use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use custodian::event::TriggerEvent;
use custodian::gcp::GcpProvider;
use custodian::policy::{load_file, PolicyCollection};
use custodian::provider::{MemoryProvider, ProviderSet};
use custodian::resource::{get_all_resource_keys, get_resource};
use custodian::{Engine, RunConfig, RunReport, RunState, VERSION};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Policy engine for cloud governance
#[derive(Parser, Debug)]
#[command(name = "custodian", version = VERSION, about, long_about = None)]
struct Args {
    /// Run configuration file (YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level; RUST_LOG takes precedence when set
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run pull-mode policies against the configured accounts and regions
    Run {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Run event-mode policies for one trigger event
    Push {
        #[command(flatten)]
        run: RunArgs,

        /// Trigger event (JSON)
        #[arg(short, long)]
        event: PathBuf,
    },
    /// Validate a policy file and report every issue
    Validate {
        policy_file: PathBuf,
    },
    /// List resource types, or the filters and actions of one type
    Schema {
        resource: Option<String>,
    },
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Policy file (YAML or JSON)
    policy_file: PathBuf,

    /// Only run these policies
    #[arg(short, long = "policy")]
    policies: Vec<String>,

    /// Comma-separated regions, overriding the configuration
    #[arg(short, long, value_delimiter = ',')]
    regions: Vec<String>,

    /// Evaluate filters but never mutate resources
    #[arg(long)]
    dryrun: bool,

    /// Write resources.json / metrics.json per policy, account and region
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Serve resources from `<dir>/<provider>/<type>.json` instead of cloud APIs
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Minutes to keep listings in the on-disk cache (0 disables it)
    #[arg(long)]
    cache_period: Option<u64>,
}

impl RunArgs {
    fn apply(&self, config: &mut RunConfig) {
        if !self.regions.is_empty() {
            config.regions = self.regions.clone();
        }
        if self.dryrun {
            config.dryrun = true;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if let Some(period) = self.cache_period {
            config.cache_period = period;
        }
    }

    fn load_policies(&self) -> Result<PolicyCollection> {
        let policies = load_file(&self.policy_file)?;
        if self.policies.is_empty() {
            return Ok(policies);
        }
        Ok(policies.select(&self.policies)?)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn setup_logging(level: LogLevel, log_file: Option<&Path>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
        return Ok(None);
    };

    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("custodian {} started with log level: {:?}", VERSION, level);
    Ok(Some(guard))
}

/// Provider clients: fixtures when given, the GCP REST adapter otherwise
async fn build_providers(fixtures: Option<&Path>, policies: &PolicyCollection) -> Result<ProviderSet> {
    let mut providers = ProviderSet::new();
    if let Some(dir) = fixtures {
        for name in ["aws", "gcp"] {
            let path = dir.join(name);
            if path.is_dir() {
                providers.insert(Arc::new(MemoryProvider::from_fixture_dir(name, &path)?));
            }
        }
        return Ok(providers);
    }

    if policies.iter().any(|p| p.provider() == "gcp") {
        providers.insert(Arc::new(GcpProvider::new().await?));
    }
    if policies.iter().any(|p| p.provider() == "aws") {
        tracing::warn!("No live aws adapter is available; use --fixtures to run aws policies");
    }
    Ok(providers)
}

/// Accounts default to the active gcloud project when nothing is configured
fn default_accounts(config: &mut RunConfig) {
    if config.accounts.is_empty() && config.provider == "gcp" {
        if let Some(project) = custodian::gcp::get_default_project() {
            tracing::info!("Using default project {}", project);
            config.accounts.push(custodian::config::AccountConfig {
                id: project,
                provider: None,
                regions: Vec::new(),
            });
        }
    }
}

fn print_summary(reports: &[RunReport]) {
    for report in reports {
        let metrics = report.metrics();
        println!(
            "{:<8} {:<32} {:<40} resources={} matched={} action_failures={}{}",
            report.state,
            report.policy,
            report.scope,
            metrics.resource_count,
            metrics.matched,
            metrics.action_failures,
            report
                .error
                .as_ref()
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }
}

fn exit_code(reports: &[RunReport]) -> ExitCode {
    if reports.iter().any(|r| r.state == RunState::Failed) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_engine(config_path: Option<&Path>, run: &RunArgs, event: Option<&Path>) -> Result<ExitCode> {
    let mut config = RunConfig::load(config_path)?;
    run.apply(&mut config);
    default_accounts(&mut config);

    let policies = run.load_policies()?;
    let providers = build_providers(run.fixtures.as_deref(), &policies).await?;
    let engine = Engine::new(config, providers);

    let cancel = engine.cancel_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling runs");
            cancel.cancel();
        }
    });

    let reports = match event {
        Some(path) => {
            let event = TriggerEvent::from_file(path)?;
            engine.run_push(&policies, &event).await
        },
        None => engine.run_configured(&policies).await,
    };
    print_summary(&reports);
    Ok(exit_code(&reports))
}

fn validate(path: &Path) -> ExitCode {
    match load_file(path) {
        Ok(policies) => {
            for policy in &policies {
                println!("{} ({}, {} mode)", policy.name, policy.resource_type(), policy.mode.name());
            }
            println!("{} policy(ies) valid", policies.len());
            ExitCode::SUCCESS
        },
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        },
    }
}

fn schema(resource: Option<&str>) -> ExitCode {
    let Some(key) = resource else {
        for key in get_all_resource_keys() {
            println!("{}", key);
        }
        return ExitCode::SUCCESS;
    };
    let Some(def) = get_resource(key) else {
        eprintln!("Unknown resource type: {}", key);
        return ExitCode::FAILURE;
    };
    println!("{} - {}", def.key, def.display_name);
    println!("filters: {}", custodian::filters::standard_registry().names_for(def).join(", "));
    println!("actions: {}", custodian::actions::standard_registry().names_for(def).join(", "));
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let _log_guard = setup_logging(args.log_level, args.log_file.as_deref())?;

    match &args.command {
        Command::Run { run } => run_engine(args.config.as_deref(), run, None).await,
        Command::Push { run, event } => run_engine(args.config.as_deref(), run, Some(event)).await,
        Command::Validate { policy_file } => Ok(validate(policy_file)),
        Command::Schema { resource } => Ok(schema(resource.as_deref())),
    }
}
