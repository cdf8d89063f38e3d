use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mirrorsentry::daemon::{is_service_running, stop_service};
use mirrorsentry::health::CheckResult;
use mirrorsentry::{Config, HealthCheck, PassKind, ReconcileOutcome, RepositoryDescriptor, Service};

#[derive(Parser)]
#[command(name = "mirrorsentry")]
#[command(about = "Keeps a set of bare git mirrors reconciled and exported")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service in the foreground (scheduler, export daemon, HTTP trigger)
    Serve,

    /// Stop a running service
    Stop,

    /// Show whether the service is running
    Status,

    /// Run a single reconciliation pass and print its summary
    Pass {
        #[arg(value_enum)]
        kind: PassArg,
    },

    /// Create a mirror of one repository right now
    Mirror {
        /// Source URL; the scheme defaults to https://
        url: String,

        /// Mirror name (defaults to the last path segment of the URL)
        #[arg(long)]
        name: Option<String>,
    },

    /// List known mirrors and their state
    List,

    /// Preflight diagnostics
    Check,
}

#[derive(ValueEnum, Clone, Copy)]
enum PassArg {
    /// Create mirrors for recently desired repositories
    Incremental,
    /// Update every desired repository
    Full,
}

impl From<PassArg> for PassKind {
    fn from(arg: PassArg) -> Self {
        match arg {
            PassArg::Incremental => PassKind::Incremental,
            PassArg::Full => PassKind::Full,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config)?;
    init_logging(cli.verbose, &config)?;
    info!("Starting MirrorSentry v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Stop => cmd_stop(&config),
        Commands::Status => cmd_status(&config),
        Commands::Pass { kind } => cmd_pass(kind.into(), config).await,
        Commands::Mirror { url, name } => cmd_mirror(&url, name.as_deref(), config).await,
        Commands::List => cmd_list(config),
        Commands::Check => cmd_check(&config).await,
    }
}

/// Initialize logging; RUST_LOG wins, then --verbose, then logging.level
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let default_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "full" {
        registry.with(fmt::layer()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<std::path::PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => {
            let mut config = Config::load(&path)?;
            config.apply_env_overrides()?;
            Ok(config)
        }
        None => Config::load_or_default(),
    }
}

/// One-shot commands share no leases with a running service
fn ensure_service_stopped(config: &Config, action: &str) -> Result<()> {
    if is_service_running(config)? {
        bail!(
            "The service is running; {} through it instead (POST http://{}/mirrors/<url>)",
            action,
            config.http.bind
        );
    }
    Ok(())
}

async fn cmd_serve(config: Config) -> Result<()> {
    if is_service_running(&config)? {
        println!("⚠️  Service is already running!");
        println!("   Use 'mirrorsentry stop' to stop it first");
        return Ok(());
    }

    println!("🚀 Starting MirrorSentry (Ctrl+C to stop)");
    println!("   Mirror root: {}", config.mirror_root);
    println!(
        "   Export: git://{}:{}/<name>",
        config.export.public_host, config.export.port
    );
    if config.http.enabled {
        println!("   HTTP trigger: http://{}", config.http.bind);
    }

    let service = Service::new(config)?;
    service.run().await
}

fn cmd_stop(config: &Config) -> Result<()> {
    println!("🛑 Stopping MirrorSentry...");

    if !is_service_running(config)? {
        println!("⚠️  No service appears to be running");
        return Ok(());
    }

    if stop_service(config)? {
        println!("✅ Stop signal sent");
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("📊 MirrorSentry Status");

    if is_service_running(config)? {
        println!("   🟢 Status: Running");
        println!("   📄 PID file: {}", config.service.pid_file);
        println!("   🔄 Pass interval: {}", config.schedule.interval);
    } else {
        println!("   🔴 Status: Not running");
        println!("   💡 Use 'mirrorsentry serve' to start it");
    }
    Ok(())
}

async fn cmd_pass(kind: PassKind, config: Config) -> Result<()> {
    ensure_service_stopped(&config, "passes run")?;

    let service = Service::new(config)?;
    println!("🔄 Running {} pass", kind);
    let summary = service.scheduler().run_pass(kind).await?;

    println!("\n🎉 Pass complete");
    println!("   📊 Repositories: {}", summary.total);
    println!("   📥 Created: {}", summary.created);
    println!("   🔄 Updated: {}", summary.updated);
    println!("   ✅ Unchanged: {}", summary.unchanged);
    println!("   ⏭️  Skipped: {}", summary.skipped);
    println!("   ❌ Failed: {}", summary.failed);
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.failed > 0 {
        println!("\n🔍 Failures:");
        for outcome in &summary.outcomes {
            if let ReconcileOutcome::Failed { name, error } = outcome {
                println!("   ❌ {}: {}", name, error);
            }
        }
    }

    Ok(())
}

async fn cmd_mirror(url: &str, name: Option<&str>, config: Config) -> Result<()> {
    ensure_service_stopped(&config, "ad-hoc mirrors are created")?;

    let service = Service::new(config)?;
    let descriptor = RepositoryDescriptor::from_url(url, name);
    let outcome = service.engine().mirror_now(&descriptor).await?;

    println!("✅ Mirror ready: {}", outcome.name);
    println!("   📁 Path: {}", outcome.path.display());
    println!("   🔗 Clone URL: {}", outcome.clone_url);
    Ok(())
}

fn cmd_list(config: Config) -> Result<()> {
    let service = Service::new(config)?;
    let mirrors = service.engine().store().list()?;

    println!("Mirrors ({}):", mirrors.len());
    for record in mirrors {
        let synced = record
            .last_synced_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!("  📁 {:<32} {:<9} synced: {}", record.name, record.state.as_str(), synced);
        if let Some(error) = &record.last_error {
            println!("     ❌ {}", error);
        }
    }
    Ok(())
}

async fn cmd_check(config: &Config) -> Result<()> {
    let health = HealthCheck::run(config).await;
    print_health_report(&health);
    if !health.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning { "⚠️ " } else { "✅" }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 MirrorSentry System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
