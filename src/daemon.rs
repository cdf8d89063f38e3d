//! Service infrastructure - the long-running `serve` process
//!
//! Wires the store, engine, scheduler, export supervisor and HTTP trigger
//! together, manages the PID file and performs an orderly shutdown on
//! Ctrl-C or SIGTERM.

use crate::engine::MirrorEngine;
use crate::gateway::{self, DesiredStateGateway};
use crate::git::GitCli;
use crate::health::HealthCheck;
use crate::http::{self, AppState};
use crate::lease::LeaseTable;
use crate::lifecycle::{ExportAddress, MirrorManager};
use crate::scheduler::Scheduler;
use crate::store::MirrorStore;
use crate::supervisor::{DaemonCommand, ExportSupervisor};
use crate::Config;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Everything one mirrorsentry process needs, built from configuration
pub struct Service {
    config: Arc<Config>,
    engine: Arc<MirrorEngine>,
    scheduler: Arc<Scheduler>,
    supervisor: Arc<ExportSupervisor>,
    shutdown_sender: broadcast::Sender<()>,
    pid_file_path: Option<PathBuf>,
}

impl Service {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let config = Arc::new(config);
        let root = config.mirror_root_path();

        let leases = Arc::new(LeaseTable::new());
        let store = Arc::new(
            MirrorStore::open(&root, &config.state_db_path())
                .context("Failed to open mirror state database")?,
        );
        let manager = Arc::new(MirrorManager::new(
            store,
            Arc::new(GitCli::new(&config.export.program)),
            ExportAddress::new(&config.export.public_host, config.export.port),
            config.operation_timeout()?,
        ));
        let engine = Arc::new(MirrorEngine::new(
            manager,
            leases.clone(),
            config.schedule.max_parallel,
            config.lease_wait()?,
        ));

        let desired_state: Arc<dyn DesiredStateGateway> =
            gateway::from_config(&config).context("Failed to build desired-state gateway")?;
        let scheduler = Arc::new(Scheduler::new(
            engine.clone(),
            desired_state,
            config.interval()?,
            config.incremental_window()?,
        ));

        let supervisor = Arc::new(ExportSupervisor::new(
            DaemonCommand::git_daemon(
                &config.export.program,
                &root,
                config.export.port,
                config.export.listen.as_deref(),
            ),
            leases,
            config.startup_grace()?,
            config.stop_grace()?,
        ));

        let pid_file_path = if config.service.pid_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&config.service.pid_file))
        };

        let (shutdown_sender, _) = broadcast::channel(1);

        Ok(Self {
            config,
            engine,
            scheduler,
            supervisor,
            shutdown_sender,
            pid_file_path,
        })
    }

    pub fn engine(&self) -> &Arc<MirrorEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn supervisor(&self) -> &Arc<ExportSupervisor> {
        &self.supervisor
    }

    /// Run in the foreground until a shutdown signal arrives
    pub async fn run(&self) -> Result<()> {
        info!("Starting mirrorsentry service");

        let health = HealthCheck::run(&self.config).await;
        for warning in health.warnings() {
            warn!("Preflight: {} {}", warning.message, warning.details.as_deref().unwrap_or(""));
        }
        if !health.all_passed() {
            for failure in health.errors() {
                error!("Preflight: {} {}", failure.message, failure.details.as_deref().unwrap_or(""));
            }
            bail!("Preflight checks failed, run 'mirrorsentry check' for details");
        }

        self.write_pid_file().context("Failed to write PID file")?;

        if let Err(e) = self.supervisor.start().await {
            self.cleanup();
            return Err(e).context("Export daemon could not be started");
        }

        let result = self.serve_until_shutdown().await;

        if let Err(e) = self.supervisor.stop().await {
            error!("Failed to stop export daemon: {}", e);
        }
        self.cleanup();

        result
    }

    async fn serve_until_shutdown(&self) -> Result<()> {
        let mut stop_requested = self.shutdown_sender.subscribe();
        let mut scheduler = tokio::spawn(
            self.scheduler
                .clone()
                .run(self.shutdown_sender.subscribe()),
        );

        let http = if self.config.http.enabled {
            let bind = self.config.http_bind()?;
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("Failed to bind HTTP trigger on {}", bind))?;
            let state = AppState {
                engine: self.engine.clone(),
                supervisor: self.supervisor.clone(),
            };
            Some(tokio::spawn(http::serve(
                listener,
                state,
                self.shutdown_sender.subscribe(),
            )))
        } else {
            debug!("HTTP trigger disabled");
            None
        };

        // A requested stop always wins over the scheduler returning in response to it
        let scheduler_exited = tokio::select! {
            biased;
            _ = wait_for_shutdown_signal() => {
                info!("Shutdown signal received, stopping service...");
                None
            }
            _ = stop_requested.recv() => {
                info!("Shutdown requested, stopping service...");
                None
            }
            finished = &mut scheduler => Some(finished),
        };
        let _ = self.shutdown_sender.send(());

        let scheduler_failure = match scheduler_exited {
            Some(Err(e)) => Some(format!("Scheduler task failed: {}", e)),
            Some(Ok(())) => Some("Scheduler stopped unexpectedly".to_string()),
            None => {
                if let Err(e) = scheduler.await {
                    error!("Scheduler task failed: {}", e);
                }
                None
            }
        };

        if let Some(http) = http {
            match http.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("HTTP trigger failed: {:#}", e),
                Err(e) => error!("HTTP trigger task failed: {}", e),
            }
        }

        if let Some(failure) = scheduler_failure {
            error!("{}, stopping service", failure);
            bail!(failure);
        }

        Ok(())
    }

    /// Ask a running `serve` loop to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_sender.send(());
    }

    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;
            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    fn cleanup(&self) {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                match fs::remove_file(pid_file) {
                    Ok(()) => info!("PID file removed: {}", pid_file.display()),
                    Err(e) => warn!("Failed to remove PID file {}: {}", pid_file.display(), e),
                }
            }
        }
    }
}

/// Wait for Ctrl-C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
}

fn read_pid(config: &Config) -> Result<Option<(PathBuf, i32)>> {
    if config.service.pid_file.is_empty() {
        return Ok(None);
    }

    let pid_file = PathBuf::from(&config.service.pid_file);
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in PID file")?;
    // 0 and negative values address process groups, not a single process
    if pid <= 0 {
        bail!("Invalid PID {} in PID file {:?}", pid, pid_file);
    }
    Ok(Some((pid_file, pid)))
}

/// Check if the service is running by checking the PID file
pub fn is_service_running(config: &Config) -> Result<bool> {
    let Some((pid_file, pid)) = read_pid(config)? else {
        return Ok(false);
    };

    if process_alive(pid) {
        Ok(true)
    } else {
        // Stale PID file
        let _ = fs::remove_file(&pid_file);
        Ok(false)
    }
}

/// Send SIGTERM to the service recorded in the PID file
pub fn stop_service(config: &Config) -> Result<bool> {
    let Some((_, pid)) = read_pid(config)? else {
        warn!("PID file not found, service may not be running");
        return Ok(false);
    };

    send_terminate(pid)?;
    info!("Shutdown signal sent to service process {}", pid);
    Ok(true)
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal;
    use nix::unistd::Pid;

    // EPERM still means the process exists
    !matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    true
}

#[cfg(unix)]
fn send_terminate(pid: i32) -> Result<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    signal::kill(Pid::from_raw(pid), Signal::SIGTERM)
        .context("Failed to send SIGTERM to service process")
}

#[cfg(not(unix))]
fn send_terminate(pid: i32) -> Result<()> {
    bail!("Stopping process {} is not supported on this platform", pid)
}
