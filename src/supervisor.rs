//! Export daemon supervisor
//!
//! Owns the single `git daemon` subprocess that serves every mirror carrying
//! the export marker. Start and stop are serialized through the shared lease
//! table under [`SUPERVISOR_LEASE`].

use crate::error::{MirrorError, MirrorResult};
use crate::lease::LeaseTable;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command as AsyncCommand};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Lease key for start/stop; the leading ':' keeps it out of the mirror namespace
pub const SUPERVISOR_LEASE: &str = ":export-daemon";

const LEASE_WAIT: Duration = Duration::from_secs(30);

/// Program and arguments used to launch the export daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DaemonCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// `git daemon` serving marker-bearing repositories below `root`
    pub fn git_daemon(program: &str, root: &Path, port: u16, listen: Option<&str>) -> Self {
        let root = root.display().to_string();
        let mut args = vec![
            "daemon".to_string(),
            "--reuseaddr".to_string(),
            "--verbose".to_string(),
            format!("--port={}", port),
            format!("--base-path={}", root),
        ];
        if let Some(listen) = listen {
            args.push(format!("--listen={}", listen));
        }
        args.push(root);

        Self::new(program, args)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub state: DaemonState,
    pub pid: Option<u32>,
}

struct Inner {
    state: DaemonState,
    child: Option<Child>,
}

pub struct ExportSupervisor {
    command: DaemonCommand,
    leases: Arc<LeaseTable>,
    startup_grace: Duration,
    stop_grace: Duration,
    inner: Mutex<Inner>,
}

impl ExportSupervisor {
    pub fn new(
        command: DaemonCommand,
        leases: Arc<LeaseTable>,
        startup_grace: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            command,
            leases,
            startup_grace,
            stop_grace,
            inner: Mutex::new(Inner {
                state: DaemonState::Stopped,
                child: None,
            }),
        }
    }

    pub fn command(&self) -> &DaemonCommand {
        &self.command
    }

    /// Launch the daemon; does nothing if it is already up
    pub async fn start(&self) -> MirrorResult<()> {
        let _lease = self.leases.acquire(SUPERVISOR_LEASE, LEASE_WAIT).await?;

        {
            let mut inner = self.inner();
            Self::reap(&mut inner);
            if matches!(inner.state, DaemonState::Running | DaemonState::Starting) {
                debug!("Export daemon already running");
                return Ok(());
            }
            inner.state = DaemonState::Starting;
        }

        info!(
            "Starting export daemon: {} {}",
            self.command.program,
            self.command.args.join(" ")
        );

        let spawned = AsyncCommand::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.inner().state = DaemonState::Stopped;
                return Err(MirrorError::DaemonLaunchFailure(format!(
                    "failed to spawn {}: {}",
                    self.command.program, e
                )));
            }
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "export_daemon", "{}", line);
                }
            });
        }

        sleep(self.startup_grace).await;

        match child.try_wait() {
            Ok(None) => {
                let pid = child.id();
                let mut inner = self.inner();
                inner.child = Some(child);
                inner.state = DaemonState::Running;
                info!("Export daemon running (pid {:?})", pid);
                Ok(())
            }
            Ok(Some(status)) => {
                self.inner().state = DaemonState::Stopped;
                Err(MirrorError::DaemonLaunchFailure(format!(
                    "{} exited during startup with {}",
                    self.command.program, status
                )))
            }
            Err(e) => {
                self.inner().state = DaemonState::Stopped;
                Err(MirrorError::DaemonLaunchFailure(format!(
                    "could not observe {}: {}",
                    self.command.program, e
                )))
            }
        }
    }

    /// Terminate the daemon: SIGTERM, then kill after the stop grace
    pub async fn stop(&self) -> MirrorResult<()> {
        let _lease = self.leases.acquire(SUPERVISOR_LEASE, LEASE_WAIT).await?;

        let child = {
            let mut inner = self.inner();
            match inner.child.take() {
                Some(child) => {
                    inner.state = DaemonState::Stopping;
                    child
                }
                None => {
                    inner.state = DaemonState::Stopped;
                    return Ok(());
                }
            }
        };

        self.terminate(child).await;
        self.inner().state = DaemonState::Stopped;
        info!("Export daemon stopped");
        Ok(())
    }

    async fn terminate(&self, mut child: Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                debug!("Sending SIGTERM to export daemon (pid {})", pid);
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!("Failed to signal export daemon: {}", e);
                }
            }
        }

        match timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => debug!("Export daemon exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for export daemon: {}", e),
            Err(_) => {
                warn!(
                    "Export daemon still alive after {:?}, killing it",
                    self.stop_grace
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill export daemon: {}", e);
                }
            }
        }
    }

    pub fn status(&self) -> DaemonStatus {
        let mut inner = self.inner();
        Self::reap(&mut inner);
        DaemonStatus {
            state: inner.state,
            pid: inner.child.as_ref().and_then(Child::id),
        }
    }

    /// Whether the daemon is still up; a dead process moves to `Stopped`
    pub fn check_alive(&self) -> bool {
        self.status().state == DaemonState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.status().pid
    }

    fn reap(inner: &mut Inner) {
        let exited = match inner.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => Some(e.to_string()),
            },
            None => None,
        };

        if let Some(status) = exited {
            warn!("Export daemon exited unexpectedly ({})", status);
            inner.child = None;
            inner.state = DaemonState::Stopped;
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn supervisor(command: DaemonCommand) -> ExportSupervisor {
        ExportSupervisor::new(
            command,
            Arc::new(LeaseTable::new()),
            Duration::from_millis(200),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_git_daemon_command() {
        let cmd = DaemonCommand::git_daemon("git", Path::new("/srv/mirrors"), 9418, None);
        assert_eq!(cmd.program, "git");
        assert_eq!(
            cmd.args,
            vec![
                "daemon",
                "--reuseaddr",
                "--verbose",
                "--port=9418",
                "--base-path=/srv/mirrors",
                "/srv/mirrors"
            ]
        );
        assert!(!cmd.args.iter().any(|a| a == "--export-all"));

        let cmd = DaemonCommand::git_daemon("git", Path::new("/m"), 9000, Some("0.0.0.0"));
        assert!(cmd.args.contains(&"--listen=0.0.0.0".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("/m"));
    }

    #[tokio::test]
    async fn test_start_twice_keeps_one_process() {
        let sup = supervisor(DaemonCommand::new("sleep", ["30"]));

        sup.start().await.unwrap();
        let first = sup.pid();
        assert!(first.is_some());

        sup.start().await.unwrap();
        assert_eq!(sup.pid(), first);
        assert_eq!(sup.status().state, DaemonState::Running);

        sup.stop().await.unwrap();
        assert_eq!(sup.status().state, DaemonState::Stopped);
        assert!(sup.pid().is_none());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let sup = supervisor(DaemonCommand::new("sleep", ["30"]));
        sup.stop().await.unwrap();
        sup.stop().await.unwrap();
        assert_eq!(sup.status().state, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_immediate_exit_is_launch_failure() {
        let sup = supervisor(DaemonCommand::new("true", Vec::<String>::new()));
        assert_matches!(sup.start().await, Err(MirrorError::DaemonLaunchFailure(_)));
        assert_eq!(sup.status().state, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let sup = supervisor(DaemonCommand::new("no-such-export-daemon", ["--port=1"]));
        assert_matches!(sup.start().await, Err(MirrorError::DaemonLaunchFailure(ref msg)) if msg.contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_process_detected() {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let sup = supervisor(DaemonCommand::new("sleep", ["30"]));
        sup.start().await.unwrap();
        let pid = sup.pid().unwrap();

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!sup.check_alive());
        assert_eq!(sup.status().state, DaemonState::Stopped);

        sup.start().await.unwrap();
        assert!(sup.check_alive());
        sup.stop().await.unwrap();
    }
}
