//! Preflight checks for MirrorSentry
//!
//! Verifies the host can actually mirror and export repositories before the
//! service starts.

use crate::gateway;
use crate::Config;
use std::net::TcpListener;
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Mirror root can be created and written
    pub mirror_root: CheckResult,
    /// Desired-state source can be read
    pub desired_state: CheckResult,
    /// Export port availability (warning only, the daemon may already hold it)
    pub export_port: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub async fn run(config: &Config) -> Self {
        Self {
            git: Self::check_git(&config.export.program),
            mirror_root: Self::check_mirror_root(&config.mirror_root_path()),
            desired_state: Self::check_desired_state(config).await,
            export_port: Self::check_export_port(config.export.listen.as_deref(), config.export.port),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, check)| check.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, check)| check)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, check)| check)
            .filter(|r| r.is_warning)
            .collect()
    }

    fn check_git(program: &str) -> CheckResult {
        match std::process::Command::new(program).arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error(format!("'{} --version' failed", program)),
            Err(_) => CheckResult::error_with_details(
                format!("{} not found in PATH", program),
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    fn check_mirror_root(root: &Path) -> CheckResult {
        if let Err(e) = std::fs::create_dir_all(root) {
            return CheckResult::error_with_details(
                "Mirror root cannot be created",
                format!("{}: {}", root.display(), e),
            );
        }

        let probe = root.join(".mirrorsentry-probe");
        match std::fs::write(&probe, b"") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                CheckResult::ok_with_details("Mirror root writable", root.display().to_string())
            }
            Err(e) => CheckResult::error_with_details(
                "Mirror root is not writable",
                format!("{}: {}", root.display(), e),
            ),
        }
    }

    async fn check_desired_state(config: &Config) -> CheckResult {
        let source = match gateway::from_config(config) {
            Ok(source) => source,
            Err(e) => {
                return CheckResult::error_with_details(
                    "Desired-state configuration invalid",
                    format!("{:#}", e),
                )
            }
        };

        match source.fetch(None).await {
            Ok(descriptors) if descriptors.is_empty() => CheckResult::warning_with_details(
                "Desired-state source is empty",
                format!("{} source returned no repositories", source.source_name()),
            ),
            Ok(descriptors) => CheckResult::ok_with_details(
                "Desired-state source readable",
                format!("{} repositories from {}", descriptors.len(), source.source_name()),
            ),
            Err(e) => CheckResult::error_with_details(
                "Desired-state source unreadable",
                format!("{:#}", e),
            ),
        }
    }

    fn check_export_port(listen: Option<&str>, port: u16) -> CheckResult {
        let host = listen.unwrap_or("0.0.0.0");
        match TcpListener::bind((host, port)) {
            Ok(_) => CheckResult::ok_with_details(
                "Export port available",
                format!("{}:{}", host, port),
            ),
            Err(e) => CheckResult::warning_with_details(
                format!("Export port {} not bindable", port),
                format!("{} (an export daemon may already be running)", e),
            ),
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Git Installation", &self.git),
            ("Mirror Root", &self.mirror_root),
            ("Desired State", &self.desired_state),
            ("Export Port", &self.export_port),
        ]
    }
}
