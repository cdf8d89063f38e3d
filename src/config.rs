use anyhow::{bail, Context, Result};
use dirs::{config_dir, data_dir};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for MirrorSentry
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory holding one bare mirror per repository name
    #[serde(default = "default_mirror_root")]
    pub mirror_root: String,

    /// SQLite database recording mirror state
    #[serde(default = "default_state_db")]
    pub state_db: String,

    /// Where the list of desired repositories comes from
    #[serde(default)]
    pub desired_state: DesiredStateConfig,

    /// git daemon export settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Reconciliation pass settings
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Ad-hoc HTTP trigger
    #[serde(default)]
    pub http: HttpConfig,

    /// Process management
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Desired-state source configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct DesiredStateConfig {
    /// SQLite database with a `plugin_repo_name` table; takes precedence
    /// over `repositories` when set
    pub database: Option<String>,

    /// Static repository list used when no database is configured
    #[serde(default)]
    pub repositories: Vec<StaticRepository>,
}

/// A repository listed directly in the configuration file
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StaticRepository {
    pub name: String,
    pub url: String,
    /// RFC 3339 timestamp; defaults to the time the config was loaded
    pub since: Option<String>,
}

/// Export daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExportConfig {
    /// TCP port served by git daemon
    #[serde(default = "default_export_port")]
    pub port: u16,

    /// Host name advertised in clone URLs
    #[serde(default = "default_public_host")]
    pub public_host: String,

    /// Optional address passed to `git daemon --listen`
    pub listen: Option<String>,

    /// git executable
    #[serde(default = "default_git_program")]
    pub program: String,

    /// How long the daemon must stay alive after spawn to count as started
    #[serde(default = "default_startup_grace")]
    pub startup_grace: String,

    /// How long to wait after SIGTERM before killing the daemon
    #[serde(default = "default_stop_grace")]
    pub stop_grace: String,
}

/// Reconciliation schedule configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScheduleConfig {
    /// Interval between pass ticks
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Trailing window for the incremental pass
    #[serde(default = "default_incremental_window")]
    pub incremental_window: String,

    /// Bounded wait for a per-repository lease
    #[serde(default = "default_lease_wait")]
    pub lease_wait: String,

    /// Timeout for a single clone or fetch
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout: String,

    /// Maximum concurrent mirror operations
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

/// HTTP trigger configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_http_bind")]
    pub bind: String,
}

/// Service process configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact" | "full"
}

// Default value functions
fn default_mirror_root() -> String {
    "${HOME}/git-mirrors".to_string()
}
fn default_state_db() -> String {
    let base = data_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("mirrorsentry")
        .join("state.db")
        .to_string_lossy()
        .into_owned()
}
fn default_export_port() -> u16 {
    9418
}
fn default_public_host() -> String {
    "localhost".to_string()
}
fn default_git_program() -> String {
    "git".to_string()
}
fn default_startup_grace() -> String {
    "500ms".to_string()
}
fn default_stop_grace() -> String {
    "1s".to_string()
}
fn default_interval() -> String {
    "1m".to_string()
}
fn default_incremental_window() -> String {
    "1h".to_string()
}
fn default_lease_wait() -> String {
    "30s".to_string()
}
fn default_operation_timeout() -> String {
    "10m".to_string()
}
fn default_max_parallel() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_http_bind() -> String {
    "127.0.0.1:8888".to_string()
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/mirrorsentry.pid", runtime_dir)
    } else {
        "/tmp/mirrorsentry.pid".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            port: default_export_port(),
            public_host: default_public_host(),
            listen: None,
            program: default_git_program(),
            startup_grace: default_startup_grace(),
            stop_grace: default_stop_grace(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            incremental_window: default_incremental_window(),
            lease_wait: default_lease_wait(),
            operation_timeout: default_operation_timeout(),
            max_parallel: default_max_parallel(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_http_bind(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Longest incremental window accepted (ten years)
pub const MAX_INCREMENTAL_WINDOW: Duration = Duration::from_secs(3650 * 86400);

/// Parse duration strings like "500ms", "30s", "1m", "1h", "2d" or raw seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    if let Some(value) = duration_str.strip_suffix("ms") {
        value
            .parse::<u64>()
            .map(Duration::from_millis)
            .context("Invalid milliseconds value")
    } else if let Some(value) = duration_str.strip_suffix('s') {
        value
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("Invalid seconds value")
    } else if let Some(value) = duration_str.strip_suffix('m') {
        scaled_seconds(value, 60).context("Invalid minutes value")
    } else if let Some(value) = duration_str.strip_suffix('h') {
        scaled_seconds(value, 3600).context("Invalid hours value")
    } else if let Some(value) = duration_str.strip_suffix('d') {
        scaled_seconds(value, 86400).context("Invalid days value")
    } else {
        // Try to parse as raw seconds
        duration_str
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("Invalid duration format. Use format like '500ms', '30s', '1m', '1h'")
    }
}

fn scaled_seconds(value: &str, unit: u64) -> Result<Duration> {
    let count = value.parse::<u64>()?;
    count
        .checked_mul(unit)
        .map(Duration::from_secs)
        .with_context(|| format!("Duration {} is out of range", value))
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            config
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("mirrorsentry").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.mirror_root = shellexpand::full(&self.mirror_root)
            .context("Failed to expand mirror_root path")?
            .into_owned();

        self.state_db = shellexpand::full(&self.state_db)
            .context("Failed to expand state_db path")?
            .into_owned();

        if let Some(database) = &self.desired_state.database {
            self.desired_state.database = Some(
                shellexpand::full(database)
                    .context("Failed to expand desired_state.database path")?
                    .into_owned(),
            );
        }

        self.service.pid_file = shellexpand::full(&self.service.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        Ok(())
    }

    /// Apply `MIRRORSENTRY_*` environment overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(root) = std::env::var("MIRRORSENTRY_MIRROR_ROOT") {
            self.mirror_root = shellexpand::full(&root)
                .context("Failed to expand MIRRORSENTRY_MIRROR_ROOT")?
                .into_owned();
        }

        if let Ok(port) = std::env::var("MIRRORSENTRY_EXPORT_PORT") {
            self.export.port = port
                .trim()
                .parse()
                .with_context(|| format!("Invalid MIRRORSENTRY_EXPORT_PORT: {}", port))?;
        }

        if let Ok(database) = std::env::var("MIRRORSENTRY_DATABASE") {
            self.desired_state.database = Some(
                shellexpand::full(&database)
                    .context("Failed to expand MIRRORSENTRY_DATABASE")?
                    .into_owned(),
            );
        }

        Ok(())
    }

    /// Reject settings that would only fail later at runtime
    pub fn validate(&self) -> Result<()> {
        if self.mirror_root.trim().is_empty() {
            bail!("mirror_root must not be empty");
        }
        if self.schedule.max_parallel == 0 {
            bail!("schedule.max_parallel must be at least 1");
        }
        for (key, duration) in [
            ("schedule.interval", self.interval()?),
            ("schedule.lease_wait", self.lease_wait()?),
            ("schedule.operation_timeout", self.operation_timeout()?),
        ] {
            if duration.is_zero() {
                bail!("{} must be greater than zero", key);
            }
        }
        if self.incremental_window()? > MAX_INCREMENTAL_WINDOW {
            bail!(
                "schedule.incremental_window must not exceed {} days",
                MAX_INCREMENTAL_WINDOW.as_secs() / 86400
            );
        }
        self.startup_grace()?;
        self.stop_grace()?;
        if self.http.enabled {
            self.http_bind()?;
        }
        Ok(())
    }

    pub fn mirror_root_path(&self) -> PathBuf {
        PathBuf::from(&self.mirror_root)
    }

    pub fn state_db_path(&self) -> PathBuf {
        PathBuf::from(&self.state_db)
    }

    pub fn interval(&self) -> Result<Duration> {
        parse_duration(&self.schedule.interval).context("Failed to parse schedule.interval")
    }

    pub fn incremental_window(&self) -> Result<Duration> {
        parse_duration(&self.schedule.incremental_window)
            .context("Failed to parse schedule.incremental_window")
    }

    pub fn lease_wait(&self) -> Result<Duration> {
        parse_duration(&self.schedule.lease_wait).context("Failed to parse schedule.lease_wait")
    }

    pub fn operation_timeout(&self) -> Result<Duration> {
        parse_duration(&self.schedule.operation_timeout)
            .context("Failed to parse schedule.operation_timeout")
    }

    pub fn startup_grace(&self) -> Result<Duration> {
        parse_duration(&self.export.startup_grace).context("Failed to parse export.startup_grace")
    }

    pub fn stop_grace(&self) -> Result<Duration> {
        parse_duration(&self.export.stop_grace).context("Failed to parse export.stop_grace")
    }

    pub fn http_bind(&self) -> Result<SocketAddr> {
        self.http
            .bind
            .parse()
            .with_context(|| format!("Invalid http.bind address: {}", self.http.bind))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mirror_root: default_mirror_root(),
            state_db: default_state_db(),
            desired_state: DesiredStateConfig::default(),
            export: ExportConfig::default(),
            schedule: ScheduleConfig::default(),
            http: HttpConfig::default(),
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
