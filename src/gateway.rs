//! Desired-state gateway
//!
//! The reconciliation passes ask a gateway which repositories should be
//! mirrored. The gateway is read-only from the engine's point of view.

use crate::config::{Config, StaticRepository};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A repository that should have a mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDescriptor {
    /// Mirror directory name, unique and filesystem-safe
    pub name: String,

    /// Origin to clone from; the scheme may be omitted
    pub source_url: String,

    /// When the repository entered the desired-state list
    pub desired_since: DateTime<Utc>,
}

impl RepositoryDescriptor {
    pub fn new(
        name: impl Into<String>,
        source_url: impl Into<String>,
        desired_since: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            source_url: source_url.into(),
            desired_since,
        }
    }

    /// Build an ad-hoc descriptor from a URL alone, naming the mirror after
    /// the URL's last path segment (minus any `.git` suffix)
    pub fn from_url(source_url: &str, name: Option<&str>) -> Self {
        let name = match name {
            Some(name) => name.to_string(),
            None => name_from_url(source_url),
        };
        Self::new(name, source_url, Utc::now())
    }
}

/// Derive a mirror name from the last path segment of a URL
pub fn name_from_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let segment = trimmed
        .rsplit(|c: char| c == '/' || c == ':')
        .next()
        .unwrap_or(trimmed);
    segment.strip_suffix(".git").unwrap_or(segment).to_string()
}

/// Source of repository descriptors
#[async_trait]
pub trait DesiredStateGateway: Send + Sync {
    /// Descriptors desired since `since`, or all of them when `None`
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RepositoryDescriptor>>;

    /// Source name for display/logging
    fn source_name(&self) -> &'static str;
}

/// Build the gateway selected by the configuration
pub fn from_config(config: &Config) -> Result<Arc<dyn DesiredStateGateway>> {
    match &config.desired_state.database {
        Some(path) => Ok(Arc::new(SqliteGateway::new(path))),
        None => {
            let gateway = MemoryGateway::from_static(&config.desired_state.repositories)?;
            if gateway.is_empty() {
                warn!("No desired-state database or repositories configured");
            }
            Ok(Arc::new(gateway))
        }
    }
}

// =============================================================================
// SQLite gateway
// =============================================================================

/// Reads `plugin_repo_name(plugin_repo_name, plugin_key, created_at)`
pub struct SqliteGateway {
    path: PathBuf,
}

impl SqliteGateway {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn query(path: &Path, since: Option<DateTime<Utc>>) -> Result<Vec<RepositoryDescriptor>> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open desired-state database {}", path.display()))?;

        let mut stmt = conn
            .prepare(
                "SELECT plugin_repo_name, plugin_key, created_at FROM plugin_repo_name ORDER BY plugin_repo_name",
            )
            .context("Failed to prepare desired-state query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })
            .context("Failed to query desired-state repositories")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read desired-state rows")?;

        let mut descriptors = Vec::with_capacity(rows.len());
        for (name, url, created_at) in rows {
            let desired_since = match created_at.as_deref().map(parse_timestamp) {
                Some(Some(ts)) => ts,
                Some(None) => {
                    warn!("Ignoring {}: unparseable created_at {:?}", name, created_at);
                    continue;
                }
                // Rows without a timestamp only take part in full passes
                None => DateTime::<Utc>::MIN_UTC,
            };

            if since.is_some_and(|since| desired_since < since) {
                continue;
            }
            descriptors.push(RepositoryDescriptor::new(name, url, desired_since));
        }

        Ok(descriptors)
    }
}

#[async_trait]
impl DesiredStateGateway for SqliteGateway {
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RepositoryDescriptor>> {
        let path = self.path.clone();
        let descriptors = tokio::task::spawn_blocking(move || Self::query(&path, since))
            .await
            .context("Desired-state query task panicked")??;

        debug!(
            "Fetched {} descriptors from {} (since: {:?})",
            descriptors.len(),
            self.path.display(),
            since
        );
        Ok(descriptors)
    }

    fn source_name(&self) -> &'static str {
        "sqlite"
    }
}

/// Accepts RFC 3339 or SQLite's `YYYY-MM-DD HH:MM:SS` (taken as UTC)
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

// =============================================================================
// In-memory gateway
// =============================================================================

/// Fixed descriptor list, from the config file or built in code
#[derive(Debug, Clone, Default)]
pub struct MemoryGateway {
    descriptors: Vec<RepositoryDescriptor>,
}

impl MemoryGateway {
    pub fn new(descriptors: Vec<RepositoryDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn from_static(repositories: &[StaticRepository]) -> Result<Self> {
        let now = Utc::now();
        let descriptors = repositories
            .iter()
            .map(|repo| {
                let since = match &repo.since {
                    Some(raw) => parse_timestamp(raw)
                        .with_context(|| format!("Invalid 'since' for {}: {}", repo.name, raw))?,
                    None => now,
                };
                Ok(RepositoryDescriptor::new(&repo.name, &repo.url, since))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { descriptors })
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[async_trait]
impl DesiredStateGateway for MemoryGateway {
    async fn fetch(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RepositoryDescriptor>> {
        Ok(self
            .descriptors
            .iter()
            .filter(|d| since.map_or(true, |since| d.desired_since >= since))
            .cloned()
            .collect())
    }

    fn source_name(&self) -> &'static str {
        "static"
    }
}
