//! Mirror Lifecycle Manager - brings one mirror to `ready`
//!
//! Callers must hold the lease for the descriptor's name; this module does
//! not lock anything itself.

use crate::error::{MirrorError, MirrorResult};
use crate::gateway::RepositoryDescriptor;
use crate::git::Vcs;
use crate::store::{MirrorState, MirrorStore};
use regex::Regex;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// What a successful lifecycle operation did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorAction {
    Created,
    Updated,
}

/// A mirror that is ready to be served
#[derive(Debug, Clone, Serialize)]
pub struct MirrorOutcome {
    pub name: String,
    pub path: PathBuf,
    pub clone_url: String,
    pub action: MirrorAction,
}

/// Where git daemon is reachable, for building clone URLs
#[derive(Debug, Clone)]
pub struct ExportAddress {
    pub host: String,
    pub port: u16,
}

impl ExportAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn clone_url(&self, name: &str) -> String {
        format!("git://{}:{}/{}", self.host, self.port, name)
    }
}

/// Prepend `https://` when the URL carries no scheme
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

fn name_pattern() -> Result<&'static Regex, &'static regex::Error> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$"))
        .as_ref()
}

/// Reject names that could escape the mirror root or collide with git internals
pub fn validate_descriptor(descriptor: &RepositoryDescriptor) -> MirrorResult<()> {
    let name = &descriptor.name;
    if name.is_empty() {
        return Err(MirrorError::invalid(name, "name is empty"));
    }
    if name.len() > 255 {
        return Err(MirrorError::invalid(name, "name is longer than 255 bytes"));
    }
    let pattern = name_pattern()
        .map_err(|e| MirrorError::invalid(name, format!("name pattern unavailable: {}", e)))?;
    if !pattern.is_match(name) {
        return Err(MirrorError::invalid(
            name,
            "name may only contain letters, digits, '.', '_' and '-' and must not start with a separator",
        ));
    }
    if name.contains("..") {
        return Err(MirrorError::invalid(name, "name must not contain '..'"));
    }

    let url = descriptor.source_url.trim();
    if url.is_empty() {
        return Err(MirrorError::invalid(name, "source URL is empty"));
    }
    if url.chars().any(char::is_whitespace) {
        return Err(MirrorError::invalid(name, "source URL contains whitespace"));
    }
    if url.starts_with('-') {
        return Err(MirrorError::invalid(name, "source URL must not start with '-'"));
    }

    Ok(())
}

/// Performs create/update operations against one mirror at a time
pub struct MirrorManager {
    store: Arc<MirrorStore>,
    vcs: Arc<dyn Vcs>,
    export: ExportAddress,
    operation_timeout: Duration,
}

impl MirrorManager {
    pub fn new(
        store: Arc<MirrorStore>,
        vcs: Arc<dyn Vcs>,
        export: ExportAddress,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            vcs,
            export,
            operation_timeout,
        }
    }

    pub fn store(&self) -> &Arc<MirrorStore> {
        &self.store
    }

    pub fn export(&self) -> &ExportAddress {
        &self.export
    }

    /// Destroy any existing mirror for the descriptor and clone it afresh
    pub async fn create_mirror(
        &self,
        descriptor: &RepositoryDescriptor,
    ) -> MirrorResult<MirrorOutcome> {
        validate_descriptor(descriptor)?;
        let name = descriptor.name.as_str();
        let dir = self.store.directory_for(name);

        if let Err(e) = self.remove_existing(name, &dir).await {
            return self.fail(name, e).await;
        }

        let url = normalize_url(&descriptor.source_url);
        self.transition(name, MirrorState::Cloning, None).await?;
        info!("Cloning {} -> {}", url, dir.display());

        let cloned = async {
            self.ensure_root().await?;
            self.bounded(&url, &dir, self.vcs.clone_mirror(&url, &dir), true)
                .await?;
            self.write_marker(&dir).await
        }
        .await;

        match cloned {
            Ok(()) => self.succeed(name, dir, MirrorAction::Created).await,
            Err(e) => self.fail(name, e).await,
        }
    }

    /// Fetch new refs into an existing mirror; a missing or broken mirror is
    /// cloned from scratch instead
    pub async fn update_mirror(
        &self,
        descriptor: &RepositoryDescriptor,
    ) -> MirrorResult<MirrorOutcome> {
        validate_descriptor(descriptor)?;
        let name = descriptor.name.as_str();
        let dir = self.store.directory_for(name);

        if !MirrorStore::is_bare_repository(&dir) {
            warn!(
                "No usable mirror for {} at {}, falling back to a fresh clone",
                name,
                dir.display()
            );
            return self.create_mirror(descriptor).await;
        }

        let url = normalize_url(&descriptor.source_url);
        self.transition(name, MirrorState::Updating, None).await?;
        debug!("Fetching {} into {}", url, dir.display());

        let fetched = async {
            self.bounded(&url, &dir, self.vcs.fetch_mirror(&url, &dir), false)
                .await?;
            self.write_marker(&dir).await
        }
        .await;

        match fetched {
            Ok(()) => self.succeed(name, dir, MirrorAction::Updated).await,
            Err(e) => self.fail(name, e).await,
        }
    }

    /// Run a VCS future under the operation timeout. Dropping the future on
    /// timeout kills the subprocess.
    async fn bounded<F>(&self, url: &str, dir: &Path, op: F, cloning: bool) -> MirrorResult<()>
    where
        F: Future<Output = MirrorResult<()>>,
    {
        match timeout(self.operation_timeout, op).await {
            Ok(result) => result,
            Err(_) => {
                let message = format!("timed out after {:?}", self.operation_timeout);
                if cloning {
                    Err(MirrorError::CloneFailure {
                        url: url.to_string(),
                        message,
                    })
                } else {
                    Err(MirrorError::FetchFailure {
                        path: dir.to_path_buf(),
                        message,
                    })
                }
            }
        }
    }

    async fn remove_existing(&self, name: &str, dir: &Path) -> MirrorResult<()> {
        match tokio::fs::symlink_metadata(dir).await {
            Ok(_) => {
                info!("Removing existing mirror directory {}", dir.display());
                tokio::fs::remove_dir_all(dir)
                    .await
                    .map_err(|e| MirrorError::filesystem(dir, e))?;
                self.transition(name, MirrorState::Absent, None).await?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MirrorError::filesystem(dir, e)),
        }
    }

    async fn ensure_root(&self) -> MirrorResult<()> {
        let root = self.store.root();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| MirrorError::filesystem(root, e))
    }

    async fn write_marker(&self, dir: &Path) -> MirrorResult<()> {
        let marker = dir.join(crate::store::EXPORT_MARKER);
        tokio::fs::write(&marker, b"")
            .await
            .map_err(|e| MirrorError::filesystem(&marker, e))
    }

    async fn transition(
        &self,
        name: &str,
        state: MirrorState,
        error: Option<String>,
    ) -> MirrorResult<()> {
        let name = name.to_string();
        self.store
            .blocking(move |store| store.record_transition(&name, state, error.as_deref()))
            .await
            .map(|_| ())
    }

    async fn succeed(
        &self,
        name: &str,
        path: PathBuf,
        action: MirrorAction,
    ) -> MirrorResult<MirrorOutcome> {
        self.transition(name, MirrorState::Ready, None).await?;
        let clone_url = self.export.clone_url(name);
        info!("Mirror {} ready ({:?}), clone URL: {}", name, action, clone_url);

        Ok(MirrorOutcome {
            name: name.to_string(),
            path,
            clone_url,
            action,
        })
    }

    async fn fail(&self, name: &str, err: MirrorError) -> MirrorResult<MirrorOutcome> {
        error!("Mirror {} failed: {}", name, err);
        if let Err(store_err) = self
            .transition(name, MirrorState::Failed, Some(err.to_string()))
            .await
        {
            error!("Failed to record failure for {}: {}", name, store_err);
        }
        Err(err)
    }
}
