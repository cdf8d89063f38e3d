//! Common test utilities and helpers for MirrorSentry tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use mirrorsentry::{
    ExportAddress, LeaseTable, MirrorEngine, MirrorError, MirrorManager, MirrorResult, MirrorStore,
    RepositoryDescriptor, Vcs,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// URLs containing this fail to clone/fetch
pub const UNREACHABLE: &str = "unreachable";
/// URLs containing this never finish
pub const HANGS: &str = "hangs";

/// One recorded VCS invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsCall {
    pub op: &'static str,
    pub url: String,
    pub dest: PathBuf,
}

/// Fake VCS that records concurrency per destination.
///
/// Successful calls leave a minimal bare repository layout behind.
pub struct RecordingVcs {
    delay: Duration,
    in_flight: Mutex<HashMap<PathBuf, usize>>,
    max_per_dest: Mutex<HashMap<PathBuf, usize>>,
    global_in_flight: AtomicUsize,
    global_max: AtomicUsize,
    calls: Mutex<Vec<VcsCall>>,
}

struct InFlight<'a> {
    vcs: &'a RecordingVcs,
    dest: PathBuf,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.vcs.in_flight.lock().unwrap().get_mut(&self.dest) {
            *count -= 1;
        }
        self.vcs.global_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RecordingVcs {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: Mutex::new(HashMap::new()),
            max_per_dest: Mutex::new(HashMap::new()),
            global_in_flight: AtomicUsize::new(0),
            global_max: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn enter(&self, op: &'static str, url: &str, dest: &Path) -> InFlight<'_> {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(dest.to_path_buf()).or_insert(0);
            *count += 1;
            let mut max = self.max_per_dest.lock().unwrap();
            let peak = max.entry(dest.to_path_buf()).or_insert(0);
            *peak = (*peak).max(*count);
        }
        let now = self.global_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.global_max.fetch_max(now, Ordering::SeqCst);

        self.calls.lock().unwrap().push(VcsCall {
            op,
            url: url.to_string(),
            dest: dest.to_path_buf(),
        });

        InFlight {
            vcs: self,
            dest: dest.to_path_buf(),
        }
    }

    async fn work(&self, url: &str) {
        if url.contains(HANGS) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(self.delay).await;
    }

    /// Highest number of simultaneous calls seen for `dest`
    pub fn max_in_flight(&self, dest: &Path) -> usize {
        self.max_per_dest
            .lock()
            .unwrap()
            .get(dest)
            .copied()
            .unwrap_or(0)
    }

    pub fn in_flight(&self, dest: &Path) -> usize {
        self.in_flight.lock().unwrap().get(dest).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous calls across all destinations
    pub fn global_max(&self) -> usize {
        self.global_max.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn fake_bare_repo(dest: &Path) {
    std::fs::create_dir_all(dest.join("objects")).unwrap();
    std::fs::create_dir_all(dest.join("refs")).unwrap();
    std::fs::write(dest.join("HEAD"), "ref: refs/heads/main\n").unwrap();
}

#[async_trait]
impl Vcs for RecordingVcs {
    async fn clone_mirror(&self, url: &str, dest: &Path) -> MirrorResult<()> {
        let _guard = self.enter("clone", url, dest);
        self.work(url).await;

        if url.contains(UNREACHABLE) {
            return Err(MirrorError::CloneFailure {
                url: url.to_string(),
                message: "fatal: unable to access: Could not resolve host".to_string(),
            });
        }
        assert!(!dest.exists(), "clone target {} already exists", dest.display());
        fake_bare_repo(dest);
        Ok(())
    }

    async fn fetch_mirror(&self, url: &str, dest: &Path) -> MirrorResult<()> {
        let _guard = self.enter("fetch", url, dest);
        self.work(url).await;

        if url.contains(UNREACHABLE) {
            return Err(MirrorError::FetchFailure {
                path: dest.to_path_buf(),
                message: "fatal: the remote end hung up unexpectedly".to_string(),
            });
        }
        Ok(())
    }
}

/// Engine wired to a [`RecordingVcs`] and a throwaway mirror root
pub struct TestEngine {
    pub temp_dir: TempDir,
    pub vcs: Arc<RecordingVcs>,
    pub engine: Arc<MirrorEngine>,
}

pub struct EngineBuilder {
    delay: Duration,
    max_parallel: usize,
    lease_wait: Duration,
    operation_timeout: Duration,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(20),
            max_parallel: 8,
            lease_wait: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineBuilder {
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn lease_wait(mut self, lease_wait: Duration) -> Self {
        self.lease_wait = lease_wait;
        self
    }

    pub fn operation_timeout(mut self, operation_timeout: Duration) -> Self {
        self.operation_timeout = operation_timeout;
        self
    }

    pub fn build(self) -> TestEngine {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("mirrors");
        let store = Arc::new(
            MirrorStore::open(&root, &temp_dir.path().join("state.db"))
                .expect("Failed to open store"),
        );

        let vcs = Arc::new(RecordingVcs::new(self.delay));
        let manager = Arc::new(MirrorManager::new(
            store,
            vcs.clone(),
            ExportAddress::new("localhost", 9418),
            self.operation_timeout,
        ));
        let engine = Arc::new(MirrorEngine::new(
            manager,
            Arc::new(LeaseTable::new()),
            self.max_parallel,
            self.lease_wait,
        ));

        TestEngine {
            temp_dir,
            vcs,
            engine,
        }
    }
}

impl TestEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn dir(&self, name: &str) -> PathBuf {
        self.engine.store().directory_for(name)
    }
}

/// Descriptor desired right now, sourced from `example.com/<name>.git`
pub fn descriptor(name: &str) -> RepositoryDescriptor {
    RepositoryDescriptor::new(name, format!("example.com/{}.git", name), Utc::now())
}

pub fn descriptor_with_url(name: &str, url: &str) -> RepositoryDescriptor {
    RepositoryDescriptor::new(name, url, Utc::now())
}

/// Whether the `git` binary can be run
pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Write a config file pointing every path into `dir`
pub fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let config = format!(
        r#"
mirror_root: "{root}"
state_db: "{db}"
service:
  pid_file: "{pid}"
http:
  enabled: false
{extra}
"#,
        root = dir.join("mirrors").display(),
        db = dir.join("state.db").display(),
        pid = dir.join("mirrorsentry.pid").display(),
        extra = extra,
    );
    let path = dir.join("config.yml");
    std::fs::write(&path, config).expect("Failed to write test config");
    path
}
