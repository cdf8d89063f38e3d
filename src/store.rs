//! Mirror Store - SQLite-backed registry of mirror state
//!
//! Records survive restarts so that a crash in the middle of a clone or fetch
//! leaves a `cloning`/`updating` row behind instead of a stale `ready`.
//! Directory layout is derived, never stored: `<root>/<name>`.

use crate::error::{MirrorError, MirrorResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// File whose presence tells git daemon a repository may be served
pub const EXPORT_MARKER: &str = "git-daemon-export-ok";

/// Lifecycle state of a single mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorState {
    Absent,
    Cloning,
    Ready,
    Updating,
    Failed,
}

impl MirrorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorState::Absent => "absent",
            MirrorState::Cloning => "cloning",
            MirrorState::Ready => "ready",
            MirrorState::Updating => "updating",
            MirrorState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cloning" => MirrorState::Cloning,
            "ready" => MirrorState::Ready,
            "updating" => MirrorState::Updating,
            "failed" => MirrorState::Failed,
            _ => MirrorState::Absent,
        }
    }

    /// An operation was in flight when this state was recorded
    pub fn is_transient(&self) -> bool {
        matches!(self, MirrorState::Cloning | MirrorState::Updating)
    }
}

/// Mirror state record
#[derive(Debug, Clone, Serialize)]
pub struct MirrorRecord {
    pub name: String,
    pub path: PathBuf,
    pub state: MirrorState,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Registry mapping repository names to mirror state
pub struct MirrorStore {
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl MirrorStore {
    /// Open or create the state database at `db_path` for mirrors under `root`
    pub fn open(root: impl Into<PathBuf>, db_path: &Path) -> MirrorResult<Self> {
        let root = root.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MirrorError::filesystem(parent, e))?;
        }

        let conn = Connection::open(db_path)?;
        let store = Self::with_connection(root, conn)?;

        info!("Mirror state database opened at {}", db_path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing and one-shot commands)
    pub fn open_in_memory(root: impl Into<PathBuf>) -> MirrorResult<Self> {
        Self::with_connection(root.into(), Connection::open_in_memory()?)
    }

    fn with_connection(root: PathBuf, conn: Connection) -> MirrorResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS mirrors (
                name TEXT PRIMARY KEY NOT NULL,
                state TEXT NOT NULL DEFAULT 'absent',
                last_synced_at TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Mirror state schema initialized");
        Ok(Self {
            root,
            conn: Mutex::new(conn),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic location of the mirror for `name`
    pub fn directory_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn marker_path(&self, name: &str) -> PathBuf {
        self.directory_for(name).join(EXPORT_MARKER)
    }

    /// Current known state of `name`; `None` if it was never reconciled.
    ///
    /// A persisted `ready` whose directory or export marker has since
    /// disappeared is reported as `absent`.
    pub fn lookup(&self, name: &str) -> MirrorResult<Option<MirrorRecord>> {
        let record = Self::read(&self.conn(), name)?.map(|row| self.to_record(row));
        Ok(record.map(|record| self.verified(record)))
    }

    /// All records, ordered by name
    pub fn list(&self) -> MirrorResult<Vec<MirrorRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, state, last_synced_at, last_error FROM mirrors ORDER BY name",
        )?;

        let rows = stmt
            .query_map([], Self::row_to_stored)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|row| self.verified(self.to_record(row)))
            .collect())
    }

    /// Record a state transition for `name` and return the resulting record.
    ///
    /// `Ready` advances `last_synced_at` (never backwards) and clears the
    /// last error; `Failed` stores `error`.
    pub fn record_transition(
        &self,
        name: &str,
        new_state: MirrorState,
        error: Option<&str>,
    ) -> MirrorResult<MirrorRecord> {
        let conn = self.conn();
        let previous = Self::read(&conn, name)?;
        let now = Utc::now();

        let previous_synced = previous.as_ref().and_then(|row| row.last_synced_at);
        let previous_error = previous.and_then(|row| row.last_error);

        let (last_synced_at, last_error) = match new_state {
            MirrorState::Ready => (Some(previous_synced.map_or(now, |prev| prev.max(now))), None),
            MirrorState::Failed => (
                previous_synced,
                Some(error.unwrap_or("unknown error").to_string()),
            ),
            _ => (previous_synced, error.map(str::to_string).or(previous_error)),
        };

        conn.execute(
            r#"
            INSERT INTO mirrors (name, state, last_synced_at, last_error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(name) DO UPDATE SET
                state = ?2,
                last_synced_at = ?3,
                last_error = ?4,
                updated_at = ?5
            "#,
            params![
                name,
                new_state.as_str(),
                last_synced_at.map(|t| t.to_rfc3339()),
                last_error,
                now.to_rfc3339(),
            ],
        )?;

        debug!("Mirror state: {} -> {}", name, new_state.as_str());
        Ok(MirrorRecord {
            name: name.to_string(),
            path: self.directory_for(name),
            state: new_state,
            last_synced_at,
            last_error,
        })
    }

    /// Whether `path` looks like a bare git repository
    pub fn is_bare_repository(path: &Path) -> bool {
        path.join("HEAD").is_file() && path.join("objects").is_dir() && path.join("refs").is_dir()
    }

    fn verified(&self, mut record: MirrorRecord) -> MirrorRecord {
        if record.state == MirrorState::Ready
            && !(Self::is_bare_repository(&record.path) && record.path.join(EXPORT_MARKER).is_file())
        {
            debug!(
                "Mirror {} recorded ready but missing on disk at {}",
                record.name,
                record.path.display()
            );
            record.state = MirrorState::Absent;
        }
        record
    }

    fn to_record(&self, row: StoredRow) -> MirrorRecord {
        MirrorRecord {
            path: self.directory_for(&row.name),
            name: row.name,
            state: row.state,
            last_synced_at: row.last_synced_at,
            last_error: row.last_error,
        }
    }

    fn read(conn: &Connection, name: &str) -> MirrorResult<Option<StoredRow>> {
        let row = conn
            .query_row(
                "SELECT name, state, last_synced_at, last_error FROM mirrors WHERE name = ?1",
                params![name],
                Self::row_to_stored,
            )
            .optional()?;
        Ok(row)
    }

    fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
        Ok(StoredRow {
            name: row.get(0)?,
            state: MirrorState::parse(&row.get::<_, String>(1)?),
            last_synced_at: row
                .get::<_, Option<String>>(2)?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            last_error: row.get(3)?,
        })
    }

    /// Run `op` on the blocking thread pool so SQLite I/O stays off async workers
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> MirrorResult<T>
    where
        F: FnOnce(&MirrorStore) -> MirrorResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| MirrorError::StoreTask(e.to_string()))?
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct StoredRow {
    name: String,
    state: MirrorState,
    last_synced_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}
