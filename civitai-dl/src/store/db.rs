//! Durable, crash-safe task store on embedded SQLite.
//!
//! Single-writer: every mutation goes through one connection behind a
//! mutex. The database file lives at `<root>/.state/tasks.db` with a
//! `.bak` copy rotated before each checkpoint; corruption of the primary
//! falls back to the backup automatically at open.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult, ErrorClass};
use crate::store::task::{payload_dest, NewTask, Task, TaskKind, TaskStatus};

/// Checkpoint after this many state transitions...
const CHECKPOINT_TRANSITIONS: u32 = 50;

/// ...or after this much time, whichever comes first.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    kind          TEXT NOT NULL,
    payload       TEXT NOT NULL,
    status        TEXT NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 0,
    error_class   TEXT,
    error_message TEXT,
    dedup_key     TEXT NOT NULL UNIQUE,
    not_before    TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, created_at, id);

CREATE TABLE IF NOT EXISTS artifacts (
    digest TEXT PRIMARY KEY,
    path   TEXT NOT NULL
);
";

/// Per-status task counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_flight: u64,
    pub done: u64,
    pub failed: u64,
    pub quarantined: u64,
    pub skipped: u64,
}

impl StatusCounts {
    pub fn non_terminal(&self) -> u64 {
        self.pending + self.in_flight + self.failed
    }

    pub fn total(&self) -> u64 {
        self.non_terminal() + self.done + self.quarantined + self.skipped
    }
}

struct Inner {
    conn: Connection,
    transitions: u32,
    last_checkpoint: Instant,
}

/// The durable record of every unit of work and its lifecycle.
pub struct TaskStore {
    inner: Mutex<Inner>,
    db_path: PathBuf,
    bak_path: PathBuf,
}

impl TaskStore {
    /// Opens (or creates) the store, falling back to the `.bak` copy when
    /// the primary cannot be opened or fails its schema check.
    pub fn open(db_path: &Path) -> EngineResult<Self> {
        let bak_path = db_path.with_extension("db.bak");

        let conn = match Self::open_and_init(db_path) {
            Ok(conn) => conn,
            Err(primary_err) if bak_path.exists() => {
                warn!(
                    path = %db_path.display(),
                    error = %primary_err,
                    "primary task store unreadable; restoring from backup"
                );
                std::fs::copy(&bak_path, db_path)
                    .map_err(|e| EngineError::io(db_path, e))?;
                Self::open_and_init(db_path)?
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                transitions: 0,
                last_checkpoint: Instant::now(),
            }),
            db_path: db_path.to_path_buf(),
            bak_path,
        })
    }

    fn open_and_init(path: &Path) -> EngineResult<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        // A cheap integrity probe; corrupted files fail here.
        conn.query_row("SELECT count(*) FROM tasks", [], |_| Ok(()))?;
        Ok(conn)
    }

    /// Idempotent enqueue keyed by (kind, remote-id, target-path).
    /// Returns true when the task was actually inserted.
    pub fn enqueue(&self, task: NewTask) -> EngineResult<bool> {
        let mut inner = self.lock();
        let now = ts(Utc::now());
        let inserted = inner.conn.execute(
            "INSERT OR IGNORE INTO tasks
                 (id, kind, payload, status, attempts, dedup_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5)",
            params![
                task.id,
                task.kind.as_str(),
                task.payload.to_string(),
                task.dedup_key,
                now
            ],
        )?;
        if inserted > 0 {
            self.bump(&mut inner)?;
        }
        Ok(inserted > 0)
    }

    /// Atomically claims up to `limit` eligible tasks of the given kinds,
    /// marking them in-flight. Claim order is (created_at, id) FIFO.
    pub fn claim(&self, kinds: &[TaskKind], limit: usize) -> EngineResult<Vec<Task>> {
        let mut inner = self.lock();
        let now = ts(Utc::now());

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let select = format!(
            "SELECT id, kind, payload, status, attempts, error_class, error_message,
                    dedup_key, not_before, created_at, updated_at
               FROM tasks
              WHERE status = 'pending'
                AND kind IN ({placeholders})
                AND (not_before IS NULL OR not_before <= ?)
              ORDER BY created_at, id
              LIMIT ?"
        );

        let kind_names: Vec<&'static str> = kinds.iter().map(|k| k.as_str()).collect();
        let limit = limit as i64;

        let tx = inner.conn.transaction()?;
        let mut tasks = {
            let mut stmt = tx.prepare(&select)?;
            let mut params: Vec<&dyn rusqlite::types::ToSql> = kind_names
                .iter()
                .map(|k| k as &dyn rusqlite::types::ToSql)
                .collect();
            params.push(&now);
            params.push(&limit);

            let rows = stmt.query_map(params.as_slice(), row_to_task)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        for task in &mut tasks {
            tx.execute(
                "UPDATE tasks SET status = 'in_flight', updated_at = ?1 WHERE id = ?2",
                params![now, task.id],
            )?;
            task.status = TaskStatus::InFlight;
        }
        tx.commit()?;

        let claimed = tasks.len() as u32;
        if claimed > 0 {
            inner.transitions += claimed;
            self.maybe_checkpoint(&mut inner)?;
        }
        Ok(tasks)
    }

    /// Records a terminal (or failed) outcome. `attempts_delta` counts the
    /// HTTP attempts consumed while executing; attempts are monotonic.
    pub fn complete(
        &self,
        id: &str,
        status: TaskStatus,
        attempts_delta: u32,
        error: Option<(ErrorClass, String)>,
    ) -> EngineResult<()> {
        let mut inner = self.lock();
        let (class, message) = match error {
            Some((class, message)) => (Some(class.as_str()), Some(message)),
            None => (None, None),
        };
        inner.conn.execute(
            "UPDATE tasks
                SET status = ?1, attempts = attempts + ?2,
                    error_class = ?3, error_message = ?4,
                    not_before = NULL, updated_at = ?5
              WHERE id = ?6",
            params![status.as_str(), attempts_delta, class, message, ts(Utc::now()), id],
        )?;
        self.bump(&mut inner)
    }

    /// Returns a failed task to `pending`, eligible again after `delay`.
    pub fn requeue(
        &self,
        id: &str,
        delay: Duration,
        attempts_delta: u32,
        error: Option<(ErrorClass, String)>,
    ) -> EngineResult<()> {
        let mut inner = self.lock();
        let eligible =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let (class, message) = match error {
            Some((class, message)) => (Some(class.as_str()), Some(message)),
            None => (None, None),
        };
        inner.conn.execute(
            "UPDATE tasks
                SET status = 'pending', attempts = attempts + ?1,
                    error_class = ?2, error_message = ?3,
                    not_before = ?4, updated_at = ?5
              WHERE id = ?6",
            params![attempts_delta, class, message, ts(eligible), ts(Utc::now()), id],
        )?;
        self.bump(&mut inner)
    }

    /// Returns a cancelled in-flight task to `pending` without consuming
    /// an attempt.
    pub fn release(&self, id: &str) -> EngineResult<()> {
        let mut inner = self.lock();
        inner.conn.execute(
            "UPDATE tasks SET status = 'pending', updated_at = ?1
              WHERE id = ?2 AND status = 'in_flight'",
            params![ts(Utc::now()), id],
        )?;
        self.bump(&mut inner)
    }

    /// Startup recovery: every in-flight task returns to `pending`.
    /// Terminal tasks stay put and act as skip gates via the dedup key.
    pub fn resume(&self) -> EngineResult<usize> {
        let mut inner = self.lock();
        let moved = inner.conn.execute(
            "UPDATE tasks SET status = 'pending', not_before = NULL, updated_at = ?1
              WHERE status = 'in_flight'",
            params![ts(Utc::now())],
        )?;
        if moved > 0 {
            info!(count = moved, "recovered in-flight tasks to pending");
            inner.transitions += moved as u32;
            self.maybe_checkpoint(&mut inner)?;
        }
        Ok(moved)
    }

    /// Per-status counts across the whole store.
    pub fn counts(&self) -> EngineResult<StatusCounts> {
        let inner = self.lock();
        let mut counts = StatusCounts::default();
        let mut stmt = inner
            .conn
            .prepare("SELECT status, count(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match TaskStatus::parse(&status) {
                Some(TaskStatus::Pending) => counts.pending = count,
                Some(TaskStatus::InFlight) => counts.in_flight = count,
                Some(TaskStatus::Done) => counts.done = count,
                Some(TaskStatus::Failed) => counts.failed = count,
                Some(TaskStatus::Quarantined) => counts.quarantined = count,
                Some(TaskStatus::Skipped) => counts.skipped = count,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Open work remaining for the given kinds (pending + in-flight).
    pub fn open_count(&self, kinds: &[TaskKind]) -> EngineResult<u64> {
        let inner = self.lock();
        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!(
            "SELECT count(*) FROM tasks
              WHERE status IN ('pending', 'in_flight') AND kind IN ({placeholders})"
        );
        let kind_names: Vec<&'static str> = kinds.iter().map(|k| k.as_str()).collect();
        let params: Vec<&dyn rusqlite::types::ToSql> = kind_names
            .iter()
            .map(|k| k as &dyn rusqlite::types::ToSql)
            .collect();
        Ok(inner
            .conn
            .query_row(&sql, params.as_slice(), |row| row.get(0))?)
    }

    /// All tasks that ended in `failed` or `quarantined`, for the
    /// shutdown summary.
    pub fn failures(&self) -> EngineResult<Vec<Task>> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT id, kind, payload, status, attempts, error_class, error_message,
                    dedup_key, not_before, created_at, updated_at
               FROM tasks
              WHERE status IN ('failed', 'quarantined')
              ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Destination paths of all open download tasks; used by the orphan
    /// `.tmp` scan to tell resumable partials from garbage.
    pub fn open_dest_paths(&self) -> EngineResult<HashSet<PathBuf>> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT payload FROM tasks WHERE status IN ('pending', 'in_flight')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut paths = HashSet::new();
        for row in rows {
            let payload = row?;
            if let Ok(value) = serde_json::from_str(&payload) {
                if let Some(dest) = payload_dest(&value) {
                    paths.insert(dest);
                }
            }
        }
        Ok(paths)
    }

    /// Records a verified on-disk artifact for digest-based dedup.
    pub fn record_artifact(&self, digest: &str, path: &Path) -> EngineResult<()> {
        let mut inner = self.lock();
        inner.conn.execute(
            "INSERT OR REPLACE INTO artifacts (digest, path) VALUES (?1, ?2)",
            params![digest.to_lowercase(), path.to_string_lossy()],
        )?;
        self.bump(&mut inner)
    }

    /// Looks up a previously-verified artifact by digest.
    pub fn artifact_path(&self, digest: &str) -> EngineResult<Option<PathBuf>> {
        let inner = self.lock();
        let path: Option<String> = inner
            .conn
            .query_row(
                "SELECT path FROM artifacts WHERE digest = ?1",
                params![digest.to_lowercase()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(PathBuf::from))
    }

    /// Forces a backup rotation and WAL checkpoint.
    pub fn flush(&self) -> EngineResult<()> {
        let mut inner = self.lock();
        self.checkpoint(&mut inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("task store mutex poisoned")
    }

    fn bump(&self, inner: &mut Inner) -> EngineResult<()> {
        inner.transitions += 1;
        self.maybe_checkpoint(inner)
    }

    fn maybe_checkpoint(&self, inner: &mut Inner) -> EngineResult<()> {
        if inner.transitions >= CHECKPOINT_TRANSITIONS
            || inner.last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL
        {
            self.checkpoint(inner)?;
        }
        Ok(())
    }

    /// Rotates the `.bak` copy, then checkpoints the WAL.
    fn checkpoint(&self, inner: &mut Inner) -> EngineResult<()> {
        let mut bak = Connection::open(&self.bak_path)?;
        let backup = rusqlite::backup::Backup::new(&inner.conn, &mut bak)?;
        backup.run_to_completion(64, Duration::ZERO, None)?;
        drop(backup);

        inner
            .conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        inner.transitions = 0;
        inner.last_checkpoint = Instant::now();
        Ok(())
    }

    /// Path of the primary database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let kind: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let status: String = row.get(3)?;
    let error_class: Option<String> = row.get(5)?;
    let not_before: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Task {
        id: row.get(0)?,
        kind: TaskKind::parse(&kind).unwrap_or(TaskKind::ModelFile),
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Failed),
        attempts: row.get(4)?,
        error_class: error_class.as_deref().and_then(ErrorClass::parse),
        error_message: row.get(6)?,
        dedup_key: row.get(7)?,
        not_before: not_before.and_then(|s| parse_ts(&s)),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_ts(&updated_at).unwrap_or_else(Utc::now),
    })
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::task::{FileTaskPayload, ImageTaskPayload};
    use tempfile::TempDir;

    fn file_task(version_id: u64, dest: &str) -> NewTask {
        NewTask::model_file(&FileTaskPayload {
            model_id: 1,
            version_id,
            url: format!("https://x/{version_id}"),
            file_name: "f.safetensors".into(),
            size_kb: 8.0,
            expected_sha256: None,
            dest: PathBuf::from(dest),
        })
    }

    fn open_store(dir: &TempDir) -> TaskStore {
        TaskStore::open(&dir.path().join("tasks.db")).unwrap()
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        assert!(store.enqueue(file_task(1, "/out/a")).unwrap());
        assert!(!store.enqueue(file_task(1, "/out/a")).unwrap());
        assert!(store.enqueue(file_task(2, "/out/b")).unwrap());

        let counts = store.counts().unwrap();
        assert_eq!(counts.pending, 2);
    }

    #[test]
    fn test_claim_marks_in_flight_fifo() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..5 {
            store.enqueue(file_task(i, &format!("/out/{i}"))).unwrap();
        }

        let claimed = store.claim(&[TaskKind::ModelFile], 3).unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|t| t.status == TaskStatus::InFlight));

        // Claims must be exclusive: the next claim sees only the rest.
        let rest = store.claim(&[TaskKind::ModelFile], 10).unwrap();
        assert_eq!(rest.len(), 2);

        let ids: HashSet<_> = claimed.iter().chain(rest.iter()).map(|t| &t.id).collect();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_claim_respects_kind_partition() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue(file_task(1, "/out/a")).unwrap();
        store
            .enqueue(NewTask::image(
                TaskKind::GalleryImage,
                &ImageTaskPayload {
                    image_id: Some(7),
                    url: "https://x/7.png".into(),
                    dest: PathBuf::from("/out/g/7.png"),
                },
            ))
            .unwrap();

        let images = store.claim(TaskKind::IMAGE_PIPELINE, 10).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].kind, TaskKind::GalleryImage);
    }

    #[test]
    fn test_requeue_delay_defers_claim() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue(file_task(1, "/out/a")).unwrap();

        let task = store.claim(&[TaskKind::ModelFile], 1).unwrap().remove(0);
        store
            .requeue(
                &task.id,
                Duration::from_secs(3600),
                1,
                Some((ErrorClass::Network, "reset".into())),
            )
            .unwrap();

        // Not eligible yet.
        assert!(store.claim(&[TaskKind::ModelFile], 1).unwrap().is_empty());

        let counts = store.counts().unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn test_complete_terminal_and_attempts_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue(file_task(1, "/out/a")).unwrap();

        let task = store.claim(&[TaskKind::ModelFile], 1).unwrap().remove(0);
        store
            .requeue(&task.id, Duration::ZERO, 2, None)
            .unwrap();
        let task = store.claim(&[TaskKind::ModelFile], 1).unwrap().remove(0);
        assert_eq!(task.attempts, 2);

        store
            .complete(&task.id, TaskStatus::Done, 1, None)
            .unwrap();
        let counts = store.counts().unwrap();
        assert_eq!(counts.done, 1);

        // Terminal tasks are not claimable.
        assert!(store.claim(&[TaskKind::ModelFile], 1).unwrap().is_empty());
    }

    #[test]
    fn test_resume_recovers_in_flight() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tasks.db");
        {
            let store = TaskStore::open(&db_path).unwrap();
            for i in 0..4 {
                store.enqueue(file_task(i, &format!("/out/{i}"))).unwrap();
            }
            let claimed = store.claim(&[TaskKind::ModelFile], 2).unwrap();
            store
                .complete(&claimed[0].id, TaskStatus::Done, 1, None)
                .unwrap();
            store.flush().unwrap();
            // Simulated crash: one in-flight, two pending, one done.
        }

        let store = TaskStore::open(&db_path).unwrap();
        let recovered = store.resume().unwrap();
        assert_eq!(recovered, 1);

        let counts = store.counts().unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.in_flight, 0);
        assert_eq!(counts.done, 1);

        // Done tasks stay done: re-enqueue of the same work is a no-op.
        assert!(!store.enqueue(file_task(0, "/out/0")).unwrap());
    }

    #[test]
    fn test_backup_fallback_on_corruption() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("tasks.db");
        {
            let store = TaskStore::open(&db_path).unwrap();
            store.enqueue(file_task(1, "/out/a")).unwrap();
            store.flush().unwrap();
        }

        // Clobber the primary; the .bak copy must take over.
        std::fs::write(&db_path, b"this is not a database").unwrap();
        let store = TaskStore::open(&db_path).unwrap();
        let counts = store.counts().unwrap();
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn test_artifact_index_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store
            .record_artifact("AABB01", Path::new("/out/f.safetensors"))
            .unwrap();
        assert_eq!(
            store.artifact_path("aabb01").unwrap(),
            Some(PathBuf::from("/out/f.safetensors"))
        );
        assert_eq!(store.artifact_path("ffff").unwrap(), None);
    }

    #[test]
    fn test_open_dest_paths() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue(file_task(1, "/out/a")).unwrap();
        store.enqueue(file_task(2, "/out/b")).unwrap();

        let claimed = store.claim(&[TaskKind::ModelFile], 1).unwrap();
        store
            .complete(&claimed[0].id, TaskStatus::Done, 1, None)
            .unwrap();

        let open = store.open_dest_paths().unwrap();
        assert_eq!(open.len(), 1);
        assert!(open.contains(&PathBuf::from("/out/b")));
    }

    #[test]
    fn test_release_returns_to_pending_without_attempt() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.enqueue(file_task(1, "/out/a")).unwrap();

        let task = store.claim(&[TaskKind::ModelFile], 1).unwrap().remove(0);
        store.release(&task.id).unwrap();

        let task = store.claim(&[TaskKind::ModelFile], 1).unwrap().remove(0);
        assert_eq!(task.attempts, 0);
    }
}
