//! SQLite artifact storage for the link pipeline: connections, atomic
//! replacement, busy retries and advisory per-artifact locks.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod tables;

pub use tables::{
    GmlCentroidDb, LinkReader, LocalTableStats, OsmCandidateDb, GML_TABLE, LINK_TABLE,
    OSM_LOCAL_TABLE, OSM_REQUIRED_COLUMNS, OSM_WORLD_TABLE,
};

pub const CRATE_NAME: &str = "gmlink-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("database not found: {}", .0.display())]
    MissingDatabase(PathBuf),
    #[error("table `{0}` not found")]
    MissingTable(String),
    #[error("table `{table}` is missing required columns: {}", .columns.join(", "))]
    MissingColumns { table: String, columns: Vec<String> },
    #[error("artifact {} is locked by another build (lock file {})", .artifact.display(), .lock.display())]
    Locked { artifact: PathBuf, lock: PathBuf },
    #[error("{what}: database still busy after {attempts} attempts: {source}")]
    BusyRetriesExhausted {
        what: String,
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Sqlx(err) => classify_sqlx_error(err) == RetryDisposition::Retryable,
            StoreError::Locked { .. } | StoreError::BusyRetriesExhausted { .. } => true,
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn file_sha256(path: &Path) -> StoreResult<String> {
    let bytes = fs::read(path)
        .await
        .map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;
    Ok(sha256_hex(&bytes))
}

pub fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Hidden temp path next to `target`, unique per call.
pub fn temp_sibling(target: &Path, tag: &str) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let temp_name = format!(".{name}.{}.{tag}.tmp", Uuid::new_v4());
    match target.parent() {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    }
}

/// Replace `target` with `bytes` via a temp file and an atomic rename.
pub async fn write_file_atomic(target: &Path, bytes: &[u8]) -> StoreResult<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(format!("creating directory {}", parent.display()), e))?;
    }

    let temp_path = temp_sibling(target, &bytes.len().to_string());
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(format!("opening temp file {}", temp_path.display()), e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(format!("writing temp file {}", temp_path.display()), e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io(format!("flushing temp file {}", temp_path.display()), e))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                target.display()
            ),
            err,
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Busy/locked databases and pool timeouts are worth another attempt;
/// everything else is final.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        sqlx::Error::Database(db) => {
            let primary = db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED))
                || db.message().contains("database is locked")
            {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        }
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn retry_busy<T, F, Fut>(policy: &BackoffPolicy, what: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if classify_sqlx_error(&err) == RetryDisposition::Retryable => {
                if attempt >= policy.max_retries {
                    return Err(StoreError::BusyRetriesExhausted {
                        what: what.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(what, attempt, ?delay, error = %err, "database busy; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(StoreError::Sqlx(err)),
        }
    }
}

/// How previously built artifacts are opened for reading.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub busy_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5000),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ReadOptions {
    pub fn with_busy_timeout(busy_timeout: Duration) -> Self {
        Self {
            busy_timeout,
            ..Self::default()
        }
    }
}

/// Open an existing database strictly read-only (`mode=ro`, `query_only`)
/// with a bounded busy timeout. Busy failures while connecting are retried.
pub async fn open_read_only(path: &Path, opts: &ReadOptions) -> StoreResult<SqlitePool> {
    if !path.is_file() {
        return Err(StoreError::MissingDatabase(path.to_path_buf()));
    }
    let connect = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .busy_timeout(opts.busy_timeout)
        .pragma("query_only", "ON");
    let pool = retry_busy(&opts.backoff, "opening read-only database", || {
        SqlitePoolOptions::new()
            .max_connections(2)
            .acquire_timeout(opts.busy_timeout + Duration::from_secs(1))
            .connect_with(connect.clone())
    })
    .await?;
    debug!(path = %path.display(), busy_timeout_ms = opts.busy_timeout.as_millis() as u64, "opened read-only");
    Ok(pool)
}

/// A database being built in a temp file next to its final location.
///
/// Nothing is visible at `target` until [`StagedDb::persist`] renames the
/// finished file over it; dropping an unpersisted stage deletes the temp file.
#[derive(Debug)]
pub struct StagedDb {
    target: PathBuf,
    temp_path: PathBuf,
    conn: Option<SqliteConnection>,
}

impl StagedDb {
    pub async fn create(target: &Path) -> StoreResult<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::io(format!("creating directory {}", parent.display()), e)
            })?;
        }
        let temp_path = temp_sibling(target, "sqlite");
        // Rollback journal keeps the finished database in a single file.
        let conn = SqliteConnectOptions::new()
            .filename(&temp_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", "MEMORY")
            .connect()
            .await?;
        debug!(target = %target.display(), temp = %temp_path.display(), "staging database");
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            conn: Some(conn),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("staged connection is only taken by persist"))
    }

    /// Close the connection and atomically move the database into place.
    pub async fn persist(mut self) -> StoreResult<PathBuf> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        fs::rename(&self.temp_path, &self.target).await.map_err(|e| {
            StoreError::io(
                format!(
                    "atomically renaming {} -> {}",
                    self.temp_path.display(),
                    self.target.display()
                ),
                e,
            )
        })?;
        Ok(self.target.clone())
    }
}

impl Drop for StagedDb {
    fn drop(&mut self) {
        if self.temp_path.exists() {
            let _ = std::fs::remove_file(&self.temp_path);
            let mut journal = self.temp_path.clone().into_os_string();
            journal.push("-journal");
            let _ = std::fs::remove_file(PathBuf::from(journal));
        }
    }
}

/// Advisory lock held while one artifact is rebuilt.
///
/// Implemented as a `<artifact>.lock` file created with `create_new`, so it
/// also excludes concurrent builds from other processes.
#[derive(Debug)]
pub struct ArtifactLock {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub wait: Duration,
    pub stale_after: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(30),
            stale_after: Duration::from_secs(60 * 60),
            backoff: BackoffPolicy {
                max_retries: usize::MAX,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(2),
            },
        }
    }
}

impl ArtifactLock {
    pub fn lock_path_for(artifact: &Path) -> PathBuf {
        let mut os = artifact.as_os_str().to_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    pub async fn acquire(artifact: &Path, opts: &LockOptions) -> StoreResult<Self> {
        let lock_path = Self::lock_path_for(artifact);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::io(format!("creating directory {}", parent.display()), e)
            })?;
        }
        let started = Instant::now();
        let mut attempt = 0usize;
        loop {
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    let body = format!(
                        "pid={}\nacquired_at={}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    file.write_all(body.as_bytes()).await.map_err(|e| {
                        StoreError::io(format!("writing lock file {}", lock_path.display()), e)
                    })?;
                    return Ok(Self { path: lock_path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_abandoned(&lock_path, opts.stale_after) {
                        warn!(lock = %lock_path.display(), "removing abandoned artifact lock");
                        let _ = fs::remove_file(&lock_path).await;
                        continue;
                    }
                    if started.elapsed() >= opts.wait {
                        return Err(StoreError::Locked {
                            artifact: artifact.to_path_buf(),
                            lock: lock_path,
                        });
                    }
                    let delay = opts.backoff.delay_for_attempt(attempt);
                    debug!(lock = %lock_path.display(), ?delay, "artifact locked; waiting");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(StoreError::io(
                        format!("creating lock file {}", lock_path.display()),
                        err,
                    ))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_abandoned(lock_path: &Path, stale_after: Duration) -> bool {
    modified_time(lock_path)
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn atomic_write_replaces_previous_content() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("stamp.json");
        write_file_atomic(&target, b"first").await.expect("first write");
        write_file_atomic(&target, b"second").await.expect("second write");
        assert_eq!(std::fs::read(&target).expect("read"), b"second");
        let leftovers = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn retry_gives_up_immediately_on_permanent_errors() {
        let mut calls = 0;
        let result: StoreResult<()> = retry_busy(&BackoffPolicy::default(), "probe", || {
            calls += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Sqlx(sqlx::Error::RowNotFound))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn retry_exhausts_on_persistent_pool_timeouts() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let mut calls = 0;
        let result: StoreResult<()> = retry_busy(&policy, "probe", || {
            calls += 1;
            async { Err(sqlx::Error::PoolTimedOut) }
        })
        .await;
        assert!(matches!(
            result,
            Err(StoreError::BusyRetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn staged_db_is_invisible_until_persisted() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("out.sqlite");
        let mut staged = StagedDb::create(&target).await.expect("stage");
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&mut *staged.conn())
            .await
            .expect("create");
        assert!(!target.exists());
        let temp = staged.temp_path().to_path_buf();
        let persisted = staged.persist().await.expect("persist");
        assert_eq!(persisted, target);
        assert!(target.exists());
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn dropped_stage_leaves_previous_artifact_intact() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("out.sqlite");
        std::fs::write(&target, b"previous").expect("seed");
        let temp = {
            let mut staged = StagedDb::create(&target).await.expect("stage");
            sqlx::query("CREATE TABLE t (x INTEGER)")
                .execute(&mut *staged.conn())
                .await
                .expect("create");
            staged.temp_path().to_path_buf()
        };
        assert!(!temp.exists());
        assert_eq!(std::fs::read(&target).expect("read"), b"previous");
    }

    #[tokio::test]
    async fn read_only_open_rejects_missing_files_and_writes() {
        let dir = tempdir().expect("tempdir");
        let missing = dir.path().join("missing.sqlite");
        assert!(matches!(
            open_read_only(&missing, &ReadOptions::default()).await,
            Err(StoreError::MissingDatabase(_))
        ));

        let target = dir.path().join("ro.sqlite");
        let mut staged = StagedDb::create(&target).await.expect("stage");
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&mut *staged.conn())
            .await
            .expect("create");
        staged.persist().await.expect("persist");

        let pool = open_read_only(&target, &ReadOptions::default())
            .await
            .expect("open");
        assert!(sqlx::query("INSERT INTO t VALUES (1)")
            .execute(&pool)
            .await
            .is_err());
        pool.close().await;
    }

    #[tokio::test]
    async fn second_lock_on_same_artifact_times_out_until_released() {
        let dir = tempdir().expect("tempdir");
        let artifact = dir.path().join("links.sqlite");
        let opts = LockOptions {
            wait: Duration::from_millis(30),
            ..LockOptions::default()
        };
        let first = ArtifactLock::acquire(&artifact, &opts).await.expect("first");
        assert!(first.path().exists());
        let second = ArtifactLock::acquire(&artifact, &opts).await;
        assert!(matches!(second, Err(StoreError::Locked { .. })));
        drop(first);
        let third = ArtifactLock::acquire(&artifact, &opts).await.expect("third");
        drop(third);
        assert!(!ArtifactLock::lock_path_for(&artifact).exists());
    }

    #[tokio::test]
    async fn abandoned_lock_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let artifact = dir.path().join("osm.sqlite");
        let lock_path = ArtifactLock::lock_path_for(&artifact);
        std::fs::write(&lock_path, b"pid=1\n").expect("seed lock");
        let old = SystemTime::now() - Duration::from_secs(7200);
        std::fs::File::options()
            .write(true)
            .open(&lock_path)
            .and_then(|f| f.set_modified(old))
            .expect("age lock");
        let lock = ArtifactLock::acquire(&artifact, &LockOptions::default())
            .await
            .expect("reclaim");
        assert_eq!(lock.path(), lock_path);
    }
}
