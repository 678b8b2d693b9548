//! src/services/object_store.rs
//!
//! ObjectStore: lifecycle engine for ephemeral drops. Metadata lives in
//! SQLite (`drops` table); ciphertext payloads live as flat files named by
//! id beneath `blob_dir`. Every destructive transition relies on SQLite's
//! single-statement `DELETE ... RETURNING`, so concurrent consumers, owner
//! deletes and the reaper never both win the same row.

use crate::models::drop_record::DropRecord;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use sqlx::SqlitePool;
use std::{
    collections::HashSet,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of upload staging files inside the blob directory.
const TMP_PREFIX: &str = ".tmp-";

const RECORD_COLUMNS: &str = "id, expires_at, burn_after_read, delete_token";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("drop `{0}` already exists")]
    DuplicateId(String),
    #[error("upload exceeds the maximum size of {limit} bytes")]
    BlobTooLarge { limit: u64 },
    #[error("upload stream interrupted: {0}")]
    Interrupted(io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Current wall-clock time as Unix seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Names in the blob directory that are being written or committed.
/// The orphan pass never touches them, whatever their age.
type Claims = Arc<Mutex<HashSet<String>>>;

fn lock_claims(claims: &Claims) -> MutexGuard<'_, HashSet<String>> {
    claims.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases its name from the claim set when dropped, including when an
/// upload future is cancelled mid-stream.
#[derive(Debug)]
struct BlobClaim {
    name: String,
    claims: Claims,
}

impl Drop for BlobClaim {
    fn drop(&mut self) {
        lock_claims(&self.claims).remove(&self.name);
    }
}

/// Ciphertext written to a staging file but not yet visible as a drop.
#[derive(Debug)]
pub struct StagedBlob {
    path: PathBuf,
    pub size: u64,
    _claim: BlobClaim,
}

/// Identifiers handed back to the uploader.
#[derive(Debug, Clone)]
pub struct NewDrop {
    pub id: String,
    pub delete_token: String,
    pub expires_at: i64,
    pub burn_after_read: bool,
}

/// A drop that was successfully read, with its blob opened for streaming.
#[derive(Debug)]
pub struct Retrieved {
    pub record: DropRecord,
    pub file: File,
    pub len: u64,
}

/// Outcome of a blob directory reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OrphanReport {
    pub removed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Flat directory holding one ciphertext file per drop.
    pub blob_dir: PathBuf,

    claims: Claims,
}

impl ObjectStore {
    pub fn new(db: Arc<SqlitePool>, blob_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            blob_dir: blob_dir.into(),
            claims: Claims::default(),
        }
    }

    /// Like `new`, but makes sure the blob directory exists.
    pub async fn open(db: Arc<SqlitePool>, blob_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let store = Self::new(db, blob_dir);
        fs::create_dir_all(&store.blob_dir).await?;
        Ok(store)
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.blob_dir.join(id)
    }

    fn claim(&self, name: &str) -> BlobClaim {
        lock_claims(&self.claims).insert(name.to_string());
        BlobClaim {
            name: name.to_string(),
            claims: Arc::clone(&self.claims),
        }
    }

    fn is_claimed(&self, name: &str) -> bool {
        lock_claims(&self.claims).contains(name)
    }

    /// Insert a new record. A colliding id is reported as `DuplicateId`.
    pub async fn create(
        &self,
        id: &str,
        expires_at: i64,
        burn_after_read: bool,
        delete_token: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO drops (id, expires_at, burn_after_read, delete_token)
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(expires_at)
        .bind(burn_after_read)
        .bind(delete_token)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => {
                debug!(id, expires_at, burn_after_read, "created drop");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateId(id.to_string()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    /// Read-only lookup. Never consumes a burn-after-read drop and never
    /// deletes expired rows.
    pub async fn peek(&self, id: &str) -> StoreResult<Option<DropRecord>> {
        self.peek_at(id, unix_now()).await
    }

    pub async fn peek_at(&self, id: &str, now: i64) -> StoreResult<Option<DropRecord>> {
        let record = self.select(id).await?;
        Ok(record.filter(|r| !r.is_expired_at(now)))
    }

    /// Atomic read-and-maybe-delete.
    ///
    /// Burn-after-read rows are claimed with a single `DELETE ... RETURNING`;
    /// exactly one concurrent caller sees the row. Everyone else falls
    /// through to a plain lookup that finds nothing. Plain rows are returned
    /// untouched unless expired, in which case they are removed on the spot.
    pub async fn consume(&self, id: &str) -> StoreResult<Option<DropRecord>> {
        self.consume_at(id, unix_now()).await
    }

    pub async fn consume_at(&self, id: &str, now: i64) -> StoreResult<Option<DropRecord>> {
        let burned = sqlx::query_as::<_, DropRecord>(&format!(
            "DELETE FROM drops WHERE id = ? AND burn_after_read = 1 RETURNING {RECORD_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;

        if let Some(record) = burned {
            if record.is_expired_at(now) {
                self.remove_blob(id).await?;
                debug!(id, "burn-after-read drop expired before first read");
                return Ok(None);
            }
            debug!(id, "claimed burn-after-read drop");
            return Ok(Some(record));
        }

        let Some(record) = self.select(id).await? else {
            return Ok(None);
        };

        if record.is_expired_at(now) {
            let removed = sqlx::query("DELETE FROM drops WHERE id = ? AND expires_at <= ?")
                .bind(id)
                .bind(now)
                .execute(&*self.db)
                .await?;
            self.remove_blob(id).await?;
            debug!(
                id,
                rows = removed.rows_affected(),
                "removed expired drop on read"
            );
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Consume `id` and open its blob.
    ///
    /// The blob handle is opened before the row is claimed. Once a burn row
    /// is gone the file is an orphan to the reaper, and an open handle
    /// stays readable after the name is unlinked. A blob that is already
    /// missing reads as not found and leaves the row alone.
    pub async fn consume_blob(&self, id: &str) -> StoreResult<Option<Retrieved>> {
        let file = match File::open(self.blob_path(id)).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err)),
        };

        let Some(record) = self.consume(id).await? else {
            return Ok(None);
        };
        let len = file.metadata().await?.len();

        if record.burn_after_read {
            if let Err(err) = self.remove_blob(id).await {
                // Left for the orphan sweep.
                warn!(id, error = %err, "failed to unlink consumed blob");
            }
        }

        Ok(Some(Retrieved { record, file, len }))
    }

    /// Non-consuming lookup that also resolves the blob size.
    pub async fn peek_blob(&self, id: &str) -> StoreResult<Option<(DropRecord, u64)>> {
        let Some(record) = self.peek(id).await? else {
            return Ok(None);
        };

        match fs::metadata(self.blob_path(id)).await {
            Ok(meta) => Ok(Some((record, meta.len()))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Owner deletion. A wrong token and an unknown id both yield `false`.
    pub async fn delete_with_token(&self, id: &str, token: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM drops WHERE id = ? AND delete_token = ?")
            .bind(id)
            .bind(token)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.remove_blob(id).await?;
        debug!(id, "deleted drop with owner token");
        Ok(true)
    }

    /// Delete every row with `expires_at <= now` and return their ids.
    /// Blob removal is left to the caller.
    pub async fn sweep_expired(&self, now: i64) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "DELETE FROM drops WHERE expires_at <= ? RETURNING id",
        )
        .bind(now)
        .fetch_all(&*self.db)
        .await?;

        Ok(ids)
    }

    /// Stream an upload into a staging file, enforcing `limit` as bytes
    /// arrive. The staging file is removed on every error path.
    pub async fn stage_blob<S>(&self, stream: S, limit: u64) -> StoreResult<StagedBlob>
    where
        S: Stream<Item = io::Result<Bytes>>,
    {
        let name = format!("{}{}", TMP_PREFIX, Uuid::new_v4());
        let claim = self.claim(&name);
        let path = self.blob_dir.join(&name);
        let mut file = File::create(&path).await?;

        let mut size: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&path).await;
                    return Err(StoreError::Interrupted(err));
                }
            };
            size += chunk.len() as u64;
            if size > limit {
                let _ = fs::remove_file(&path).await;
                return Err(StoreError::BlobTooLarge { limit });
            }
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&path).await;
            return Err(StoreError::Io(err));
        }

        Ok(StagedBlob {
            path,
            size,
            _claim: claim,
        })
    }

    /// Drop a staged upload that failed admission.
    pub async fn discard(&self, staged: StagedBlob) {
        if let Err(err) = fs::remove_file(&staged.path).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %staged.path.display(), error = %err, "failed to discard staged upload");
            }
        }
    }

    /// Publish a staged upload under a fresh id and delete token.
    ///
    /// The blob is moved into place first and the record inserted second;
    /// if the insert fails the blob is removed again before the error is
    /// returned.
    pub async fn commit_upload(
        &self,
        staged: StagedBlob,
        expires_at: i64,
        burn_after_read: bool,
    ) -> StoreResult<NewDrop> {
        let id = Uuid::new_v4().to_string();
        let delete_token = Uuid::new_v4().to_string();
        let path = self.blob_path(&id);
        // Held until the row exists, so the orphan pass skips the renamed blob.
        let _pending = self.claim(&id);

        if fs::try_exists(&path).await? {
            self.discard(staged).await;
            return Err(StoreError::DuplicateId(id));
        }

        if let Err(err) = fs::rename(&staged.path, &path).await {
            self.discard(staged).await;
            return Err(StoreError::Io(err));
        }

        if let Err(err) = self
            .create(&id, expires_at, burn_after_read, &delete_token)
            .await
        {
            if let Err(cleanup) = self.remove_blob(&id).await {
                warn!(id = %id, error = %cleanup, "failed to remove blob after insert failure");
            }
            return Err(err);
        }

        Ok(NewDrop {
            id,
            delete_token,
            expires_at,
            burn_after_read,
        })
    }

    /// Best-effort blob removal. A missing file counts as success; the
    /// return value says whether this call removed it.
    pub async fn remove_blob(&self, id: &str) -> io::Result<bool> {
        let path = self.blob_path(id);
        match fs::remove_file(&path).await {
            Ok(_) => {
                debug!("removed blob {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove blob files that have no record, plus abandoned staging
    /// files. Files untouched for less than `grace` and names claimed by an
    /// in-flight upload are skipped. A failure on one entry is counted and
    /// the pass moves on; only an unreadable directory is an error.
    pub async fn reconcile_orphans(&self, grace: Duration) -> StoreResult<OrphanReport> {
        let mut report = OrphanReport::default();
        let mut entries = fs::read_dir(&self.blob_dir).await?;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "blob directory listing stopped early");
                    report.failed += 1;
                    break;
                }
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            match self.reconcile_entry(&entry.path(), name, grace).await {
                Ok(true) => {
                    debug!("removed orphaned blob file {}", name);
                    report.removed += 1;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(file = name, error = %err, "failed to reconcile blob file");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Returns whether `path` was an orphan and got removed.
    async fn reconcile_entry(&self, path: &Path, name: &str, grace: Duration) -> StoreResult<bool> {
        let is_staging = name.starts_with(TMP_PREFIX);
        if !is_staging && Uuid::parse_str(name).is_err() {
            return Ok(false);
        }
        if self.is_claimed(name) {
            return Ok(false);
        }

        let meta = match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(false),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(StoreError::Io(err)),
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| m.elapsed().ok())
            .unwrap_or_default();
        if age < grace {
            return Ok(false);
        }

        if !is_staging && self.select(name).await?.is_some() {
            return Ok(false);
        }

        match fs::remove_file(path).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn select(&self, id: &str) -> StoreResult<Option<DropRecord>> {
        let record = sqlx::query_as::<_, DropRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM drops WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?;
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::ObjectStore;
    use crate::db;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// A store backed by a fresh SQLite file and blob directory.
    pub async fn temp_store() -> (TempDir, ObjectStore) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("drop.db")).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let store = ObjectStore::open(Arc::new(pool), dir.path().join("files"))
            .await
            .unwrap();
        (dir, store)
    }
}
