//! Filesystem-backed object store: one JSON metadata record and one binary
//! blob per object identifier, co-located under the content root.
//!
//! The store knows nothing about sessions except through `ObjectWriter`,
//! which keeps the write → flush → advance ordering so a reader that observes
//! an available cursor of N can safely read the first N bytes.

use crate::models::object::StoredObject;
use crate::services::session::{UploadSession, WaitError};
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Absent, expired, or malformed identifier; callers never learn which.
    #[error("object not found")]
    NotFound,
    #[error("not authorized")]
    Unauthorized,
    #[error("requested range not satisfiable against {size} bytes")]
    RangeUnsatisfiable { size: i64 },
    /// The upload feeding an in-flight download was cancelled or stalled.
    #[error("transfer aborted: {0}")]
    TransferAborted(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Metadata(#[from] serde_json::Error),
}

impl From<WaitError> for StoreError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Cancelled => StoreError::TransferAborted("upload was cancelled"),
            WaitError::Stalled => StoreError::TransferAborted("timed out waiting for upload data"),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable side of the store: metadata records and blobs on disk.
#[derive(Clone, Debug)]
pub struct ObjectStore {
    content_root: PathBuf,
}

impl ObjectStore {
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
        }
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    /// Reject identifiers that could escape the content root or shadow a
    /// metadata record. Runs before any filesystem access; failures are
    /// indistinguishable from a missing object.
    fn ensure_id_safe(id: &str) -> StoreResult<()> {
        if id.is_empty()
            || id.contains('/')
            || id.contains('\\')
            || id.contains('.')
            || id.bytes().any(|b| b.is_ascii_control())
        {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn blob_path(&self, id: &str) -> PathBuf {
        self.content_root.join(id)
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.content_root.join(format!("{id}.json"))
    }

    /// Existence check used during identifier reservation; intentionally
    /// synchronous so it can run under the registry lock.
    pub fn object_exists(&self, id: &str) -> bool {
        self.blob_path(id).exists() || self.record_path(id).exists()
    }

    /// Read and parse the metadata record for `id`. Missing records map to
    /// NotFound; parse failures surface as `Metadata` so the sweeper can
    /// skip them without deleting anything.
    pub async fn read_record(&self, id: &str) -> StoreResult<StoredObject> {
        let raw = fs::read_to_string(self.record_path(id))
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound,
                _ => StoreError::Io(err),
            })?;
        let mut object: StoredObject = serde_json::from_str(&raw)?;
        object.id = id.to_string();
        Ok(object)
    }

    pub async fn write_record(&self, object: &StoredObject) -> StoreResult<()> {
        let raw = serde_json::to_string_pretty(object)?;
        fs::write(self.record_path(&object.id), raw).await?;
        Ok(())
    }

    /// Resolve an object for serving: identifier must be well-formed, the
    /// record parseable, the expiry in the future, and the blob present.
    pub async fn fetch_object(&self, id: &str) -> StoreResult<StoredObject> {
        Self::ensure_id_safe(id)?;
        let object = match self.read_record(id).await {
            Ok(object) => object,
            Err(StoreError::Metadata(_)) => return Err(StoreError::NotFound),
            Err(err) => return Err(err),
        };
        if object.is_expired(Utc::now()) {
            return Err(StoreError::NotFound);
        }
        if !self.blob_path(id).exists() {
            return Err(StoreError::NotFound);
        }
        Ok(object)
    }

    pub async fn open_blob(&self, id: &str) -> StoreResult<File> {
        File::open(self.blob_path(id))
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound,
                _ => StoreError::Io(err),
            })
    }

    pub async fn blob_len(&self, id: &str) -> StoreResult<i64> {
        let meta = fs::metadata(self.blob_path(id))
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => StoreError::NotFound,
                _ => StoreError::Io(err),
            })?;
        Ok(meta.len() as i64)
    }

    /// Remove both files for `id`, tolerating either already being gone.
    pub async fn remove_files(&self, id: &str) -> StoreResult<()> {
        for path in [self.blob_path(id), self.record_path(id)] {
            match fs::remove_file(&path).await {
                Ok(()) => debug!("removed {}", path.display()),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(StoreError::Io(err)),
            }
        }
        Ok(())
    }

    /// Owner-authorized delete. NotFound and Unauthorized stay distinct here;
    /// the HTTP layer decides how much to reveal.
    pub async fn delete_owned(&self, id: &str, identity: Uuid) -> StoreResult<StoredObject> {
        Self::ensure_id_safe(id)?;
        let object = match self.read_record(id).await {
            Ok(object) => object,
            Err(StoreError::Metadata(_)) => return Err(StoreError::NotFound),
            Err(err) => return Err(err),
        };
        if object.owner_identity != identity {
            return Err(StoreError::Unauthorized);
        }
        self.remove_files(id).await?;
        Ok(object)
    }

    /// All live objects owned by `identity`, sorted by expiry. Unparseable
    /// records are skipped.
    pub async fn list_owned(&self, identity: Uuid) -> StoreResult<Vec<StoredObject>> {
        let now = Utc::now();
        let mut objects = Vec::new();
        let mut entries = fs::read_dir(&self.content_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            match self.read_record(id).await {
                Ok(object) => {
                    if object.owner_identity == identity && !object.is_expired(now) {
                        objects.push(object);
                    }
                }
                Err(err) => debug!("skipping unreadable record {}: {}", name, err),
            }
        }
        objects.sort_by_key(|object| object.expires_at);
        Ok(objects)
    }

    /// Open the blob for writing and tie it to the upload session.
    pub async fn begin_blob(&self, session: Arc<UploadSession>) -> StoreResult<ObjectWriter> {
        let file = File::create(self.blob_path(session.id())).await?;
        Ok(ObjectWriter {
            file,
            session,
            written: 0,
        })
    }
}

/// Sequential blob writer for one upload.
///
/// Each chunk is written and flushed before the session's available cursor
/// moves, so readers never observe bytes that are not yet on disk. I/O
/// failures cancel the session, waking every blocked reader at once.
pub struct ObjectWriter {
    file: File,
    session: Arc<UploadSession>,
    written: i64,
}

impl ObjectWriter {
    /// Append a chunk and publish the new available cursor. Chunks arriving
    /// after cancellation are discarded without error.
    pub async fn write(&mut self, chunk: &[u8]) -> StoreResult<i64> {
        if self.session.is_cancelled() {
            return Ok(self.written);
        }
        if let Err(err) = self.write_inner(chunk).await {
            self.session.mark_cancelled();
            return Err(StoreError::Io(err));
        }
        self.written += chunk.len() as i64;
        self.session.advance(self.written);
        Ok(self.written)
    }

    async fn write_inner(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.file.flush().await
    }

    /// Finish the upload: sync the blob and mark the session complete.
    pub async fn finish(self) -> StoreResult<i64> {
        if let Err(err) = self.file.sync_all().await {
            self.session.mark_cancelled();
            return Err(StoreError::Io(err));
        }
        self.session.mark_complete();
        Ok(self.written)
    }

    /// Give up on the upload, waking any blocked readers.
    pub fn abort(self) {
        self.session.mark_cancelled();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::session::SessionRegistry;
    use chrono::Duration;
    use tempfile::tempdir;

    fn record(id: &str, identity: Uuid, expires_in: Duration) -> StoredObject {
        StoredObject {
            id: id.to_string(),
            display_name: format!("{id}.bin"),
            media_type: "application/octet-stream".into(),
            expires_at: Utc::now() + expires_in,
            owner_address: "127.0.0.1".into(),
            owner_identity: identity,
        }
    }

    #[tokio::test]
    async fn malformed_identifiers_are_rejected_as_not_found() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        for id in ["", "../../etc/passwd", "1234.json", "12/34", "12\\34"] {
            assert!(matches!(
                store.fetch_object(id).await,
                Err(StoreError::NotFound)
            ));
        }
    }

    #[tokio::test]
    async fn expired_objects_read_as_not_found() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let object = record("111111", Uuid::new_v4(), Duration::hours(-1));
        store.write_record(&object).await.unwrap();
        fs::write(store.blob_path("111111"), b"stale").await.unwrap();
        assert!(matches!(
            store.fetch_object("111111").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn missing_blob_reads_as_not_found() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let object = record("222222", Uuid::new_v4(), Duration::hours(1));
        store.write_record(&object).await.unwrap();
        assert!(matches!(
            store.fetch_object("222222").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn delete_requires_the_owning_identity() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let owner = Uuid::new_v4();
        let object = record("333333", owner, Duration::hours(1));
        store.write_record(&object).await.unwrap();
        fs::write(store.blob_path("333333"), b"payload").await.unwrap();

        assert!(matches!(
            store.delete_owned("333333", Uuid::new_v4()).await,
            Err(StoreError::Unauthorized)
        ));
        assert!(store.object_exists("333333"));

        store.delete_owned("333333", owner).await.unwrap();
        assert!(!store.object_exists("333333"));
        assert!(matches!(
            store.delete_owned("333333", owner).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn list_owned_filters_and_sorts_by_expiry() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let mine = Uuid::new_v4();
        for (id, owner, hours) in [
            ("444444", mine, 30),
            ("555555", mine, 10),
            ("666666", Uuid::new_v4(), 10),
        ] {
            store
                .write_record(&record(id, owner, Duration::hours(hours)))
                .await
                .unwrap();
        }

        let listed = store.list_owned(mine).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|object| object.id.as_str()).collect();
        assert_eq!(ids, ["555555", "444444"]);
    }

    #[tokio::test]
    async fn writer_advances_cursor_only_after_bytes_land() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let registry = SessionRegistry::new(store.clone());
        let session = registry.reserve(Uuid::new_v4(), 11);

        let mut writer = store.begin_blob(Arc::clone(&session)).await.unwrap();
        assert_eq!(writer.write(b"hello ").await.unwrap(), 6);
        assert_eq!(session.available(), 6);
        assert_eq!(writer.write(b"world").await.unwrap(), 11);
        assert_eq!(session.available(), 11);

        writer.finish().await.unwrap();
        assert!(session.is_complete());
        assert_eq!(store.blob_len(session.id()).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn cancelled_session_discards_late_chunks() {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path());
        let registry = SessionRegistry::new(store.clone());
        let session = registry.reserve(Uuid::new_v4(), -1);

        let mut writer = store.begin_blob(Arc::clone(&session)).await.unwrap();
        writer.write(b"kept").await.unwrap();
        session.mark_cancelled();
        assert_eq!(writer.write(b" dropped").await.unwrap(), 4);
        assert_eq!(session.available(), 4);
        assert_eq!(store.blob_len(session.id()).await.unwrap(), 4);
    }
}
