use super::locks::KeyedLocks;
use super::types::{validate_id, ArtifactRecord, ArtifactState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::TempDir;
use tokio::sync::RwLock;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("artifact '{0}' already exists")]
    DuplicateId(String),

    #[error("artifact '{0}' not found")]
    NotFound(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }
}

/// A finished extraction waiting to be registered with [`ArtifactStore::put`]
#[derive(Debug, Clone)]
pub struct ArtifactDraft {
    pub id: String,
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    /// File inside a [`StagingArea`] that becomes the artifact
    pub staged_path: PathBuf,
}

/// Private scratch directory for one extraction, deleted on drop.
///
/// Lives under the store root so that promoting a staged file is a rename
/// on the same filesystem.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Directory-backed table of ready artifacts.
///
/// The store is the only component that creates, renames or deletes files
/// in its root. Mutations are serialized per id; reads take a short shared
/// lock on the index and never wait on unrelated ids.
pub struct ArtifactStore {
    root: PathBuf,
    staging_root: PathBuf,
    extension: String,
    records: RwLock<HashMap<String, ArtifactRecord>>,
    locks: KeyedLocks,
}

impl ArtifactStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Leftover staging data from a previous process is discarded and files
    /// already present are indexed, using their modification time as the
    /// creation time.
    pub async fn open(root: impl AsRef<Path>, extension: &str) -> Result<Self, StoreError> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| StoreError::io(format!("Failed to create {}", root.display()), e))?;
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| StoreError::io(format!("Failed to resolve {}", root.display()), e))?;

        let staging_root = root.join(STAGING_DIR);
        match tokio::fs::remove_dir_all(&staging_root).await {
            Ok(()) => tracing::info!("Discarded stale staging data in {}", staging_root.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {},
            Err(e) => return Err(StoreError::io("Failed to clear staging directory", e)),
        }
        tokio::fs::create_dir_all(&staging_root)
            .await
            .map_err(|e| StoreError::io("Failed to create staging directory", e))?;

        let store = Self {
            root,
            staging_root,
            extension: extension.trim_start_matches('.').to_string(),
            records: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
        };
        let indexed = store.reindex().await?;
        tracing::info!(
            "Artifact store opened at {} ({} existing artifacts)",
            store.root.display(),
            indexed
        );
        Ok(store)
    }

    async fn reindex(&self) -> Result<usize, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io("Failed to read store directory", e))?;
        let mut found = HashMap::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io("Failed to read store directory", e))?
        {
            let path = entry.path();
            let Some(id) = self.id_for_file_name(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            if metadata.len() == 0 {
                tracing::warn!("Ignoring empty artifact file {}", path.display());
                continue;
            }
            let created_at = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            found.insert(
                id.clone(),
                ArtifactRecord {
                    id,
                    path,
                    title: None,
                    thumbnail_url: None,
                    size: metadata.len(),
                    created_at,
                    state: ArtifactState::Ready,
                },
            );
        }

        let count = found.len();
        *self.records.write().await = found;
        Ok(count)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// File name an artifact with `id` is stored and served under
    pub fn file_name(&self, id: &str) -> String {
        format!("{}.{}", id, self.extension)
    }

    fn id_for_file_name(&self, file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(&format!(".{}", self.extension))?;
        validate_id(stem).ok()?;
        Some(stem.to_string())
    }

    /// Resolve the final on-disk path for `id`, refusing anything that could
    /// land outside the root.
    pub fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id).map_err(StoreError::InvalidIdentifier)?;
        let path = self.root.join(self.file_name(id));
        if path.parent() != Some(self.root.as_path()) {
            return Err(StoreError::InvalidIdentifier(id.to_string()));
        }
        Ok(path)
    }

    /// Map a requested download file name (`<id>.<extension>`) to an id.
    ///
    /// Traversal attempts fail with `InvalidIdentifier`; names that are
    /// merely not artifacts fail with `NotFound`.
    pub fn resolve_download(&self, file_name: &str) -> Result<String, StoreError> {
        if file_name.is_empty()
            || file_name.contains("..")
            || file_name.contains('/')
            || file_name.contains('\\')
            || file_name.contains('\0')
            || file_name.starts_with('.')
        {
            return Err(StoreError::InvalidIdentifier(file_name.to_string()));
        }
        self.id_for_file_name(file_name)
            .ok_or_else(|| StoreError::NotFound(file_name.to_string()))
    }

    /// Create a private staging directory for one extraction
    pub fn stage(&self) -> Result<StagingArea, StoreError> {
        let dir = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.staging_root)
            .map_err(|e| StoreError::io("Failed to create staging area", e))?;
        Ok(StagingArea { dir })
    }

    /// Promote a staged file to a ready artifact
    pub async fn put(&self, draft: ArtifactDraft) -> Result<ArtifactRecord, StoreError> {
        self.insert(draft, None).await
    }

    async fn insert(
        &self,
        draft: ArtifactDraft,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<ArtifactRecord, StoreError> {
        let path = self.path_for(&draft.id)?;
        let _guard = self.locks.lock(&draft.id).await;

        if self.records.read().await.contains_key(&draft.id) {
            return Err(StoreError::DuplicateId(draft.id));
        }

        let metadata = tokio::fs::metadata(&draft.staged_path)
            .await
            .map_err(|e| StoreError::io("Staged artifact is not readable", e))?;
        // The mtime is the creation time a restart recovers.
        let created_at = created_at.unwrap_or_else(Utc::now);
        set_modified(&draft.staged_path, created_at)
            .await
            .map_err(|e| StoreError::io("Failed to stamp staged artifact", e))?;
        tokio::fs::rename(&draft.staged_path, &path)
            .await
            .map_err(|e| StoreError::io(format!("Failed to move artifact into {}", path.display()), e))?;

        let record = ArtifactRecord {
            id: draft.id.clone(),
            path,
            title: draft.title,
            thumbnail_url: draft.thumbnail_url,
            size: metadata.len(),
            created_at,
            state: ArtifactState::Ready,
        };
        self.records
            .write()
            .await
            .insert(draft.id, record.clone());

        tracing::debug!("Stored artifact {} ({} bytes)", record.id, record.size);
        Ok(record)
    }

    /// Look up a ready artifact.
    ///
    /// A record whose file has disappeared is dropped and reported as missing.
    pub async fn get(&self, id: &str) -> Result<ArtifactRecord, StoreError> {
        validate_id(id).map_err(StoreError::InvalidIdentifier)?;
        let record = self
            .records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        match tokio::fs::metadata(&record.path).await {
            Ok(m) if m.is_file() => Ok(record),
            _ => {
                self.forget_missing(id).await;
                Err(StoreError::NotFound(id.to_string()))
            },
        }
    }

    /// Open a ready artifact for reading.
    ///
    /// Lookup and open happen under the id's lock, so eviction cannot slip in
    /// between them. Once open, the handle stays readable even if the file is
    /// later unlinked.
    pub async fn open_file(&self, id: &str) -> Result<(ArtifactRecord, tokio::fs::File), StoreError> {
        validate_id(id).map_err(StoreError::InvalidIdentifier)?;
        let _guard = self.locks.lock(id).await;

        let record = self
            .records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        match tokio::fs::File::open(&record.path).await {
            Ok(file) => Ok((record, file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("Artifact {} vanished from disk, dropping record", id);
                self.records.write().await.remove(id);
                Err(StoreError::NotFound(id.to_string()))
            },
            Err(e) => Err(StoreError::io(format!("Failed to open artifact {}", id), e)),
        }
    }

    /// Evict an artifact: the record goes first, then the file.
    ///
    /// File deletion errors are logged and otherwise ignored.
    pub async fn remove(&self, id: &str) -> Result<ArtifactRecord, StoreError> {
        validate_id(id).map_err(StoreError::InvalidIdentifier)?;
        let _guard = self.locks.lock(id).await;
        self.remove_locked(id).await
    }

    /// Evict `id` only if the live record was created before `cutoff`.
    ///
    /// Returns `Ok(None)` when the id has been stored again since the caller
    /// looked at it.
    pub async fn remove_expired(
        &self,
        id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<ArtifactRecord>, StoreError> {
        validate_id(id).map_err(StoreError::InvalidIdentifier)?;
        let _guard = self.locks.lock(id).await;

        let created_at = self
            .records
            .read()
            .await
            .get(id)
            .map(|record| record.created_at)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if created_at >= cutoff {
            return Ok(None);
        }
        self.remove_locked(id).await.map(Some)
    }

    async fn remove_locked(&self, id: &str) -> Result<ArtifactRecord, StoreError> {
        let record = self
            .records
            .write()
            .await
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        match tokio::fs::remove_file(&record.path).await {
            Ok(()) => {},
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("Artifact file {} was already gone", record.path.display());
            },
            Err(e) => {
                tracing::warn!("Failed to delete {}: {}", record.path.display(), e);
            },
        }
        Ok(record)
    }

    /// Snapshot of every ready artifact
    pub async fn list_all(&self) -> Vec<ArtifactRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn forget_missing(&self, id: &str) {
        let _guard = self.locks.lock(id).await;
        let path = match self.records.read().await.get(id) {
            Some(record) => record.path.clone(),
            None => return,
        };
        if tokio::fs::metadata(&path).await.is_ok() {
            return;
        }
        tracing::warn!("Artifact {} vanished from disk, dropping record", id);
        self.records.write().await.remove(id);
    }

    /// Register a record with an explicit creation time. Test-only.
    #[cfg(any(test, feature = "testing"))]
    pub async fn put_with_created_at(
        &self,
        draft: ArtifactDraft,
        created_at: DateTime<Utc>,
    ) -> Result<ArtifactRecord, StoreError> {
        self.insert(draft, Some(created_at)).await
    }
}

async fn set_modified(path: &Path, at: DateTime<Utc>) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::from(at))
    })
    .await
    .map_err(std::io::Error::other)?
}
