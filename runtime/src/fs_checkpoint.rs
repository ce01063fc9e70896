//! Checkpoints stored as files in a local directory.
//!
//! Layout: one file per version, `checkpoint-<version:020>.bin`, so lexical and
//! numeric order agree. A commit writes `<name>.tmp`, fsyncs it, renames it into
//! place and fsyncs the directory. A crash at any point leaves either the previous
//! newest file or the new one, never a partial file under a final name. Leftover
//! `.tmp` files are ignored by readers and removed on open.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tally_core::{Checkpoint, CheckpointError, CheckpointStore};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const PREFIX: &str = "checkpoint-";
const SUFFIX: &str = ".bin";
const TMP_SUFFIX: &str = ".tmp";

/// Default number of checkpoints kept on disk.
pub const DEFAULT_RETAIN: usize = 5;

/// Directory-backed [`CheckpointStore`].
///
/// # Example
///
/// ```rust,no_run
/// use tally_runtime::FileCheckpointStore;
/// use tally_core::CheckpointStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = FileCheckpointStore::open("/var/lib/tally/checkpoints", 5).await?;
/// if let Some(checkpoint) = store.latest().await? {
///     println!("resuming from v{}", checkpoint.version);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    retain: usize,
}

impl FileCheckpointStore {
    /// Open (creating if needed) a checkpoint directory keeping the newest `retain`
    /// checkpoints.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Read`] if the directory cannot be created or listed.
    pub async fn open(dir: impl Into<PathBuf>, retain: usize) -> Result<Self, CheckpointError> {
        let store = Self {
            dir: dir.into(),
            retain: retain.max(1),
        };
        fs::create_dir_all(&store.dir)
            .await
            .map_err(|e| store.read_error(&e))?;
        store.remove_stale_temp_files().await?;
        Ok(store)
    }

    /// The checkpoint directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{version:020}{SUFFIX}"))
    }

    fn read_error(&self, error: &std::io::Error) -> CheckpointError {
        CheckpointError::Read {
            location: self.dir.display().to_string(),
            reason: error.to_string(),
        }
    }

    fn parse_version(name: &str) -> Option<u64> {
        name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
    }

    /// Committed versions on disk, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Read`] if the directory cannot be listed.
    pub async fn versions(&self) -> Result<Vec<u64>, CheckpointError> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| self.read_error(&e))?;
        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.read_error(&e))? {
            if let Some(version) = entry.file_name().to_str().and_then(Self::parse_version) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    async fn remove_stale_temp_files(&self) -> Result<(), CheckpointError> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| self.read_error(&e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.read_error(&e))? {
            let name = entry.file_name();
            let is_stale = name
                .to_str()
                .is_some_and(|n| n.starts_with(PREFIX) && n.ends_with(TMP_SUFFIX));
            if is_stale {
                tracing::info!(path = %entry.path().display(), "Removing stale checkpoint temp file");
                if let Err(e) = fs::remove_file(entry.path()).await {
                    tracing::warn!(path = %entry.path().display(), error = %e, "Failed to remove temp file");
                }
            }
        }
        Ok(())
    }

    async fn write_atomically(&self, checkpoint: &Checkpoint) -> Result<(), std::io::Error> {
        let path = self.path_for(checkpoint.version);
        let mut tmp_name = path.clone().into_os_string();
        tmp_name.push(TMP_SUFFIX);
        let tmp_path = PathBuf::from(tmp_name);

        let bytes = checkpoint
            .to_bytes()
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &path).await?;

        #[cfg(unix)]
        fs::File::open(&self.dir).await?.sync_all().await?;

        Ok(())
    }

    async fn prune(&self) {
        let versions = match self.versions().await {
            Ok(versions) => versions,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list checkpoints for pruning");
                return;
            }
        };
        let excess = versions.len().saturating_sub(self.retain);
        for version in &versions[..excess] {
            let path = self.path_for(*version);
            match fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(version, "Pruned checkpoint"),
                Err(e) => tracing::warn!(version, error = %e, "Failed to prune checkpoint"),
            }
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn latest(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send + '_>>
    {
        Box::pin(async move {
            let Some(&version) = self.versions().await?.last() else {
                return Ok(None);
            };
            let path = self.path_for(version);
            let location = path.display().to_string();
            let bytes = fs::read(&path).await.map_err(|e| CheckpointError::Read {
                location: location.clone(),
                reason: e.to_string(),
            })?;
            Checkpoint::from_bytes(&bytes, &location).map(Some)
        })
    }

    fn commit<'a>(
        &'a self,
        checkpoint: &'a Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(checkpoint.version);
            let exists = fs::try_exists(&path).await.map_err(|e| CheckpointError::Write {
                version: checkpoint.version,
                reason: e.to_string(),
            })?;
            if exists {
                return Err(CheckpointError::AlreadyExists {
                    version: checkpoint.version,
                });
            }

            self.write_atomically(checkpoint)
                .await
                .map_err(|e| CheckpointError::Write {
                    version: checkpoint.version,
                    reason: e.to_string(),
                })?;
            tracing::debug!(version = checkpoint.version, path = %path.display(), "Checkpoint written");

            self.prune().await;
            Ok(())
        })
    }
}
