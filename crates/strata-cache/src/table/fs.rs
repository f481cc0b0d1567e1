use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};

use super::{BackingTable, Lookup, Record};
use crate::error::{CacheEntry, CacheError};

/// The cleanup of a table directory could remove the directories we write into.
const MAX_RETRIES: usize = 2;

/// A [`BackingTable`] storing one JSON file per key in a directory.
///
/// Files are named after the SHA-256 hash of the key and contain the whole [`Record`], so that a
/// lookup can tell a hash collision apart from a hit. All file system access runs on the blocking
/// thread pool.
#[derive(Clone)]
pub struct FsTable {
    inner: Arc<Paths>,
}

struct Paths {
    root: PathBuf,
    tmp: PathBuf,
}

impl fmt::Debug for FsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsTable")
            .field("root", &self.inner.root)
            .finish()
    }
}

impl FsTable {
    /// Opens the table in `root`, creating the directory if necessary.
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let tmp = root.join(".tmp");
        std::fs::create_dir_all(&tmp)?;
        Ok(Self {
            inner: Arc::new(Paths { root, tmp }),
        })
    }

    /// The directory this table stores its files in.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Paths) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(CacheError::from_std_error)
    }
}

impl Paths {
    fn file(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{:x}", Sha256::digest(key.as_bytes())))
    }

    fn read(&self, key: &str) -> Lookup {
        let path = self.file(key);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                tracing::debug!(path = %path.display(), "failed to read table file: {err}");
                return Err(CacheError::Read(err.to_string()));
            }
        };

        let record: Record = serde_json::from_slice(&bytes)?;
        if record.key != key {
            tracing::warn!(key, stored = %record.key, "hash collision in table");
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    /// Writes all `records` or none of them.
    ///
    /// Every record is staged in a temp file first. Only then the files are moved into place,
    /// and if that fails halfway the already moved ones are rolled back.
    fn write_all(&self, records: &[Record]) -> anyhow::Result<usize> {
        let staged = records
            .iter()
            .map(|record| self.stage(record))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut committed = Vec::with_capacity(staged.len());
        for (path, temp_file) in staged {
            match self.commit(&path, temp_file) {
                Ok(backup) => committed.push((path, backup)),
                Err(err) => {
                    self.roll_back(committed);
                    return Err(err);
                }
            }
        }
        Ok(committed.len())
    }

    fn stage(&self, record: &Record) -> anyhow::Result<(PathBuf, NamedTempFile)> {
        let contents = serde_json::to_vec(record).context("failed to serialize record")?;

        let mut temp_file = self.tempfile().context("failed to create tempfile")?;
        temp_file
            .write_all(&contents)
            .context("failed to write tempfile")?;

        Ok((self.file(&record.key), temp_file))
    }

    /// Moves a staged file into place, returning a backup of the file it replaced.
    fn commit(&self, path: &Path, temp_file: NamedTempFile) -> anyhow::Result<Option<TempPath>> {
        let backup = match path.is_file() {
            true => {
                let backup = self
                    .tempfile()
                    .context("failed to create backup")?
                    .into_temp_path();
                std::fs::rename(path, &backup).context("failed to back up table file")?;
                Some(backup)
            }
            false => None,
        };

        match self.persist(path, temp_file) {
            Ok(()) => Ok(backup),
            Err(err) => {
                if let Some(backup) = backup {
                    restore(path, backup);
                }
                Err(err)
            }
        }
    }

    fn persist(&self, path: &Path, mut temp_file: NamedTempFile) -> anyhow::Result<()> {
        let mut retries = 0;
        loop {
            retries += 1;
            match temp_file.persist(path) {
                Ok(_) => return Ok(()),
                Err(err) if retries <= MAX_RETRIES && err.error.kind() == io::ErrorKind::NotFound => {
                    std::fs::create_dir_all(&self.root)
                        .context("failed to recreate table directory")?;
                    temp_file = err.file;
                }
                Err(err) => return Err(err.error).context("failed to persist table file"),
            }
        }
    }

    /// Undoes committed writes, newest first.
    fn roll_back(&self, committed: Vec<(PathBuf, Option<TempPath>)>) {
        for (path, backup) in committed.into_iter().rev() {
            match backup {
                Some(backup) => restore(&path, backup),
                None => {
                    if let Err(err) = std::fs::remove_file(&path) {
                        tracing::error!(path = %path.display(), "failed to roll back table file: {err}");
                    }
                }
            }
        }
    }

    fn tempfile(&self) -> io::Result<NamedTempFile> {
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.tmp) {
                tracing::error!(path = %self.tmp.display(), "failed to create table directory: {e}");
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(&self.tmp) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(path = %self.tmp.display(), "failed to create tempfile: {e}");
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }
}

fn restore(path: &Path, backup: TempPath) {
    if let Err(err) = backup.persist(path) {
        tracing::error!(path = %path.display(), "failed to restore table file: {}", err.error);
    }
}

impl BackingTable for FsTable {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn get(&self, key: String) -> BoxFuture<'_, Lookup> {
        async move { self.blocking(move |paths| paths.read(&key)).await? }.boxed()
    }

    fn read_many(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<Lookup>> {
        async move {
            let len = keys.len();
            let results = self
                .blocking(move |paths| keys.iter().map(|key| paths.read(key)).collect::<Vec<_>>())
                .await;
            results.unwrap_or_else(|err| vec![Err(err); len])
        }
        .boxed()
    }

    fn bulk_put(&self, records: Vec<Record>) -> BoxFuture<'_, CacheEntry<()>> {
        async move {
            let written = self
                .blocking(move |paths| paths.write_all(&records))
                .await?;

            match written {
                Ok(count) => {
                    tracing::trace!(count, "wrote records to table");
                    Ok(())
                }
                Err(err) => Err(CacheError::BatchWrite(format!("{err:#}"))),
            }
        }
        .boxed()
    }
}
