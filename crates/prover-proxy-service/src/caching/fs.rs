use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::{CacheConfig, Config};

use super::cache_error::{cache_entry_from_bytes, cache_entry_to_bytes};
use super::{CacheEntry, RequestKey};

/// The durable store of proof results.
///
/// Every entry lives in its own file `<cache_dir>/<key>`. Entries are written to a temporary
/// file in `<cache_dir>/tmp` first and then atomically moved into place, so readers never
/// observe partial writes.
#[derive(Debug)]
pub struct ProofStore {
    /// Directory holding the entries.
    cache_dir: PathBuf,

    /// Directory to use for temporary files.
    tmp_dir: PathBuf,

    /// Retention settings for the sweep.
    pub(super) cache_config: CacheConfig,

    /// Cancels the background sweep.
    pub(super) shutdown: CancellationToken,
}

impl ProofStore {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Self::open(config.cache_dir.clone(), config.caches)
    }

    /// Opens the store in `cache_dir`, creating the directory if it does not exist.
    pub fn open(cache_dir: PathBuf, cache_config: CacheConfig) -> io::Result<Self> {
        let tmp_dir = cache_dir.join("tmp");
        std::fs::create_dir_all(&cache_dir)?;

        Ok(Self {
            cache_dir,
            tmp_dir,
            cache_config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Clear the temporary files.
    ///
    /// We need to do this on startup of the server to avoid accidentally leaving temporary
    /// files which survive a hard crash.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            std::fs::remove_dir_all(&self.tmp_dir)?;
        }
        std::fs::create_dir_all(&self.tmp_dir)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// The path of the file holding the entry for `key`.
    pub fn entry_path(&self, key: &RequestKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    /// Looks up the entry for `key`.
    ///
    /// Missing and unreadable entries are both a miss.
    pub async fn find(&self, key: &RequestKey) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::error!(error = dynerr, key = %key, "Failed to read proof entry");
                return None;
            }
        };

        match cache_entry_from_bytes(&bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::error!(
                    error = dynerr,
                    key = %key,
                    path = %path.display(),
                    "Corrupt proof entry",
                );
                None
            }
        }
    }

    /// Durably writes `entry` under `key`, replacing a previous entry.
    ///
    /// [`ProveError::InternalError`](super::ProveError::InternalError) entries are never written.
    pub async fn save(&self, key: &RequestKey, entry: &CacheEntry) -> io::Result<()> {
        let Some(bytes) = cache_entry_to_bytes(entry) else {
            tracing::error!(key = %key, "An internal error should never be written out");
            return Ok(());
        };
        let bytes = bytes.map_err(io::Error::other)?;

        let temp_file = self.tempfile()?;
        let mut file = fs::File::from_std(temp_file.reopen()?);
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        persist_tempfile(temp_file, self.entry_path(key)).await?;
        tracing::trace!(key = %key, "Saved proof entry");
        Ok(())
    }

    /// Create a new temporary file to use in the store.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        let path = &self.tmp_dir;
        // The directory could be removed from under us, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new().prefix("tmp").tempfile_in(path) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }

    /// Stops the background sweep.
    ///
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn persist_tempfile(
    mut temp_file: NamedTempFile,
    cache_path: PathBuf,
) -> io::Result<std::fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // The sweep could potentially remove the directories we are operating in, so retry.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent).await {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(&cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
