use std::fs::{read_dir, remove_file};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::config::Config;
use crate::metric;

use super::ProofStore;
use super::cache_error::cache_entry_from_bytes;
use super::fs::catch_not_found;

/// Entry function for the cleanup command.
///
/// This runs a single sweep over the proof store based on the configured retention.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: Config, dry_run: bool) -> Result<()> {
    ProofStore::from_config(&config)?.cleanup(dry_run)?;
    Ok(())
}

/// The outcome of a single sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl ProofStore {
    /// Spawns the background sweep.
    ///
    /// The first sweep runs one `sweep_interval` after this call, and the task keeps sweeping
    /// until [`close`](Self::close) is called.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let period = self
            .cache_config
            .sweep_interval
            .max(std::time::Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = store.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let sweep_store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || sweep_store.cleanup(false)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        let stderr: &dyn std::error::Error = &*err;
                        tracing::error!(stderr, "Failed to sweep proof store");
                    }
                    Err(err) => {
                        let stderr: &dyn std::error::Error = &err;
                        tracing::error!(stderr, "Proof store sweep panicked");
                    }
                }
            }
            tracing::debug!("Proof store sweep stopped");
        })
    }

    /// Removes expired, failed and corrupt entries.
    ///
    /// Failing to remove a single file is logged and does not abort the sweep.
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupStats> {
        let cache_dir = self.cache_dir();
        tracing::info!("Sweeping proof store at `{}`", cache_dir.display());

        let mut stats = CleanupStats::default();
        let entries = match catch_not_found(|| read_dir(cache_dir))? {
            Some(x) => x,
            None => {
                tracing::warn!("Directory not found: `{}`", cache_dir.display());
                return Ok(stats);
            }
        };

        for entry in entries {
            let path = entry?.path();
            // `tmp` holds writes in progress.
            if path.is_dir() {
                continue;
            }
            if let Err(e) = self.try_cleanup_path(&path, &mut stats, dry_run) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to clean proof file: {:?}", e),
                );
            }
        }

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.sweep.files") = stats.retained_files as u64);
        metric!(counter("caches.sweep.files_removed") += stats.removed_files as i64);

        Ok(stats)
    }

    /// Tries to clean up the file at `path`, returning `true` if it was removed.
    ///
    /// If `dry_run` is `true`, the file will not actually be deleted.
    fn try_cleanup_path(
        &self,
        path: &Path,
        stats: &mut CleanupStats,
        dry_run: bool,
    ) -> Result<bool> {
        tracing::trace!("Checking file `{}`", path.display());
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            return Ok(true);
        };
        anyhow::ensure!(metadata.is_file(), "not a file");
        let size = metadata.len();

        // A file vanishing in between was removed by someone else, which is just as good.
        let keep = catch_not_found(|| self.check_expiry(path))?.unwrap_or(false);
        if !keep {
            tracing::debug!("Removing file `{}`", path.display());
            if !dry_run {
                catch_not_found(|| remove_file(path))?;
            }

            stats.removed_bytes += size;
            stats.removed_files += 1;

            return Ok(true);
        }
        stats.retained_bytes += size;
        stats.retained_files += 1;

        Ok(false)
    }

    /// Whether the entry at `path` should be kept.
    ///
    /// We use `mtime` as the creation time of an entry, as entries are never modified after
    /// being moved into place. Failed and corrupt entries are never kept.
    fn check_expiry(&self, path: &Path) -> std::io::Result<bool> {
        let mtime = path.metadata()?.modified()?;
        if mtime.elapsed().unwrap_or_default() > self.cache_config.retention {
            return Ok(false);
        }

        let bytes = std::fs::read(path)?;
        match cache_entry_from_bytes(&bytes) {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(_)) => Ok(false),
            Err(e) => {
                let dynerr: &dyn std::error::Error = &e;
                tracing::warn!(
                    error = dynerr,
                    path = %path.display(),
                    "Removing corrupt proof entry",
                );
                Ok(false)
            }
        }
    }
}
