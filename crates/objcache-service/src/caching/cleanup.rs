use std::collections::HashSet;
use std::fs::{read_dir, remove_file};
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use futures::future;

use crate::config::Config;

use super::fs::catch_not_found;
use super::{Cache, CacheContents, CacheKey, CacheStore, Caches};

impl Caches {
    /// Clear the temporary files.
    ///
    /// Temporary files are only alive while a fetch is running, so anything found here at
    /// startup was left behind by a crashed process.
    pub fn clear_tmp(&self, config: &Config) -> io::Result<()> {
        let tmp = config.cache_dir("tmp");
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;
        Ok(())
    }

    /// Cleans up all caches based on their configured retention and capacity.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> Result<()> {
        // Destructure so we do not accidentally forget to cleanup one of our members.
        let Self { images, files } = &self;

        // Collect results so we can fail the entire function.  But we do not want to early
        // return since we should at least attempt to clean up all caches.
        let results: Vec<_> = [images, files]
            .into_iter()
            .map(|c| c.cleanup(dry_run))
            .collect();

        let mut first_error = None;
        for result in results {
            if let Err(err) = result {
                let stderr: &dyn std::error::Error = &err;
                tracing::error!(stderr, "Failed to cleanup cache");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

/// What a cleanup run removed and retained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl CleanupStats {
    fn merge(&mut self, other: CleanupStats) {
        self.removed_files += other.removed_files;
        self.removed_bytes += other.removed_bytes;
        self.retained_files = other.retained_files;
        self.retained_bytes = other.retained_bytes;
    }
}

/// Number of entries and bytes in one cache directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

/// An entry as found on disk, where the logical key is unknown.
#[derive(Debug)]
struct DiskEntry {
    path: PathBuf,
    file_name: String,
    size: u64,
    modified: SystemTime,
    accessed: Option<SystemTime>,
}

impl DiskEntry {
    fn last_used(&self) -> SystemTime {
        self.accessed.unwrap_or(self.modified)
    }
}

impl Cache {
    /// Cleans up this cache based on configured retention and capacity.
    ///
    /// If `dry_run` is `true`, no files will actually be deleted.
    pub fn cleanup(&self, dry_run: bool) -> io::Result<CleanupStats> {
        tracing::info!("Cleaning up `{}` cache", self.name);

        let busy = HashSet::new();
        let entries = self.list_entries()?;
        let (mut stats, entries) = self.remove_expired_entries(entries, None, &busy, dry_run);
        stats.merge(self.trim_to_capacity(entries, &busy, dry_run));

        tracing::info!("Cleaning up `{}` complete", self.name);
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

        let cache = self.name.as_ref();
        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => cache);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => cache);
        metric!(
            counter("caches.size.files_removed") += stats.removed_files as i64,
            "cache" => cache,
        );
        metric!(
            counter("caches.size.bytes_removed") += stats.removed_bytes as i64,
            "cache" => cache,
        );

        Ok(stats)
    }

    /// Lists all files in the cache directory.
    ///
    /// A missing cache directory is an empty cache.
    fn list_entries(&self) -> io::Result<Vec<DiskEntry>> {
        let Some(dir) = catch_not_found(|| read_dir(&self.cache_dir))? else {
            tracing::trace!("Directory not found: `{}`", self.cache_dir.display());
            return Ok(vec![]);
        };

        let mut entries = vec![];
        for dir_entry in dir {
            let dir_entry = dir_entry?;
            // the file could be removed between listing and reading its metadata
            let Some(metadata) = catch_not_found(|| dir_entry.metadata())? else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            entries.push(DiskEntry {
                path: dir_entry.path(),
                file_name: dir_entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
                modified: metadata.modified()?,
                accessed: metadata.accessed().ok(),
            });
        }
        Ok(entries)
    }

    /// Removes one file, returning whether it existed.
    fn remove_path(&self, entry: &DiskEntry, dry_run: bool) -> io::Result<bool> {
        tracing::debug!("Removing file `{}`", entry.path.display());
        if dry_run {
            return Ok(true);
        }
        Ok(catch_not_found(|| remove_file(&entry.path))?.is_some())
    }

    /// Removes the entries that are stale under the current configuration.
    ///
    /// Entries whose file name is in `busy` are retained. Returns the retained entries along
    /// with the stats.
    fn remove_expired_entries(
        &self,
        entries: Vec<DiskEntry>,
        max_age: Option<Duration>,
        busy: &HashSet<String>,
        dry_run: bool,
    ) -> (CleanupStats, Vec<DiskEntry>) {
        let mut stats = CleanupStats::default();
        let mut retained = Vec::with_capacity(entries.len());
        for entry in entries {
            let stale = self.check_stale(entry.size, entry.modified, entry.accessed, max_age);
            if stale && !busy.contains(&entry.file_name) {
                match self.remove_path(&entry, dry_run) {
                    Ok(_) => {
                        stats.removed_files += 1;
                        stats.removed_bytes += entry.size;
                        continue;
                    }
                    Err(e) => {
                        let path = entry.path.display().to_string();
                        sentry::with_scope(
                            |scope| scope.set_extra("path", path.into()),
                            || tracing::error!("Failed to clean cache file: {:?}", e),
                        );
                    }
                }
            }
            stats.retained_files += 1;
            stats.retained_bytes += entry.size;
            retained.push(entry);
        }
        (stats, retained)
    }

    /// Removes the least recently used entries until at most `max_entries` remain.
    ///
    /// Entries whose file name is in `busy` are never removed.
    fn trim_to_capacity(
        &self,
        mut entries: Vec<DiskEntry>,
        busy: &HashSet<String>,
        dry_run: bool,
    ) -> CleanupStats {
        let mut stats = CleanupStats {
            retained_files: entries.len(),
            retained_bytes: entries.iter().map(|e| e.size).sum(),
            ..Default::default()
        };

        let Some(max_entries) = self.config().max_entries else {
            return stats;
        };
        let max_entries = max_entries as usize;
        if entries.len() <= max_entries {
            return stats;
        }

        entries.sort_by_key(DiskEntry::last_used);
        let mut excess = entries.len() - max_entries;
        for entry in &entries {
            if excess == 0 {
                break;
            }
            if busy.contains(&entry.file_name) {
                continue;
            }
            match self.remove_path(entry, dry_run) {
                Ok(_) => {
                    excess -= 1;
                    stats.removed_files += 1;
                    stats.removed_bytes += entry.size;
                    stats.retained_files -= 1;
                    stats.retained_bytes -= entry.size;
                }
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", entry.path.display().to_string().into()),
                        || tracing::error!("Failed to evict cache file: {:?}", e),
                    );
                }
            }
        }

        metric!(
            counter("caches.capacity.evicted") += stats.removed_files as i64,
            "cache" => self.name.as_ref(),
        );
        tracing::debug!(
            "Evicted {} entries from `{}` to stay within {} entries",
            stats.removed_files,
            self.name,
            max_entries,
        );
        stats
    }
}

impl CacheStore {
    /// Removes one entry, or every entry when `key` is `None`.
    ///
    /// Running fetches of the cleared entries are waited for, and whatever they produced is
    /// removed as well. Clearing a missing entry is a no-op. Temporary files of running fetches
    /// live outside the cache directory and are never touched.
    pub async fn clear(&self, key: Option<&CacheKey>) -> CacheContents {
        match key {
            Some(key) => {
                self.remove_entry(key).await?;
            }
            None => {
                let running = self.fetches.all();
                if !running.is_empty() {
                    tracing::trace!("Waiting for {} fetches before clearing", running.len());
                    future::join_all(running).await;
                }

                let _sweep = self.dir_lock.write().await;
                let cache = self.cache();
                let mut removed = 0;
                for entry in cache.list_entries()? {
                    if cache.remove_path(&entry, false)? {
                        removed += 1;
                    }
                }
                tracing::debug!("Cleared {} entries from `{}`", removed, cache.name());
            }
        }
        Ok(())
    }

    /// Removes the entries of all `keys`, returning how many existed.
    pub async fn remove<I>(&self, keys: I) -> CacheContents<usize>
    where
        I: IntoIterator,
        I::Item: Into<CacheKey>,
    {
        let mut removed = 0;
        for key in keys {
            if self.remove_entry(&key.into()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_entry(&self, key: &CacheKey) -> CacheContents<bool> {
        if let Some(running) = self.fetches.get(key) {
            tracing::trace!("Waiting for running fetch of `{}` before removing it", key);
            // The outcome does not matter, the entry goes away either way.
            let _ = running.await;
        }

        let path = self.cache().entry_path(key);
        let existed = catch_not_found(|| remove_file(&path))?.is_some();
        if existed {
            tracing::debug!("Removed `{}` at path {}", key, path.display());
        }
        Ok(existed)
    }

    /// Removes the least recently used entries until the configured `max_entries` is met.
    ///
    /// Entries with a running fetch, or pinned through [`pin`](Self::pin), are skipped.
    pub async fn enforce_capacity(&self) -> CacheContents<CleanupStats> {
        let busy = self.busy_entries();
        let cache = self.cache();
        Ok(cache.trim_to_capacity(cache.list_entries()?, &busy, false))
    }

    /// Removes every entry that is stale under the current configuration, or older than
    /// `max_age` if given.
    ///
    /// Entries with a running fetch, or pinned through [`pin`](Self::pin), are skipped.
    pub async fn remove_expired(&self, max_age: Option<Duration>) -> CacheContents<CleanupStats> {
        let busy = self.busy_entries();
        let cache = self.cache();
        let (stats, _) = cache.remove_expired_entries(cache.list_entries()?, max_age, &busy, false);
        tracing::debug!(
            "Removed {} expired entries from `{}`",
            stats.removed_files,
            self.name()
        );
        Ok(stats)
    }

    /// Returns the number of entries and their total size.
    pub fn stats(&self) -> CacheContents<CacheStats> {
        let entries = self.cache().list_entries()?;
        let stats = CacheStats {
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.size).sum(),
        };
        metric!(gauge("caches.size.files") = stats.entries as u64, "cache" => self.name().as_ref());
        metric!(gauge("caches.size.bytes") = stats.total_bytes, "cache" => self.name().as_ref());
        Ok(stats)
    }
}
