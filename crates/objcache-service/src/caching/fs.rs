use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tempfile::NamedTempFile;

use crate::config::{CacheConfig, Config, StalenessSource};

use super::{CacheKey, CacheName};

/// One resource stored in a cache directory.
///
/// All timestamps are read from the filesystem; there is no separate manifest.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The logical key the entry was requested with.
    pub key: CacheKey,
    /// The name of the file inside the cache directory, see [`CacheKey::file_name`].
    pub file_name: String,
    /// Absolute path of the cached file.
    pub path: PathBuf,
    pub size_bytes: u64,
    pub last_modified: SystemTime,
    /// `None` if the filesystem does not record access times.
    pub last_accessed: Option<SystemTime>,
}

impl CacheEntry {
    pub(super) fn from_metadata(
        key: CacheKey,
        path: PathBuf,
        metadata: &Metadata,
    ) -> io::Result<Self> {
        Ok(Self {
            file_name: key.file_name(),
            key,
            path,
            size_bytes: metadata.len(),
            last_modified: metadata.modified()?,
            last_accessed: metadata.accessed().ok(),
        })
    }

    /// The time this entry was last used, falling back to its modification time.
    pub fn last_used(&self) -> SystemTime {
        self.last_accessed.unwrap_or(self.last_modified)
    }
}

/// Common file-system handling of a single cache directory.
///
/// All the entries of one cache live side by side in one flat directory below the configured
/// base cache directory. Cloning a [`Cache`] shares its [`CacheConfig`], so a configuration change
/// is visible through every clone.
#[derive(Debug, Clone)]
pub struct Cache {
    /// Cache identifier used for metric names and the directory name.
    pub(super) name: CacheName,

    /// Directory to use for storing cache items.
    ///
    /// It is created lazily whenever a new item is written.
    pub(super) cache_dir: PathBuf,

    /// Directory to use for temporary files.
    ///
    /// New items are fully written into a temporary file in this sibling directory, and then
    /// atomically moved to their actual location within [`cache_dir`](Self::cache_dir).
    tmp_dir: PathBuf,

    /// Options intended to be user-configurable.
    cache_config: Arc<RwLock<CacheConfig>>,
}

impl Cache {
    pub fn from_config(name: CacheName, config: &Config, cache_config: CacheConfig) -> Self {
        Cache {
            name,
            cache_dir: config.cache_dir(name.as_ref()),
            tmp_dir: config.cache_dir("tmp"),
            cache_config: Arc::new(RwLock::new(cache_config)),
        }
    }

    pub fn name(&self) -> CacheName {
        self.name
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns a snapshot of the current configuration.
    pub fn config(&self) -> CacheConfig {
        *self
            .cache_config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the configuration for all subsequent operations.
    pub fn set_config(&self, cache_config: CacheConfig) {
        self.update_config(|config| *config = cache_config);
    }

    /// Modifies the configuration in place for all subsequent operations.
    pub fn update_config(&self, f: impl FnOnce(&mut CacheConfig)) {
        let mut config = self
            .cache_config
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut config);
        tracing::debug!(cache = %self.name, config = ?*config, "Updated cache config");
    }

    /// The path of the entry for `key`, whether it exists or not.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    /// Reads the metadata of the entry for `key`.
    ///
    /// Returns `None` if no such entry exists.
    pub fn open_entry(&self, key: &CacheKey) -> io::Result<Option<CacheEntry>> {
        let path = self.entry_path(key);
        catch_not_found(|| {
            let metadata = path.metadata()?;
            tracing::trace!("File `{}` length: {}", path.display(), metadata.len());
            CacheEntry::from_metadata(key.clone(), path, &metadata)
        })
    }

    /// Checks whether `entry` must be fetched again.
    ///
    /// Empty files are always stale, as are entries whose age exceeds `max_age`, or the
    /// configured retention if no `max_age` is given.
    pub fn is_stale(&self, entry: &CacheEntry, max_age: Option<Duration>) -> bool {
        self.check_stale(
            entry.size_bytes,
            entry.last_modified,
            entry.last_accessed,
            max_age,
        )
    }

    /// Under [`StalenessSource::LastAccessed`], any read of the file that updates its access
    /// time, such as a decoder opening it, makes the entry fresh again. How reliably that
    /// happens depends on the mount options of the cache directory.
    pub(super) fn check_stale(
        &self,
        size: u64,
        modified: SystemTime,
        accessed: Option<SystemTime>,
        max_age: Option<Duration>,
    ) -> bool {
        if size == 0 {
            return true;
        }
        let config = self.config();
        let max_age = max_age.unwrap_or(config.retention);
        let reference = match config.staleness_source {
            StalenessSource::LastAccessed => accessed.unwrap_or(modified),
            StalenessSource::LastModified => modified,
        };
        // A reference time in the future counts as "just now".
        let age = reference.elapsed().unwrap_or_default();
        age > max_age
    }

    /// Marks `entry` as used right now.
    pub fn touch(&self, entry: &mut CacheEntry) -> io::Result<()> {
        let now = FileTime::now();
        filetime::set_file_atime(&entry.path, now)?;
        entry.last_accessed = Some(SystemTime::now());
        Ok(())
    }

    /// Create a new temporary file to use in the cache.
    pub fn tempfile(&self) -> io::Result<NamedTempFile> {
        let path = &self.tmp_dir;
        // A concurrent `clear_tmp` could remove the directory we are operating in,
        // so retry the fs operations a couple of times.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(path) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create temp directory: {:?}", e),
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
                        || tracing::error!("Failed to create temp file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Atomically moves `temp_file` to `cache_path`, replacing whatever was there before.
    pub(super) fn persist_tempfile(
        &self,
        mut temp_file: NamedTempFile,
        cache_path: &Path,
    ) -> io::Result<std::fs::File> {
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.cache_dir) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", self.cache_dir.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match temp_file.persist(cache_path) {
                Ok(file) => return Ok(file),
                Err(e) => {
                    temp_file = e.file;
                    let err = e.error;
                    sentry::with_scope(
                        |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                        || tracing::error!("Failed to persist cache file: {:?}", err),
                    );
                    if retries > MAX_RETRIES {
                        return Err(err);
                    }
                }
            }
        }
    }
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
