use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

/// The logical identifier of a cached resource.
///
/// Two keys are equal when their hashes are equal. The hash is also what names the file on disk,
/// so arbitrary strings (URIs, opaque names) map onto a flat directory of fixed-length names.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    key: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        let key = key.as_ref();
        let hash = Sha256::digest(key.as_bytes());
        Self {
            key: key.into(),
            hash: hash.into(),
        }
    }

    /// Returns the logical key this was created from.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Returns the file name of this key inside a cache directory.
    ///
    /// This is the lowercase hex-formatted sha-256 hash of the key, without any extension.
    pub fn file_name(&self) -> String {
        let mut name = String::with_capacity(64);
        for b in &self.hash {
            let _ = write!(name, "{b:02x}");
        }
        name
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

impl From<&Url> for CacheKey {
    fn from(url: &Url) -> Self {
        Self::new(url.as_str())
    }
}
