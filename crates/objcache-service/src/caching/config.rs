use std::fmt;

/// All known cache names.
///
/// The name is used both as the subdirectory of the base cache directory and as the `cache` tag
/// of all cache metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheName {
    Images,
    Files,
}

impl AsRef<str> for CacheName {
    fn as_ref(&self) -> &str {
        match self {
            Self::Images => "images",
            Self::Files => "files",
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}
