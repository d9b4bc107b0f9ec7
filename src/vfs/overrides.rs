//! In-memory override content keyed by normalized relative path.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use super::normalize_lexically;

/// Read-only text served in place of files under the overlay root.
///
/// Keys are relative to the root and lexically normalized, so `./utils.lua`,
/// `lib/../utils.lua` and `<root>/utils.lua` all address the same entry.
#[derive(Debug, Clone, Default)]
pub struct OverrideMap {
    entries: HashMap<PathBuf, Arc<str>>,
}

impl OverrideMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from `(key, content)` pairs relative to `root`.
    pub fn from_entries<I, K, V>(root: &Path, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<Path>,
        V: Into<String>,
    {
        let mut map = Self::new();
        for (key, content) in entries {
            map.insert(root, key, content);
        }
        map
    }

    /// Read the shared module files that exist under `root` into a new map.
    ///
    /// Missing or unreadable files are logged and left out.
    pub fn from_shared_files(root: &Path, names: &[String]) -> Self {
        let mut map = Self::new();
        for name in names {
            let path = root.join(name);
            match fs::read_to_string(&path) {
                Ok(content) => {
                    if map.insert(root, name, content) {
                        debug!(module = %name, "loaded shared module override");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(module = %name, path = %path.display(), "shared module not found");
                }
                Err(e) => {
                    warn!(module = %name, error = %e, "failed to read shared module");
                }
            }
        }
        map
    }

    /// Insert an entry. Returns `false` when the key was rejected.
    ///
    /// Absolute keys inside `root` are made relative; absolute keys outside it
    /// and relative keys that climb above it are skipped with a warning.
    pub fn insert(&mut self, root: &Path, key: impl AsRef<Path>, content: impl Into<String>) -> bool {
        let key = key.as_ref();
        match Self::normalize_key(root, key) {
            Some(normalized) => {
                self.entries.insert(normalized, Arc::from(content.into()));
                true
            }
            None => {
                warn!(key = %key.display(), root = %root.display(), "override key outside root skipped");
                false
            }
        }
    }

    fn normalize_key(root: &Path, key: &Path) -> Option<PathBuf> {
        let relative = if key.is_absolute() {
            let key = normalize_lexically(key);
            let root = normalize_lexically(root);
            key.strip_prefix(&root).ok()?.to_path_buf()
        } else {
            normalize_lexically(key)
        };
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if relative.as_os_str().is_empty() || escapes {
            return None;
        }
        Some(relative)
    }

    /// Content stored under a normalized relative key.
    pub fn get(&self, key: &Path) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_ref())
    }

    pub(crate) fn get_shared(&self, key: &Path) -> Option<Arc<str>> {
        self.entries.get(key).cloned()
    }

    /// Whether a normalized relative key is present.
    pub fn contains(&self, key: &Path) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate over the keys.
    pub fn keys(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(|k| k.as_path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
