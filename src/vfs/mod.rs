//! Virtual filesystem overlay for script contexts.
//!
//! Every file or module access made on behalf of a script goes through an
//! [`FsOverlay`]:
//! - a small whitelisted set of relative paths is served from memory and is
//!   read-only ([`OverrideMap`])
//! - everything else is delegated to the real filesystem
//! - anything that would mutate the filesystem outside the root is denied

mod overlay;
mod overrides;

use std::path::{Component, Path, PathBuf};

pub use overlay::{AccessMode, EntryKind, EntryMetadata, FsOverlay, OpenMode, OverlayFile, Resolved};
pub use overrides::OverrideMap;

/// Normalize a path without touching the filesystem.
///
/// `.` components are dropped and `..` pops the previous normal component.
/// A `..` that cannot be popped is kept for relative paths and dropped at the
/// root of absolute ones.
pub(crate) fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out.iter().map(|c| c.as_os_str()).collect()
}

/// Make `path` absolute against the current directory, then normalize it.
pub(crate) fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize_lexically(path))
    } else {
        let cwd = std::env::current_dir()?;
        Ok(normalize_lexically(&cwd.join(path)))
    }
}
