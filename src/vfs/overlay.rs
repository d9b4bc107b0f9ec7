//! Path resolution and file operations for a single script context.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use super::{absolutize, normalize_lexically, OverrideMap};

/// Where a requested path ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Served from the override map under this relative key.
    Override(PathBuf),
    /// Delegated to the real filesystem.
    Disk {
        /// Absolute, normalized path.
        path: PathBuf,
        /// Whether the path lies inside the overlay root.
        contained: bool,
    },
}

/// Flags for [`FsOverlay::open`], mirroring `std::fs::OpenOptions`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
}

impl OpenMode {
    /// Plain read.
    pub fn read() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    /// Write, creating and truncating.
    pub fn write() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Self::default()
        }
    }

    /// Append, creating when missing.
    pub fn append() -> Self {
        Self {
            append: true,
            create: true,
            ..Self::default()
        }
    }

    /// Whether any flag can change the filesystem.
    pub fn is_write_class(&self) -> bool {
        self.write || self.append || self.create || self.create_new || self.truncate
    }

    fn to_options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .append(self.append)
            .create(self.create)
            .create_new(self.create_new)
            .truncate(self.truncate);
        options
    }
}

/// Access kinds for [`FsOverlay::check_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    Execute,
}

/// Kind of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// Metadata for a path, real or synthesized.
#[derive(Debug, Clone)]
pub struct EntryMetadata {
    pub kind: EntryKind,
    pub len: u64,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
    pub created: Option<SystemTime>,
    pub read_only: bool,
    /// Set when the entry is served from the override map.
    pub is_override: bool,
}

impl EntryMetadata {
    fn synthesized(content: &str) -> Self {
        let now = SystemTime::now();
        Self {
            kind: EntryKind::File,
            len: content.len() as u64,
            modified: Some(now),
            accessed: Some(now),
            created: Some(now),
            read_only: true,
            is_override: true,
        }
    }

    fn from_fs(meta: &fs::Metadata) -> Self {
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        Self {
            kind,
            len: meta.len(),
            modified: meta.modified().ok(),
            accessed: meta.accessed().ok(),
            created: meta.created().ok(),
            read_only: meta.permissions().readonly(),
            is_override: false,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// Byte view over shared override text.
#[derive(Debug, Clone)]
struct SharedBytes(Arc<str>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// An open file handle: in-memory for overrides, a real file otherwise.
#[derive(Debug)]
pub struct OverlayFile {
    inner: Handle,
}

#[derive(Debug)]
enum Handle {
    Memory(Cursor<SharedBytes>),
    Disk(File),
}

impl OverlayFile {
    fn memory(content: Arc<str>) -> Self {
        Self {
            inner: Handle::Memory(Cursor::new(SharedBytes(content))),
        }
    }

    fn disk(file: File) -> Self {
        Self {
            inner: Handle::Disk(file),
        }
    }

    /// Whether the handle reads override content.
    pub fn is_override(&self) -> bool {
        matches!(self.inner, Handle::Memory(_))
    }
}

impl Read for OverlayFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Handle::Memory(cursor) => cursor.read(buf),
            Handle::Disk(file) => file.read(buf),
        }
    }
}

impl Seek for OverlayFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.inner {
            Handle::Memory(cursor) => cursor.seek(pos),
            Handle::Disk(file) => file.seek(pos),
        }
    }
}

impl Write for OverlayFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Handle::Memory(_) => Err(unsupported("read-only override")),
            Handle::Disk(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Handle::Memory(_) => Ok(()),
            Handle::Disk(file) => file.flush(),
        }
    }
}

fn unsupported(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, msg.into())
}

fn read_only(key: &Path) -> io::Error {
    unsupported(format!("read-only override: {}", key.display()))
}

fn outside_root(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("path outside script root: {}", path.display()),
    )
}

/// Filesystem view for one script context.
///
/// The root is fixed at construction; the override map is immutable for the
/// lifetime of the overlay.
#[derive(Debug, Clone)]
pub struct FsOverlay {
    root: PathBuf,
    overrides: OverrideMap,
}

impl FsOverlay {
    /// Create an overlay rooted at `root` (made absolute and normalized).
    pub fn new(root: impl AsRef<Path>, overrides: OverrideMap) -> io::Result<Self> {
        let root = absolutize(root.as_ref())?;
        Ok(Self { root, overrides })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn overrides(&self) -> &OverrideMap {
        &self.overrides
    }

    /// Resolve a path, absolute or relative to the root.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Resolved {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            normalize_lexically(path)
        } else {
            normalize_lexically(&self.root.join(path))
        };

        if let Ok(relative) = absolute.strip_prefix(&self.root) {
            if self.overrides.contains(relative) {
                return Resolved::Override(relative.to_path_buf());
            }
        }

        let contained = self.is_contained(&absolute);
        Resolved::Disk {
            path: absolute,
            contained,
        }
    }

    /// Lexical containment, re-checked against the canonical form of the
    /// deepest existing ancestor so a symlink under the root cannot lead out.
    fn is_contained(&self, absolute: &Path) -> bool {
        if !absolute.starts_with(&self.root) {
            return false;
        }
        let Ok(real_root) = self.root.canonicalize() else {
            return true;
        };
        match canonicalize_existing_prefix(absolute) {
            Some(real) => real.starts_with(real_root),
            None => true,
        }
    }

    /// Resolve for a write-class operation: overrides are read-only and
    /// paths outside the root are denied.
    fn resolve_writable(&self, path: &Path) -> io::Result<PathBuf> {
        match self.resolve(path) {
            Resolved::Override(key) => Err(read_only(&key)),
            Resolved::Disk {
                path,
                contained: false,
            } => Err(outside_root(&path)),
            Resolved::Disk { path, .. } => Ok(path),
        }
    }

    /// Open a path for reading.
    pub fn open_read(&self, path: impl AsRef<Path>) -> io::Result<OverlayFile> {
        self.open(path, OpenMode::read())
    }

    /// Open a path with explicit flags.
    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode) -> io::Result<OverlayFile> {
        let path = path.as_ref();
        if !mode.is_write_class() {
            return match self.resolve(path) {
                Resolved::Override(key) => {
                    debug!(key = %key.display(), "serving override");
                    let content = self
                        .overrides
                        .get_shared(&key)
                        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "override vanished"))?;
                    Ok(OverlayFile::memory(content))
                }
                Resolved::Disk { path, .. } => Ok(OverlayFile::disk(mode.to_options().open(path)?)),
            };
        }
        let target = self.resolve_writable(path)?;
        Ok(OverlayFile::disk(mode.to_options().open(target)?))
    }

    /// Read the whole file.
    pub fn read(&self, path: impl AsRef<Path>) -> io::Result<Vec<u8>> {
        match self.resolve(path) {
            Resolved::Override(key) => Ok(self
                .overrides
                .get(&key)
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default()),
            Resolved::Disk { path, .. } => fs::read(path),
        }
    }

    /// Read the whole file as UTF-8.
    pub fn read_to_string(&self, path: impl AsRef<Path>) -> io::Result<String> {
        match self.resolve(path) {
            Resolved::Override(key) => Ok(self.overrides.get(&key).unwrap_or_default().to_string()),
            Resolved::Disk { path, .. } => fs::read_to_string(path),
        }
    }

    /// Replace the contents of a file.
    pub fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> io::Result<()> {
        let target = self.resolve_writable(path.as_ref())?;
        fs::write(target, contents)
    }

    /// Truncate or extend a file.
    pub fn set_len(&self, path: impl AsRef<Path>, len: u64) -> io::Result<()> {
        let target = self.resolve_writable(path.as_ref())?;
        OpenOptions::new().write(true).open(target)?.set_len(len)
    }

    /// Toggle the read-only permission bit.
    pub fn set_readonly(&self, path: impl AsRef<Path>, readonly: bool) -> io::Result<()> {
        let target = self.resolve_writable(path.as_ref())?;
        let mut permissions = fs::metadata(&target)?.permissions();
        permissions.set_readonly(readonly);
        fs::set_permissions(target, permissions)
    }

    /// Metadata, synthesized for override keys.
    pub fn metadata(&self, path: impl AsRef<Path>) -> io::Result<EntryMetadata> {
        match self.resolve(path) {
            Resolved::Override(key) => Ok(EntryMetadata::synthesized(
                self.overrides.get(&key).unwrap_or_default(),
            )),
            Resolved::Disk { path, .. } => Ok(EntryMetadata::from_fs(&fs::metadata(path)?)),
        }
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        match self.resolve(path) {
            Resolved::Override(_) => true,
            Resolved::Disk { path, .. } => path.exists(),
        }
    }

    /// List a directory. Override keys that live directly in it are merged in.
    pub fn read_dir(&self, path: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
        let dir = match self.resolve(path) {
            Resolved::Override(key) => {
                return Err(unsupported(format!(
                    "not a directory (override): {}",
                    key.display()
                )))
            }
            Resolved::Disk { path, .. } => path,
        };

        let overlaid: Vec<PathBuf> = match dir.strip_prefix(&self.root) {
            Ok(relative) => self
                .overrides
                .keys()
                .filter(|key| key.parent() == Some(relative))
                .map(|key| self.root.join(key))
                .collect(),
            Err(_) => Vec::new(),
        };

        let mut entries = match fs::read_dir(&dir) {
            Ok(iter) => iter
                .map(|entry| entry.map(|e| e.path()))
                .collect::<io::Result<Vec<_>>>()?,
            Err(e) if e.kind() == io::ErrorKind::NotFound && !overlaid.is_empty() => Vec::new(),
            Err(e) => return Err(e),
        };
        entries.extend(overlaid);
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    /// Create a directory and any missing parents.
    pub fn create_dir(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let target = self.resolve_writable(path.as_ref())?;
        fs::create_dir_all(target)
    }

    pub fn remove_file(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let target = self.resolve_writable(path.as_ref())?;
        fs::remove_file(target)
    }

    pub fn rename(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<()> {
        let from = self.resolve_writable(from.as_ref())?;
        let to = self.resolve_writable(to.as_ref())?;
        fs::rename(from, to)
    }

    pub fn copy(&self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> io::Result<u64> {
        let from = match self.resolve(from) {
            Resolved::Override(key) => return Err(read_only(&key)),
            Resolved::Disk { path, .. } => path,
        };
        let to = self.resolve_writable(to.as_ref())?;
        fs::copy(from, to)
    }

    /// Check whether `mode` is permitted on `path`.
    ///
    /// Overrides allow only [`AccessMode::Read`].
    pub fn check_access(&self, path: impl AsRef<Path>, mode: AccessMode) -> io::Result<()> {
        let (path, contained) = match self.resolve(path) {
            Resolved::Override(key) => {
                return match mode {
                    AccessMode::Read => Ok(()),
                    _ => Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("read-only override: {}", key.display()),
                    )),
                };
            }
            Resolved::Disk { path, contained } => (path, contained),
        };

        let meta = fs::metadata(&path)?;
        match mode {
            AccessMode::Read => Ok(()),
            AccessMode::Write if !contained => Err(outside_root(&path)),
            AccessMode::Write if meta.permissions().readonly() => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("read-only: {}", path.display()),
            )),
            AccessMode::Write => Ok(()),
            AccessMode::Execute => check_executable(&path, &meta),
        }
    }

    pub fn symlink(&self, _original: impl AsRef<Path>, _link: impl AsRef<Path>) -> io::Result<()> {
        Err(unsupported("symbolic links are not supported"))
    }

    pub fn read_link(&self, _path: impl AsRef<Path>) -> io::Result<PathBuf> {
        Err(unsupported("symbolic links are not supported"))
    }

    pub fn hard_link(&self, _original: impl AsRef<Path>, _link: impl AsRef<Path>) -> io::Result<()> {
        Err(unsupported("hard links are not supported"))
    }
}

fn canonicalize_existing_prefix(path: &Path) -> Option<PathBuf> {
    for ancestor in path.ancestors() {
        if let Ok(real) = ancestor.canonicalize() {
            let rest = path.strip_prefix(ancestor).ok()?;
            return Some(real.join(rest));
        }
    }
    None
}

#[cfg(unix)]
fn check_executable(path: &Path, meta: &fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("not executable: {}", path.display()),
        ))
    }
}

#[cfg(not(unix))]
fn check_executable(_path: &Path, _meta: &fs::Metadata) -> io::Result<()> {
    Ok(())
}
