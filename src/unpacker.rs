//! Materialize a tar stream under a destination root.
//!
//! Entries are applied strictly in stream order:
//!
//! - whiteout markers delete earlier content instead of creating anything
//! - every name, symlink target and hardlink target must stay inside the root
//! - ownership, permissions and times are applied right after each entry
//! - directory times are applied again once the stream is exhausted, since
//!   creating children bumps them
//!
//! The set of paths materialized by this call decides what an opaque marker
//! keeps. It lives for a single [`unpack`] and is never shared.

use crate::cancel::Cancellation;
use crate::entry::{classify_whiteout, EntryKind, TarEntry, Whiteout};
use crate::error::{Error, Result};
use crate::pipe::CHUNK_SIZE;
use crate::platform::{Platform, UnixPlatform};
use crate::time_util::{clamp_time, latest_time, unix_time};
use log::{debug, trace, warn};
use std::collections::HashSet;
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tar_rs as tar;
use walkdir::WalkDir;

type IncludeFn = dyn Fn(&TarEntry) -> bool + Send + Sync;

/// Knobs for [`unpack`].
pub struct UnpackOptions {
    include: Option<Box<IncludeFn>>,
    platform: Box<dyn Platform>,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            include: None,
            platform: Box::new(UnixPlatform),
        }
    }
}

impl UnpackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only entries for which `include` returns true are applied.
    ///
    /// The predicate sees the normalized name and runs before whiteout
    /// handling, so it can also suppress markers.
    pub fn with_filter<F>(mut self, include: F) -> Self
    where
        F: Fn(&TarEntry) -> bool + Send + Sync + 'static,
    {
        self.include = Some(Box::new(include));
        self
    }

    pub fn with_platform<P: Platform + 'static>(mut self, platform: P) -> Self {
        self.platform = Box::new(platform);
        self
    }
}

/// What an [`unpack`] call did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Entries materialized on disk.
    pub entries: usize,
    /// Whiteout and opaque markers applied.
    pub whiteouts: usize,
    /// Entries rejected by the predicate, reserved names and the root entry.
    pub skipped: usize,
}

/// Apply the tar stream read from `reader` on top of `dest`.
///
/// `dest` is created if missing. The first failure aborts the unpack and
/// leaves whatever was already written in place.
pub fn unpack<R: Read>(
    cancel: &Cancellation,
    reader: R,
    dest: impl AsRef<Path>,
    options: UnpackOptions,
) -> Result<UnpackSummary> {
    let dest = dest.as_ref();
    fs::create_dir_all(dest).map_err(|e| Error::OpenFailure {
        path: dest.to_path_buf(),
        source: e,
    })?;
    let root = fs::canonicalize(dest).map_err(|e| Error::OpenFailure {
        path: dest.to_path_buf(),
        source: e,
    })?;

    debug!("Unpacking into {}", root.display());
    let mut unpacker = Unpacker::new(root, options);
    let mut archive = tar::Archive::new(reader);

    {
        let mut entries = archive
            .entries()
            .map_err(|e| Error::from_stream("reading archive", e))?;
        loop {
            cancel.check()?;
            let mut entry = match entries.next() {
                Some(entry) => entry.map_err(|e| Error::from_stream("reading entry header", e))?,
                None => break,
            };
            unpacker.apply(&mut entry)?;
        }
    }

    unpacker.finalize_directory_times()?;

    // The reader stops at the first zero block; consume the rest of the trailer.
    io::copy(&mut archive.into_inner(), &mut io::sink())
        .map_err(|e| Error::from_stream("reading archive trailer", e))?;

    let summary = unpacker.summary;
    debug!(
        "Unpacked {} entries ({} whiteouts, {} skipped)",
        summary.entries, summary.whiteouts, summary.skipped
    );
    Ok(summary)
}

struct PendingDir {
    path: PathBuf,
    mode: u32,
    atime: SystemTime,
    mtime: SystemTime,
}

struct Unpacker {
    root: PathBuf,
    options: UnpackOptions,
    privileged: bool,
    unpacked: HashSet<PathBuf>,
    dirs: Vec<PendingDir>,
    summary: UnpackSummary,
}

impl Unpacker {
    fn new(root: PathBuf, options: UnpackOptions) -> Self {
        let privileged = options.platform.is_privileged();
        Self {
            root,
            options,
            privileged,
            unpacked: HashSet::new(),
            dirs: Vec::new(),
            summary: UnpackSummary::default(),
        }
    }

    fn apply<R: Read>(&mut self, entry: &mut tar::Entry<'_, R>) -> Result<()> {
        let mut meta = TarEntry::from_entry(entry)?;
        let name = normalize_entry_path(&meta.name).ok_or_else(|| self.traversal(&meta.name))?;
        if name.as_os_str().is_empty() {
            trace!("Skipping root entry");
            self.summary.skipped += 1;
            return Ok(());
        }
        meta.name = name;

        if let Some(include) = &self.options.include {
            if !include(&meta) {
                trace!("Excluded by predicate: {}", meta.name.display());
                self.summary.skipped += 1;
                return Ok(());
            }
        }

        trace!(
            "Processing entry: path={}, kind={:?}, mode={:o}, uid={}, gid={}, size={}, mtime={}, link={:?}",
            meta.name.display(),
            meta.kind,
            meta.mode,
            meta.uid,
            meta.gid,
            meta.size,
            meta.mtime,
            meta.link_target
        );

        if let Some(whiteout) = classify_whiteout(&meta.name) {
            return self.apply_whiteout(&meta.name, whiteout);
        }

        let joined = self.root.join(&meta.name);
        self.ensure_parent(&joined, &meta.name)?;
        // Work on the resolved path so that aliases through symlinked
        // directories record the same path as the real location.
        let parent = self.resolve_inside_root(&joined, &meta.name)?;
        let full_path = match (parent, joined.file_name()) {
            (Some(parent), Some(file_name)) => parent.join(file_name),
            _ => return Err(self.traversal(&meta.name)),
        };

        let mut links_to_symlink = false;
        match meta.kind {
            EntryKind::Directory => self.create_directory(&full_path)?,
            EntryKind::Regular => {
                self.replace_existing(&full_path)?;
                create_file(entry, &full_path, meta.size)?;
            }
            kind if kind.is_special() => {
                self.replace_existing(&full_path)?;
                self.options
                    .platform
                    .create_special_file(
                        &full_path,
                        meta.kind,
                        meta.device_major,
                        meta.device_minor,
                        meta.mode,
                    )
                    .map_err(|e| Error::io("create special file", &full_path, e))?;
            }
            EntryKind::Symlink => self.create_symlink(&full_path, &meta)?,
            EntryKind::HardLink => {
                links_to_symlink = self.create_hardlink(&full_path, &meta)?;
            }
            _ => {
                return Err(Error::UnsupportedEntryType {
                    name: meta.name.display().to_string(),
                    kind: format!("{:?}", meta.kind),
                })
            }
        }

        self.set_ownership(&full_path, &meta)?;
        self.set_xattrs(&full_path, &meta)?;
        self.set_permissions(&full_path, &meta, links_to_symlink)?;
        let (atime, mtime) = entry_times(&meta);
        self.set_times(&full_path, meta.kind, links_to_symlink, atime, mtime)?;

        if meta.kind == EntryKind::Directory {
            self.dirs.push(PendingDir {
                path: full_path.clone(),
                mode: meta.mode,
                atime,
                mtime,
            });
        }
        self.unpacked.insert(full_path);
        self.summary.entries += 1;
        Ok(())
    }

    fn traversal(&self, name: &Path) -> Error {
        Error::PathTraversal {
            name: name.display().to_string(),
            root: self.root.clone(),
        }
    }

    fn apply_whiteout(&mut self, name: &Path, whiteout: Whiteout) -> Result<()> {
        match whiteout {
            Whiteout::Reserved => {
                debug!("Skipping reserved entry {}", name.display());
                self.summary.skipped += 1;
            }
            Whiteout::Malformed => return Err(self.traversal(name)),
            Whiteout::Remove(target) => {
                let joined = self.root.join(&target);
                if let Some(parent) = self.resolve_inside_root(&joined, name)? {
                    let file_name = joined.file_name().ok_or_else(|| self.traversal(name))?;
                    let target = parent.join(file_name);
                    if remove_path(&target)? {
                        debug!("Whiteout removed {}", target.display());
                    }
                    self.unpacked.retain(|p| !p.starts_with(&target));
                }
                self.summary.whiteouts += 1;
            }
            Whiteout::Opaque(dir) => {
                let dir = self.root.join(dir);
                self.apply_opaque(&dir, name)?;
                self.summary.whiteouts += 1;
            }
        }
        Ok(())
    }

    /// Canonicalize the parent of `path` and check it stays under the root.
    ///
    /// Returns `None` when the parent does not exist.
    fn resolve_inside_root(&self, path: &Path, name: &Path) -> Result<Option<PathBuf>> {
        let parent = match path.parent() {
            Some(parent) => parent,
            None => return Err(self.traversal(name)),
        };
        let canonical = match fs::canonicalize(parent) {
            Ok(p) => p,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(Error::io("resolve", parent, e)),
        };
        if !canonical.starts_with(&self.root) {
            return Err(self.traversal(name));
        }
        Ok(Some(canonical))
    }

    /// Remove everything below `dir` that this unpack did not create, keeping
    /// directories that lead to something it did.
    fn apply_opaque(&self, dir: &Path, name: &Path) -> Result<()> {
        let canonical = match fs::canonicalize(dir) {
            Ok(p) => p,
            Err(e) if is_missing(&e) => return Ok(()),
            Err(e) => return Err(Error::io("resolve", dir, e)),
        };
        if !canonical.starts_with(&self.root) {
            return Err(self.traversal(name));
        }
        if !canonical.is_dir() {
            return Ok(());
        }

        // Recorded paths are resolved, so compare against the resolved directory.
        let mut keep: HashSet<&Path> = HashSet::new();
        for path in &self.unpacked {
            if !path.starts_with(&canonical) {
                continue;
            }
            for ancestor in path.ancestors() {
                if ancestor == canonical.as_path() {
                    break;
                }
                keep.insert(ancestor);
            }
        }

        let mut walker = WalkDir::new(&canonical)
            .min_depth(1)
            .follow_links(false)
            .into_iter();
        while let Some(item) = walker.next() {
            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    let path = e.path().unwrap_or(canonical.as_path()).to_path_buf();
                    match e.into_io_error() {
                        Some(io_err) if is_missing(&io_err) => continue,
                        Some(io_err) => return Err(Error::io("walk", path, io_err)),
                        None => continue,
                    }
                }
            };
            if keep.contains(item.path()) {
                continue;
            }
            if item.file_type().is_dir() {
                walker.skip_current_dir();
            }
            if remove_path(item.path())? {
                debug!("Opaque whiteout removed {}", item.path().display());
            }
        }
        Ok(())
    }

    /// Create the missing parents of `full_path`.
    ///
    /// The deepest existing ancestor is resolved through symlinks first, so a
    /// symlink planted by an earlier entry cannot redirect writes out of the root.
    fn ensure_parent(&self, full_path: &Path, name: &Path) -> Result<()> {
        let parent = match full_path.parent() {
            Some(parent) => parent,
            None => return Err(self.traversal(name)),
        };

        let mut existing = parent;
        let canonical = loop {
            match fs::canonicalize(existing) {
                Ok(p) => break p,
                Err(e) if is_missing(&e) => {
                    existing = existing.parent().ok_or_else(|| self.traversal(name))?;
                }
                Err(e) => return Err(Error::io("resolve", existing, e)),
            }
        };
        if !canonical.starts_with(&self.root) {
            return Err(self.traversal(name));
        }
        if existing == parent {
            if canonical.is_dir() {
                return Ok(());
            }
            return Err(Error::DirectoryConflict {
                path: parent.to_path_buf(),
            });
        }

        fs::create_dir_all(parent).map_err(|e| match e.raw_os_error() {
            Some(libc::ENOTDIR) | Some(libc::EEXIST) => Error::DirectoryConflict {
                path: parent.to_path_buf(),
            },
            _ => Error::io("create parent directory", parent, e),
        })
    }

    fn create_directory(&self, path: &Path) -> Result<()> {
        match fs::symlink_metadata(path) {
            Ok(m) if m.is_dir() => Ok(()),
            Ok(_) => Err(Error::DirectoryConflict {
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(path).map_err(|e| Error::io("create directory", path, e))
            }
            Err(e) => Err(Error::io("stat", path, e)),
        }
    }

    /// Clear whatever occupies `path` before a non-directory is written there.
    fn replace_existing(&mut self, path: &Path) -> Result<()> {
        match fs::symlink_metadata(path) {
            Ok(m) if m.is_dir() => {
                fs::remove_dir_all(path).map_err(|e| Error::io("remove", path, e))?;
                self.unpacked.retain(|p| !p.starts_with(path));
            }
            Ok(_) => fs::remove_file(path).map_err(|e| Error::io("remove", path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("stat", path, e)),
        }
        Ok(())
    }

    fn create_symlink(&mut self, path: &Path, meta: &TarEntry) -> Result<()> {
        let target = meta
            .link_target
            .as_deref()
            .ok_or_else(|| Error::corrupt(format!("symlink without target: {}", meta.name.display())))?;

        let base = if target.is_absolute() {
            self.root.clone()
        } else {
            self.resolve_inside_root(path, &meta.name)?
                .ok_or_else(|| self.traversal(&meta.name))?
        };
        let resolved = resolve_lexically(&base, target);
        if !resolved.starts_with(&self.root) {
            return Err(Error::PathTraversal {
                name: format!("{} -> {}", meta.name.display(), target.display()),
                root: self.root.clone(),
            });
        }

        self.replace_existing(path)?;
        std::os::unix::fs::symlink(target, path).map_err(|e| Error::io("create symlink", path, e))
    }

    /// Returns whether the link target is itself a symlink.
    fn create_hardlink(&mut self, path: &Path, meta: &TarEntry) -> Result<bool> {
        let target = meta
            .link_target
            .as_deref()
            .ok_or_else(|| Error::corrupt(format!("hardlink without target: {}", meta.name.display())))?;
        let target_name = normalize_entry_path(target)
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| Error::PathTraversal {
                name: format!("{} => {}", meta.name.display(), target.display()),
                root: self.root.clone(),
            })?;
        let joined = self.root.join(&target_name);
        let target_path = match (self.resolve_inside_root(&joined, target)?, joined.file_name()) {
            (Some(parent), Some(file_name)) => parent.join(file_name),
            _ => {
                return Err(Error::io(
                    "hard link to",
                    &joined,
                    io::Error::from(io::ErrorKind::NotFound),
                ))
            }
        };
        let target_meta = fs::symlink_metadata(&target_path)
            .map_err(|e| Error::io("hard link to", &target_path, e))?;
        if target_meta.is_dir() {
            return Err(Error::UnsupportedEntryType {
                name: meta.name.display().to_string(),
                kind: "hardlink to directory".to_string(),
            });
        }

        if target_path != path {
            self.replace_existing(path)?;
            fs::hard_link(&target_path, path).map_err(|e| Error::io("create hardlink", path, e))?;
        }
        Ok(target_meta.file_type().is_symlink())
    }

    fn set_ownership(&self, path: &Path, meta: &TarEntry) -> Result<()> {
        match self.options.platform.lchown(path, meta.uid, meta.gid) {
            Ok(()) => Ok(()),
            Err(e) if !self.privileged && e.raw_os_error() == Some(libc::EPERM) => {
                debug!(
                    "Ignoring ownership {}:{} for {} (not privileged)",
                    meta.uid,
                    meta.gid,
                    path.display()
                );
                Ok(())
            }
            Err(e) => Err(Error::io("change ownership of", path, e)),
        }
    }

    /// Restore extended attributes recorded in the archive.
    ///
    /// `trusted.*` and `security.*` need privileges and are skipped otherwise.
    /// Filesystems without xattr support and `user.*` on objects that refuse
    /// them are logged and ignored.
    fn set_xattrs(&self, path: &Path, meta: &TarEntry) -> Result<()> {
        for (key, value) in &meta.xattrs {
            let privileged_key = key.starts_with("trusted.") || key.starts_with("security.");
            if privileged_key && !self.privileged {
                trace!("Skipping privileged xattr {} on {}", key, path.display());
                continue;
            }
            match xattr::set(path, key, value) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => {
                    warn!("Ignoring unsupported xattr {} on {}", key, path.display());
                }
                Err(e)
                    if e.raw_os_error() == Some(libc::EPERM)
                        && key.starts_with("user.")
                        && !matches!(meta.kind, EntryKind::Regular | EntryKind::Directory) =>
                {
                    warn!(
                        "Ignoring xattr {} on {} (not allowed on {:?})",
                        key,
                        path.display(),
                        meta.kind
                    );
                }
                Err(e) => return Err(Error::io("set xattr on", path, e)),
            }
        }
        Ok(())
    }

    fn set_permissions(&self, path: &Path, meta: &TarEntry, links_to_symlink: bool) -> Result<()> {
        if meta.kind == EntryKind::Symlink || links_to_symlink {
            return Ok(());
        }
        // Unprivileged unpacks keep directories writable until the final pass.
        let mode = if meta.kind == EntryKind::Directory && !self.privileged {
            meta.mode | 0o700
        } else {
            meta.mode
        };
        fs::set_permissions(path, Permissions::from_mode(mode))
            .map_err(|e| Error::io("set permissions on", path, e))
    }

    fn set_times(
        &self,
        path: &Path,
        kind: EntryKind,
        links_to_symlink: bool,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> Result<()> {
        let res = match kind {
            EntryKind::Symlink => self.options.platform.set_symlink_times(path, atime, mtime),
            EntryKind::HardLink if links_to_symlink => return Ok(()),
            _ => self.options.platform.set_times(path, atime, mtime),
        };
        res.map_err(|e| Error::io("set times on", path, e))
    }

    /// Re-apply directory modes and times in the order directories were first seen.
    fn finalize_directory_times(&self) -> Result<()> {
        for dir in &self.dirs {
            match fs::symlink_metadata(&dir.path) {
                Ok(m) if m.is_dir() => {}
                _ => {
                    trace!("Skipping removed directory {}", dir.path.display());
                    continue;
                }
            }
            fs::set_permissions(&dir.path, Permissions::from_mode(dir.mode))
                .map_err(|e| Error::io("set permissions on", &dir.path, e))?;
            self.options
                .platform
                .set_times(&dir.path, dir.atime, dir.mtime)
                .map_err(|e| Error::io("set times on", &dir.path, e))?;
        }
        Ok(())
    }
}

/// Access and modification time for `meta`, clamped, with atime never before mtime.
fn entry_times(meta: &TarEntry) -> (SystemTime, SystemTime) {
    let mtime = clamp_time(unix_time(meta.mtime));
    let atime = meta
        .atime
        .map(|t| clamp_time(unix_time(t)))
        .unwrap_or(mtime);
    (latest_time(atime, mtime), mtime)
}

fn create_file<R: Read>(body: &mut R, path: &Path, size: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| Error::OpenFailure {
            path: path.to_path_buf(),
            source: e,
        })?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                return Err(Error::from_stream(
                    format!("reading content of {}", path.display()),
                    e,
                ))
            }
        };
        file.write_all(&buf[..n]).map_err(|e| Error::WriteFailure {
            path: path.to_path_buf(),
            source: e,
        })?;
        written += n as u64;
    }
    if written != size {
        return Err(Error::corrupt(format!(
            "{} ended after {} of {} bytes",
            path.display(),
            written,
            size
        )));
    }
    Ok(())
}

/// Remove a file or a whole subtree. Returns false when nothing was there.
fn remove_path(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if is_missing(&e) => return Ok(false),
        Err(e) => return Err(Error::io("stat", path, e)),
    };
    let res = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match res {
        Ok(()) => Ok(true),
        Err(e) if is_missing(&e) => Ok(false),
        Err(e) => Err(Error::io("remove", path, e)),
    }
}

fn is_missing(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound || err.raw_os_error() == Some(libc::ENOTDIR)
}

/// Lexically normalize an archive name into a relative path.
///
/// Leading `/` is dropped; `None` when `..` climbs above the root.
fn normalize_entry_path(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }
    Some(out)
}

/// Join `target` onto `base` without touching the filesystem.
fn resolve_lexically(base: &Path, target: &Path) -> PathBuf {
    let mut out = base.to_path_buf();
    for comp in target.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    out
}
